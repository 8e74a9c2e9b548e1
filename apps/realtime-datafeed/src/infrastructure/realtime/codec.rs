//! Realtime Frame Codec
//!
//! Encodes client frames to JSON text and decodes server text into
//! [`ServerMessage`] values. A text message may hold one frame object or a
//! JSON array of frames.
//!
//! Decoding never fails as a whole: unparseable input and unknown `type`
//! values become [`ServerMessage::Unrecognized`] so the dispatcher can log
//! and drop them.

use serde::de::DeserializeOwned;

use crate::infrastructure::realtime::messages::{ClientMessage, ServerMessage};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON codec for the realtime socket.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Serialize a client frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self, message: &ClientMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }

    /// Decode one inbound text message into its frames.
    #[must_use]
    pub fn decode(&self, text: &str) -> Vec<ServerMessage> {
        let value: serde_json::Value = match serde_json::from_str(text.trim()) {
            Ok(value) => value,
            Err(e) => {
                return vec![ServerMessage::Unrecognized {
                    kind: None,
                    reason: format!("invalid JSON: {e}"),
                }];
            }
        };

        match value {
            serde_json::Value::Array(items) => items.into_iter().map(Self::decode_value).collect(),
            other => vec![Self::decode_value(other)],
        }
    }

    /// Decode a single frame object.
    fn decode_value(value: serde_json::Value) -> ServerMessage {
        let Some(kind) = value.get("type").and_then(|v| v.as_str()).map(str::to_string) else {
            return ServerMessage::Unrecognized {
                kind: None,
                reason: "missing type discriminator".to_string(),
            };
        };

        let decoded = match kind.as_str() {
            "bar" => parse(value).map(ServerMessage::Bar),
            "quote" => parse(value).map(ServerMessage::Quote),
            "error" => parse(value).map(ServerMessage::Error),
            "subscribed" => parse(value).map(ServerMessage::Subscribed),
            "quote_subscribed" => parse(value).map(ServerMessage::QuoteSubscribed),
            "adapter_status" => parse(value).map(ServerMessage::AdapterStatus),
            "connection_status" => parse(value).map(ServerMessage::ConnectionStatus),
            "connection_reset" => parse(value).map(ServerMessage::ConnectionReset),
            "subscription_reset" => parse(value).map(ServerMessage::SubscriptionReset),
            "system_warning" => parse(value).map(ServerMessage::SystemWarning),
            "pong" => Ok(ServerMessage::Pong),
            "hello" => Ok(ServerMessage::Hello),
            _ => {
                return ServerMessage::Unrecognized {
                    reason: "unknown message type".to_string(),
                    kind: Some(kind.clone()),
                };
            }
        };

        decoded.unwrap_or_else(|e| ServerMessage::Unrecognized {
            reason: format!("malformed frame: {e}"),
            kind: Some(kind),
        })
    }
}

fn parse<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_single_bar() {
        let codec = JsonCodec::new();
        let frames = codec.decode(
            r#"{"type":"bar","subscriberUID":"A","bar":{"time":100,"open":1,"high":2,"low":0.5,"close":1.5,"volume":10}}"#,
        );
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerMessage::Bar(bar) => {
                assert_eq!(bar.subscriber_uid, "A");
                assert!((bar.bar.close - 1.5).abs() < f64::EPSILON);
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn decode_array_of_frames() {
        let codec = JsonCodec::new();
        let frames = codec.decode(
            r#"[{"type":"pong"},{"type":"connection_reset","reason":"restart"},{"type":"hello"}]"#,
        );
        let kinds: Vec<_> = frames.iter().map(ServerMessage::kind).collect();
        assert_eq!(kinds, vec!["pong", "connection_reset", "hello"]);
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        let codec = JsonCodec::new();
        let frames = codec.decode(r#"{"type":"futures_tick","x":1}"#);
        assert!(matches!(
            &frames[0],
            ServerMessage::Unrecognized { kind: Some(kind), .. } if kind == "futures_tick"
        ));
    }

    #[test]
    fn invalid_json_is_unrecognized() {
        let codec = JsonCodec::new();
        let frames = codec.decode("not json at all");
        assert!(matches!(
            &frames[0],
            ServerMessage::Unrecognized { kind: None, .. }
        ));
    }

    #[test]
    fn malformed_known_type_is_unrecognized() {
        let codec = JsonCodec::new();
        let frames = codec.decode(r#"{"type":"bar","subscriberUID":"A"}"#);
        assert!(matches!(
            &frames[0],
            ServerMessage::Unrecognized { kind: Some(kind), .. } if kind == "bar"
        ));
    }

    #[test]
    fn malformed_element_does_not_poison_array() {
        let codec = JsonCodec::new();
        let frames = codec.decode(r#"[{"type":"quote"},{"type":"pong"}]"#);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], ServerMessage::Pong));
    }

    #[test]
    fn system_warning_fields() {
        let codec = JsonCodec::new();
        let frames = codec.decode(
            r#"{"type":"system_warning","warningId":"w1","requiresAck":true,"message":"maintenance"}"#,
        );
        match &frames[0] {
            ServerMessage::SystemWarning(warning) => {
                assert_eq!(warning.warning_id, "w1");
                assert!(warning.requires_ack);
            }
            other => panic!("expected warning, got {other:?}"),
        }
    }

    #[test]
    fn encode_unsubscribe() {
        let codec = JsonCodec::new();
        let text = codec
            .encode(&ClientMessage::Unsubscribe {
                subscriber_uid: "A".to_string(),
            })
            .unwrap();
        assert_eq!(text, r#"{"type":"unsubscribe","subscriberUID":"A"}"#);
    }
}
