//! Realtime Wire Message Types
//!
//! JSON frames exchanged over the realtime socket. Every frame carries a
//! `type` discriminator.
//!
//! # Client → Server
//! - `subscribe` / `unsubscribe`: bar series control
//! - `subscribe_quotes` / `unsubscribe_quotes`: quote listener control
//! - `ping`: liveness probe
//! - `ack_warning`: acknowledgment of a `system_warning`
//!
//! # Server → Client
//! - `bar`, `quote`: data
//! - `subscribed`, `quote_subscribed`: control acknowledgments
//! - `adapter_status`, `connection_status`: upstream health
//! - `connection_reset`, `subscription_reset`: resync requests
//! - `system_warning`, `error`, `pong`, `hello`

use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::bars::{Bar, number_or_zero};

// =============================================================================
// Priority
// =============================================================================

/// Outbound message priority. Ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Liveness traffic.
    Low,
    /// Acknowledgments.
    Normal,
    /// Subscription control.
    High,
}

impl Priority {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

// =============================================================================
// Client Messages
// =============================================================================

/// Frame sent from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe a bar series.
    Subscribe {
        /// Instrument symbol.
        symbol: String,
        /// Resolution string.
        resolution: String,
        /// Optional session identifier.
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        /// Subscriber UID.
        #[serde(rename = "subscriberUID")]
        subscriber_uid: String,
    },
    /// Unsubscribe a bar series.
    Unsubscribe {
        /// Subscriber UID.
        #[serde(rename = "subscriberUID")]
        subscriber_uid: String,
    },
    /// Subscribe a quote listener.
    SubscribeQuotes {
        /// Listener GUID.
        #[serde(rename = "listenerGUID")]
        listener_guid: String,
        /// Primary symbols.
        symbols: Vec<String>,
        /// Fast symbols.
        #[serde(rename = "fastSymbols")]
        fast_symbols: Vec<String>,
    },
    /// Unsubscribe a quote listener.
    UnsubscribeQuotes {
        /// Listener GUID.
        #[serde(rename = "listenerGUID")]
        listener_guid: String,
    },
    /// Liveness probe.
    Ping {
        /// Client time, epoch milliseconds.
        timestamp: i64,
    },
    /// Acknowledge a system warning.
    AckWarning {
        /// Warning identifier from the server.
        #[serde(rename = "warningId")]
        warning_id: String,
    },
}

impl ClientMessage {
    /// Priority used for queue admission.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        match self {
            Self::Subscribe { .. }
            | Self::Unsubscribe { .. }
            | Self::SubscribeQuotes { .. }
            | Self::UnsubscribeQuotes { .. } => Priority::High,
            Self::AckWarning { .. } => Priority::Normal,
            Self::Ping { .. } => Priority::Low,
        }
    }

    /// Whether this frame is subscription control, which is never queued.
    #[must_use]
    pub const fn is_subscription_control(&self) -> bool {
        matches!(
            self,
            Self::Subscribe { .. }
                | Self::Unsubscribe { .. }
                | Self::SubscribeQuotes { .. }
                | Self::UnsubscribeQuotes { .. }
        )
    }

    /// Wire `type` value.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::SubscribeQuotes { .. } => "subscribe_quotes",
            Self::UnsubscribeQuotes { .. } => "unsubscribe_quotes",
            Self::Ping { .. } => "ping",
            Self::AckWarning { .. } => "ack_warning",
        }
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Bar payload with lenient numeric fields.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RawBar {
    /// Bar time, epoch milliseconds.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub time: f64,
    /// Open price.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open: f64,
    /// High price.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub high: f64,
    /// Low price.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub low: f64,
    /// Close price.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub close: f64,
    /// Volume.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub volume: f64,
}

impl From<RawBar> for Bar {
    fn from(raw: RawBar) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let time = raw.time.round() as i64;
        Self {
            time,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
        }
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(number_or_zero(Some(&value)))
}

/// `bar` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct BarMessage {
    /// Target subscriber.
    #[serde(rename = "subscriberUID")]
    pub subscriber_uid: String,
    /// Bar values.
    pub bar: RawBar,
}

/// `quote` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteMessage {
    /// Target listener.
    #[serde(rename = "listenerGUID")]
    pub listener_guid: String,
    /// Quote objects, passed through to the listener untouched.
    pub quotes: Vec<serde_json::Value>,
}

/// `error` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorMessage {
    /// Error code (string or number).
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    /// Listener the error refers to, if any.
    #[serde(default, rename = "listenerGUID")]
    pub listener_guid: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

/// `subscribed` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribedMessage {
    /// Acknowledged subscriber.
    #[serde(default, rename = "subscriberUID")]
    pub subscriber_uid: Option<String>,
}

/// `quote_subscribed` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteSubscribedMessage {
    /// Acknowledged listener.
    #[serde(default, rename = "listenerGUID")]
    pub listener_guid: Option<String>,
}

/// `adapter_status` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterStatusMessage {
    /// Upstream status word.
    pub status: String,
    /// Optional explanation.
    #[serde(default)]
    pub reason: Option<String>,
    /// When true, the client must fully resync.
    #[serde(default)]
    pub reset: Option<bool>,
    /// Upstream auth token expiry, epoch milliseconds.
    #[serde(default, rename = "authTokenExpMs")]
    pub auth_token_exp_ms: Option<i64>,
}

/// `connection_status` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionStatusMessage {
    /// Upstream status word.
    pub status: String,
}

/// `connection_reset` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionResetMessage {
    /// Why the server reset.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `subscription_reset` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionResetMessage {
    /// Subscriber to resync.
    #[serde(rename = "subscriberUID")]
    pub subscriber_uid: String,
    /// Why the server reset it.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `system_warning` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemWarningMessage {
    /// Warning identifier, echoed in the acknowledgment.
    #[serde(rename = "warningId")]
    pub warning_id: String,
    /// Whether the server expects an `ack_warning`.
    #[serde(default, rename = "requiresAck")]
    pub requires_ack: bool,
    /// Warning text.
    #[serde(default)]
    pub message: Option<String>,
}

/// Frame received from the server.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Bar update.
    Bar(BarMessage),
    /// Quote batch.
    Quote(QuoteMessage),
    /// Server-side error report.
    Error(ErrorMessage),
    /// Bar subscription acknowledged.
    Subscribed(SubscribedMessage),
    /// Quote subscription acknowledged.
    QuoteSubscribed(QuoteSubscribedMessage),
    /// Upstream adapter health.
    AdapterStatus(AdapterStatusMessage),
    /// Upstream connection health.
    ConnectionStatus(ConnectionStatusMessage),
    /// Server lost its state; full resync required.
    ConnectionReset(ConnectionResetMessage),
    /// One subscriber must be resynced.
    SubscriptionReset(SubscriptionResetMessage),
    /// Operational warning.
    SystemWarning(SystemWarningMessage),
    /// Liveness acknowledgment.
    Pong,
    /// Greeting after connect.
    Hello,
    /// Unknown type or a frame that failed to parse.
    Unrecognized {
        /// The `type` value, if one could be read.
        kind: Option<String>,
        /// Why the frame was not understood.
        reason: String,
    },
}

impl ServerMessage {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bar(_) => "bar",
            Self::Quote(_) => "quote",
            Self::Error(_) => "error",
            Self::Subscribed(_) => "subscribed",
            Self::QuoteSubscribed(_) => "quote_subscribed",
            Self::AdapterStatus(_) => "adapter_status",
            Self::ConnectionStatus(_) => "connection_status",
            Self::ConnectionReset(_) => "connection_reset",
            Self::SubscriptionReset(_) => "subscription_reset",
            Self::SystemWarning(_) => "system_warning",
            Self::Pong => "pong",
            Self::Hello => "hello",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// Upstream status words treated as healthy.
pub const HEALTHY_STATUSES: &[&str] = &["ok", "up", "connected", "healthy", "online", "recovered"];

/// Whether an upstream status word means healthy.
#[must_use]
pub fn is_healthy_status(status: &str) -> bool {
    let status = status.trim().to_ascii_lowercase();
    HEALTHY_STATUSES.contains(&status.as_str())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn subscribe_wire_format() {
        let message = ClientMessage::Subscribe {
            symbol: "SSE:600519".to_string(),
            resolution: "1".to_string(),
            session: None,
            subscriber_uid: "A".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribe", "symbol": "SSE:600519", "resolution": "1", "subscriberUID": "A"})
        );
    }

    #[test]
    fn subscribe_includes_session_when_set() {
        let message = ClientMessage::Subscribe {
            symbol: "X".to_string(),
            resolution: "5".to_string(),
            session: Some("extended".to_string()),
            subscriber_uid: "A".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["session"], "extended");
    }

    #[test]
    fn subscribe_quotes_wire_format() {
        let message = ClientMessage::SubscribeQuotes {
            listener_guid: "L".to_string(),
            symbols: vec!["A".to_string()],
            fast_symbols: vec!["B".to_string()],
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribe_quotes", "listenerGUID": "L", "symbols": ["A"], "fastSymbols": ["B"]})
        );
    }

    #[test]
    fn ack_and_ping_wire_format() {
        let ack = ClientMessage::AckWarning {
            warning_id: "w1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "ack_warning", "warningId": "w1"})
        );
        let ping = ClientMessage::Ping { timestamp: 42 };
        assert_eq!(
            serde_json::to_value(&ping).unwrap(),
            json!({"type": "ping", "timestamp": 42})
        );
    }

    #[test]
    fn priorities() {
        assert_eq!(ClientMessage::Ping { timestamp: 0 }.priority(), Priority::Low);
        assert_eq!(
            ClientMessage::AckWarning {
                warning_id: String::new()
            }
            .priority(),
            Priority::Normal
        );
        assert_eq!(
            ClientMessage::UnsubscribeQuotes {
                listener_guid: String::new()
            }
            .priority(),
            Priority::High
        );
        assert!(Priority::High > Priority::Normal && Priority::Normal > Priority::Low);
    }

    #[test]
    fn control_classification() {
        assert!(
            ClientMessage::Unsubscribe {
                subscriber_uid: "A".to_string()
            }
            .is_subscription_control()
        );
        assert!(!ClientMessage::Ping { timestamp: 1 }.is_subscription_control());
    }

    #[test]
    fn raw_bar_accepts_strings_and_garbage() {
        let raw: RawBar = serde_json::from_value(json!({
            "time": "1700000000000",
            "open": 1.5,
            "high": "2.5",
            "low": null,
            "close": "n/a"
        }))
        .unwrap();
        let bar = Bar::from(raw);
        assert_eq!(bar.time, 1_700_000_000_000);
        assert!((bar.high - 2.5).abs() < f64::EPSILON);
        assert!(bar.low.abs() < f64::EPSILON);
        assert!(bar.close.abs() < f64::EPSILON);
        assert!(bar.volume.abs() < f64::EPSILON);
    }

    #[test_case("ok", true)]
    #[test_case("Recovered", true)]
    #[test_case(" online ", true)]
    #[test_case("down", false)]
    #[test_case("degraded", false)]
    fn healthy_statuses(status: &str, healthy: bool) {
        assert_eq!(is_healthy_status(status), healthy);
    }
}
