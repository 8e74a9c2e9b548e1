//! Connection State Types
//!
//! The states the realtime connection moves through, and the change record
//! published to observers on every transition.

use std::fmt;

use serde::Serialize;

/// Current state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket and no pending attempt.
    #[default]
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Socket open and healthy.
    Connected,
    /// Waiting on backoff or retrying after an unexpected close.
    Reconnecting,
    /// Socket open but the backend reports an upstream outage.
    Degraded,
    /// Socket error, or reconnect attempts exhausted.
    Error,
}

impl ConnectionState {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }

    /// Whether frames may be written to the socket in this state.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Numeric value exported on the connection state gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Reconnecting => 3.0,
            Self::Degraded => 4.0,
            Self::Error => 5.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub from: ConnectionState,
    /// State after the transition.
    pub to: ConnectionState,
    /// Why the transition happened (`socket_open`, `pong_timeout`, ...).
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn only_connected_and_degraded_are_open() {
        assert!(ConnectionState::Connected.is_open());
        assert!(ConnectionState::Degraded.is_open());
        assert!(!ConnectionState::Connecting.is_open());
        assert!(!ConnectionState::Reconnecting.is_open());
        assert!(!ConnectionState::Disconnected.is_open());
        assert!(!ConnectionState::Error.is_open());
    }

    #[test]
    fn display_matches_label() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Error.as_str(), "error");
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
