//! Connection Manager
//!
//! The connection state machine. It owns no socket itself; the engine
//! reports socket events and this type decides the next state, whether a
//! reconnect is scheduled, and whether the next successful open needs a
//! full resync.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Connected ◄──recovered── Degraded
//!      ▲                        │                   │  ▲                      ▲
//!      │ intentional/offline    │ failed            │  └──────open────┐       │ outage
//!      └────────────────────────┴───────► Reconnecting ◄──unexpected close    │
//!                                              │ budget spent                 │
//!                                              ▼                          Connected
//!                                            Error
//! ```
//!
//! Every transition is logged with its reason and published on a
//! `watch` channel (latest state) and a `broadcast` channel (history).

use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::domain::connection::{ConnectionState, StateChange};
use crate::infrastructure::metrics;
use crate::infrastructure::realtime::reconnect::{ReconnectConfig, ReconnectPolicy};

/// Capacity of the state change broadcast channel.
const STATE_CHANGE_CAPACITY: usize = 64;

/// How the registry should be replayed after a socket opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenResync {
    /// First successful connection: send whatever is not yet synchronized.
    Incremental,
    /// Any later connection: discard caches and replay everything.
    Full,
}

/// Connection state machine.
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    has_connected: bool,
    pending_full_reset: bool,
    awaiting_recovery: bool,
    exhausted: bool,
    network_available: bool,
    state_tx: watch::Sender<ConnectionState>,
    changes_tx: broadcast::Sender<StateChange>,
}

impl ConnectionManager {
    /// Create a manager in `Disconnected`.
    #[must_use]
    pub fn new(reconnect: ReconnectConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (changes_tx, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            state: ConnectionState::Disconnected,
            policy: ReconnectPolicy::new(reconnect),
            has_connected: false,
            pending_full_reset: false,
            awaiting_recovery: false,
            exhausted: false,
            network_available: true,
            state_tx,
            changes_tx,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Receiver tracking the latest state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Sender used to create change receivers.
    #[must_use]
    pub fn change_sender(&self) -> broadcast::Sender<StateChange> {
        self.changes_tx.clone()
    }

    /// Reconnect attempts scheduled since the last successful open.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.policy.attempt_count()
    }

    /// Whether the attempt budget has been spent.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether the network is believed reachable.
    #[must_use]
    pub const fn network_available(&self) -> bool {
        self.network_available
    }

    /// Whether the next open will replay everything.
    #[must_use]
    pub const fn pending_full_reset(&self) -> bool {
        self.pending_full_reset
    }

    /// A connection attempt is starting.
    pub fn begin_connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            self.transition(ConnectionState::Connecting, "connect");
        }
    }

    /// The socket opened. Returns how the registry must be replayed.
    pub fn on_open(&mut self) -> OpenResync {
        let resync = if self.has_connected || self.pending_full_reset {
            OpenResync::Full
        } else {
            OpenResync::Incremental
        };

        self.policy.reset();
        self.has_connected = true;
        self.pending_full_reset = false;
        self.awaiting_recovery = false;
        self.exhausted = false;
        self.transition(ConnectionState::Connected, "socket_open");
        resync
    }

    /// The socket closed or an attempt failed without the caller asking.
    ///
    /// Returns the backoff delay before the next attempt, or `None` once
    /// the attempt budget is spent.
    pub fn on_connection_lost(&mut self, reason: &str, force_full_reset: bool) -> Option<Duration> {
        if force_full_reset {
            self.pending_full_reset = true;
        }

        if let Some(delay) = self.policy.next_delay() {
            self.transition(ConnectionState::Reconnecting, reason);
            tracing::info!(
                attempt = self.policy.attempt_count(),
                delay_ms = delay.as_millis(),
                reason,
                "Scheduling reconnect"
            );
            metrics::record_reconnect_attempt();
            Some(delay)
        } else {
            self.exhausted = true;
            tracing::error!(
                attempts = self.policy.attempt_count(),
                reason,
                "Reconnect attempts exhausted; waiting for a new subscription or network change"
            );
            self.transition(ConnectionState::Error, "reconnect_attempts_exhausted");
            None
        }
    }

    /// A socket-level error event. The close path follows.
    pub fn on_socket_error(&mut self, error: &str) {
        self.transition(ConnectionState::Error, error);
    }

    /// The client closed the socket on purpose.
    pub fn on_intentional_close(&mut self, reason: &str) {
        self.transition(ConnectionState::Disconnected, reason);
    }

    /// The network went away. The next open replays everything.
    pub fn go_offline(&mut self) {
        self.network_available = false;
        self.pending_full_reset = true;
        self.transition(ConnectionState::Disconnected, "network_offline");
    }

    /// The network came back. Re-arms the attempt budget.
    pub fn go_online(&mut self) {
        self.network_available = true;
        self.pending_full_reset = true;
        self.rearm();
    }

    /// Re-arm the attempt budget after exhaustion.
    pub const fn rearm(&mut self) {
        self.policy.reset();
        self.exhausted = false;
    }

    /// The backend reported an upstream outage on an open socket.
    pub fn mark_degraded(&mut self, reason: &str) {
        if !self.state.is_open() {
            return;
        }
        self.awaiting_recovery = true;
        if self.state != ConnectionState::Degraded {
            self.transition(ConnectionState::Degraded, reason);
        }
    }

    /// The backend reported recovery. Returns true if a full resync is owed.
    pub fn mark_recovered(&mut self, reason: &str) -> bool {
        if !self.awaiting_recovery {
            return false;
        }
        self.awaiting_recovery = false;
        if self.state == ConnectionState::Degraded {
            self.transition(ConnectionState::Connected, reason);
        }
        true
    }

    fn transition(&mut self, to: ConnectionState, reason: &str) {
        let from = self.state;
        self.state = to;

        match to {
            ConnectionState::Reconnecting | ConnectionState::Degraded | ConnectionState::Error => {
                tracing::warn!(from = %from, to = %to, reason, "Connection state changed");
            }
            _ => tracing::info!(from = %from, to = %to, reason, "Connection state changed"),
        }

        metrics::set_connection_state(to);
        self.state_tx.send_replace(to);
        let _ = self.changes_tx.send(StateChange {
            from,
            to,
            reason: reason.to_string(),
        });
    }
}
