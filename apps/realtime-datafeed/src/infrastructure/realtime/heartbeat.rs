//! Heartbeat Manager
//!
//! Probes the realtime socket with periodic pings and reports a timeout
//! when no `pong` has arrived within `pong_timeout` of the last one (or of
//! the connection opening). The engine turns a timeout into a forced
//! reconnect followed by a full resync.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::StreamSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(40),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `StreamSettings`.
    #[must_use]
    pub const fn from_stream_settings(settings: &StreamSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// No pong within the timeout; the connection must be restarted.
    Timeout,
}

/// State shared between the heartbeat manager and the engine.
#[derive(Debug)]
pub struct HeartbeatState {
    last_ack: RwLock<Instant>,
    ping_sent_at: RwLock<Option<Instant>>,
    last_round_trip: RwLock<Option<Duration>>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state; the liveness clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_ack: RwLock::new(Instant::now()),
            ping_sent_at: RwLock::new(None),
            last_round_trip: RwLock::new(None),
        }
    }

    /// Record a pong, returning the round trip of the outstanding ping.
    pub fn record_pong(&self) -> Option<Duration> {
        let now = Instant::now();
        *self.last_ack.write() = now;
        let round_trip = self
            .ping_sent_at
            .write()
            .take()
            .map(|sent| now.saturating_duration_since(sent));
        if round_trip.is_some() {
            *self.last_round_trip.write() = round_trip;
        }
        round_trip
    }

    /// Mark that a ping went out.
    pub fn mark_ping_sent(&self) {
        *self.ping_sent_at.write() = Some(Instant::now());
    }

    /// Whether a ping is awaiting its pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.read().is_some()
    }

    /// Time of the last pong, or of the connection start.
    #[must_use]
    pub fn last_ack(&self) -> Instant {
        *self.last_ack.read()
    }

    /// Time since the last pong.
    #[must_use]
    pub fn time_since_ack(&self) -> Duration {
        self.last_ack.read().elapsed()
    }

    /// Most recent ping round trip.
    #[must_use]
    pub fn last_round_trip(&self) -> Option<Duration> {
        *self.last_round_trip.read()
    }
}

/// Heartbeat manager task for one connection.
///
/// # Example
///
/// ```rust,no_run
/// use realtime_datafeed::infrastructure::realtime::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(8);
///     let cancel = CancellationToken::new();
///
///     let manager = HeartbeatManager::new(
///         HeartbeatConfig::default(),
///         state.clone(),
///         event_tx,
///         cancel.clone(),
///     );
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => state.mark_ping_sent(),
///             HeartbeatEvent::Timeout => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is reported.
    ///
    /// The first ping is requested immediately.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let deadline = self.state.last_ack() + self.config.pong_timeout;

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    // A pong may have moved the deadline while we slept.
                    let silent_for = self.state.time_since_ack();
                    if silent_for >= self.config.pong_timeout {
                        tracing::warn!(
                            silent_ms = silent_for.as_millis(),
                            timeout_ms = self.config.pong_timeout.as_millis(),
                            "Heartbeat timeout detected"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                        break;
                    }
                }
                _ = interval.tick() => {
                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_manager(
        config: HeartbeatConfig,
    ) -> (
        Arc<HeartbeatState>,
        mpsc::Receiver<HeartbeatEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, event_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone());
        (state, event_rx, cancel, tokio::spawn(manager.run()))
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.pong_timeout, Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn state_tracks_round_trip() {
        let state = HeartbeatState::new();
        assert!(!state.is_waiting_for_pong());

        state.mark_ping_sent();
        assert!(state.is_waiting_for_pong());
        tokio::time::advance(Duration::from_millis(35)).await;

        assert_eq!(state.record_pong(), Some(Duration::from_millis(35)));
        assert!(!state.is_waiting_for_pong());
        assert_eq!(state.last_round_trip(), Some(Duration::from_millis(35)));
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_pong_refreshes_liveness_only() {
        let state = HeartbeatState::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(state.record_pong(), None);
        assert!(state.time_since_ack() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn first_ping_is_immediate() {
        let (_state, mut events, cancel, handle) = spawn_manager(HeartbeatConfig::default());
        let start = Instant::now();

        assert_eq!(events.recv().await, Some(HeartbeatEvent::SendPing));
        assert!(start.elapsed() < Duration::from_millis(1));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_silence() {
        let (_state, mut events, _cancel, handle) = spawn_manager(HeartbeatConfig::default());
        let start = Instant::now();

        let mut pings = 0;
        loop {
            match events.recv().await {
                Some(HeartbeatEvent::SendPing) => pings += 1,
                Some(HeartbeatEvent::Timeout) => break,
                None => panic!("manager exited without timeout"),
            }
        }

        assert_eq!(start.elapsed(), Duration::from_secs(40));
        assert_eq!(pings, 2);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_connection_alive() {
        let (state, mut events, cancel, handle) = spawn_manager(HeartbeatConfig::default());

        for _ in 0..6 {
            let event = events.recv().await;
            assert_eq!(event, Some(HeartbeatEvent::SendPing));
            state.mark_ping_sent();
            state.record_pong();
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manager_cancellation() {
        let (_state, _events, cancel, handle) = spawn_manager(HeartbeatConfig::new(
            Duration::from_secs(10),
            Duration::from_secs(10),
        ));

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
