//! Realtime Engine
//!
//! A single task that owns the socket, the subscription registry, the bar
//! cache, and the outbound queue. Everything that touches shared realtime
//! state runs inside this task, so there are no locks around it.
//!
//! The facade talks to the engine through [`EngineHandle`], which sends
//! [`Command`]s over an unbounded channel and awaits a oneshot reply. The
//! main loop multiplexes:
//!
//! 1. Commands from the handle
//! 2. Heartbeat events (ping due, pong timeout)
//! 3. Inbound frames from the socket
//! 4. Completion of a pending connect attempt
//! 5. The reconnect backoff deadline

use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Clock, Connection, Connector, FrameSink, FrameStream, TransportError,
};
use crate::domain::bars::{Bar, BarCache, BarKey};
use crate::domain::connection::{ConnectionState, StateChange};
use crate::domain::subscription::{
    BarSubscription, BarUpsert, QuoteSubscription, QuoteUpsert, SubscriptionKey,
    SubscriptionRegistry,
};
use crate::infrastructure::config::DatafeedConfig;
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::realtime::codec::JsonCodec;
use crate::infrastructure::realtime::connection::{ConnectionManager, OpenResync};
use crate::infrastructure::realtime::dispatcher::{Directive, StreamDispatcher, invoke_guarded};
use crate::infrastructure::realtime::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
};
use crate::infrastructure::realtime::messages::ClientMessage;
use crate::infrastructure::realtime::outbound::{EnqueueOutcome, OutboundQueue};
use crate::infrastructure::realtime::reconnect::ReconnectConfig;
use crate::infrastructure::realtime::resync::{PendingResync, ResyncEngine, ResyncRequest};

/// Upper bound on a single socket write.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the close handshake during an intentional close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Heartbeat event channel capacity.
const HEARTBEAT_CHANNEL_CAPACITY: usize = 8;

// =============================================================================
// Settings
// =============================================================================

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Realtime socket URL.
    pub url: String,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Bar cache capacity.
    pub cache_capacity: usize,
}

impl EngineSettings {
    /// Derive engine settings from the client configuration.
    #[must_use]
    pub fn from_config(config: &DatafeedConfig) -> Self {
        Self {
            url: config.realtime_url(),
            heartbeat: HeartbeatConfig::from_stream_settings(&config.stream),
            reconnect: ReconnectConfig::from_stream_settings(&config.stream),
            connect_timeout: config.stream.connect_timeout,
            queue_capacity: config.stream.outbound_queue_capacity,
            cache_capacity: config.stream.bar_cache_capacity,
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// The engine task is gone.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("realtime engine has stopped")]
pub struct EngineStopped;

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineDiagnostics {
    /// Connection state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether the attempt budget is spent.
    pub reconnect_exhausted: bool,
    /// Whether the network is believed reachable.
    pub network_available: bool,
    /// Frames waiting in the outbound queue.
    pub queue_depth: usize,
    /// Entries in the bar cache.
    pub cache_size: usize,
    /// Live bar subscriptions.
    pub bar_subscriptions: usize,
    /// Live quote subscriptions.
    pub quote_subscriptions: usize,
    /// Most recent ping/pong round trip.
    pub last_round_trip: Option<Duration>,
    /// Resync runs since the engine started.
    pub resync_runs: u64,
}

/// Requests the engine serves.
pub enum Command {
    /// Create or replace a bar subscription.
    SubscribeBars {
        /// Subscriber id.
        uid: String,
        /// The subscription.
        subscription: BarSubscription,
        /// Completion.
        reply: oneshot::Sender<()>,
    },
    /// Remove a bar subscription.
    UnsubscribeBars {
        /// Subscriber id.
        uid: String,
        /// Completion.
        reply: oneshot::Sender<()>,
    },
    /// Create or replace a quote subscription.
    SubscribeQuotes {
        /// Listener id.
        guid: String,
        /// The subscription.
        subscription: QuoteSubscription,
        /// How the registry changed.
        reply: oneshot::Sender<QuoteUpsert>,
    },
    /// Remove a quote subscription.
    UnsubscribeQuotes {
        /// Listener id.
        guid: String,
        /// Completion.
        reply: oneshot::Sender<()>,
    },
    /// Seed the bar cache with a history bar.
    SeedBar {
        /// Cache key.
        key: BarKey,
        /// Last history bar.
        bar: Bar,
    },
    /// Deliver a quote snapshot to a listener if it is still registered.
    DeliverQuotes {
        /// Listener id.
        guid: String,
        /// Quote payloads.
        quotes: Vec<serde_json::Value>,
    },
    /// Report network reachability.
    SetNetworkAvailable {
        /// Whether the network is reachable.
        available: bool,
        /// Completion.
        reply: oneshot::Sender<()>,
    },
    /// Run a resync now.
    Resync {
        /// What to resync.
        request: ResyncRequest,
        /// Completion.
        reply: oneshot::Sender<()>,
    },
    /// Snapshot diagnostics.
    Diagnostics {
        /// The snapshot.
        reply: oneshot::Sender<EngineDiagnostics>,
    },
    /// Close intentionally and stop.
    Shutdown {
        /// Completion.
        reply: oneshot::Sender<()>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SubscribeBars { .. } => "SubscribeBars",
            Self::UnsubscribeBars { .. } => "UnsubscribeBars",
            Self::SubscribeQuotes { .. } => "SubscribeQuotes",
            Self::UnsubscribeQuotes { .. } => "UnsubscribeQuotes",
            Self::SeedBar { .. } => "SeedBar",
            Self::DeliverQuotes { .. } => "DeliverQuotes",
            Self::SetNetworkAvailable { .. } => "SetNetworkAvailable",
            Self::Resync { .. } => "Resync",
            Self::Diagnostics { .. } => "Diagnostics",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    changes: broadcast::Sender<StateChange>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineStopped> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).map_err(|_| EngineStopped)?;
        response.await.map_err(|_| EngineStopped)
    }

    fn notify(&self, command: Command) -> Result<(), EngineStopped> {
        self.commands.send(command).map_err(|_| EngineStopped)
    }

    /// Register or replace a bar subscription.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn subscribe_bars(
        &self,
        uid: String,
        subscription: BarSubscription,
    ) -> Result<(), EngineStopped> {
        self.call(|reply| Command::SubscribeBars {
            uid,
            subscription,
            reply,
        })
        .await
    }

    /// Remove a bar subscription.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn unsubscribe_bars(&self, uid: String) -> Result<(), EngineStopped> {
        self.call(|reply| Command::UnsubscribeBars { uid, reply }).await
    }

    /// Register or replace a quote subscription.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn subscribe_quotes(
        &self,
        guid: String,
        subscription: QuoteSubscription,
    ) -> Result<QuoteUpsert, EngineStopped> {
        self.call(|reply| Command::SubscribeQuotes {
            guid,
            subscription,
            reply,
        })
        .await
    }

    /// Remove a quote subscription.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn unsubscribe_quotes(&self, guid: String) -> Result<(), EngineStopped> {
        self.call(|reply| Command::UnsubscribeQuotes { guid, reply })
            .await
    }

    /// Seed the bar cache.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub fn seed_bar(&self, key: BarKey, bar: Bar) -> Result<(), EngineStopped> {
        self.notify(Command::SeedBar { key, bar })
    }

    /// Deliver a quote snapshot through the listener's callback.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub fn deliver_quotes(
        &self,
        guid: String,
        quotes: Vec<serde_json::Value>,
    ) -> Result<(), EngineStopped> {
        self.notify(Command::DeliverQuotes { guid, quotes })
    }

    /// Report network reachability.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn set_network_available(&self, available: bool) -> Result<(), EngineStopped> {
        self.call(|reply| Command::SetNetworkAvailable { available, reply })
            .await
    }

    /// Run a resync.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn resync(&self, request: ResyncRequest) -> Result<(), EngineStopped> {
        self.call(|reply| Command::Resync { request, reply }).await
    }

    /// Snapshot diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn diagnostics(&self) -> Result<EngineDiagnostics, EngineStopped> {
        self.call(|reply| Command::Diagnostics { reply }).await
    }

    /// Close the socket and stop the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has already exited.
    pub async fn shutdown(&self) -> Result<(), EngineStopped> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    /// Latest connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver tracking the latest connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Receiver for every state transition from now on.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

// =============================================================================
// Engine
// =============================================================================

struct Heartbeat {
    state: Arc<HeartbeatState>,
    events: mpsc::Receiver<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Event {
    Command(Option<Command>),
    Heartbeat(Option<HeartbeatEvent>),
    Frame(Option<Result<String, TransportError>>),
    Opened(Result<Connection, TransportError>),
    ReconnectDue,
}

type PendingConnect = JoinHandle<Result<Connection, TransportError>>;

/// The realtime engine task.
pub struct RealtimeEngine {
    settings: EngineSettings,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    commands: mpsc::UnboundedReceiver<Command>,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    cache: BarCache,
    queue: OutboundQueue,
    codec: JsonCodec,
    dispatcher: StreamDispatcher,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    heartbeat: Option<Heartbeat>,
    connecting: Option<PendingConnect>,
    reconnect_at: Option<Instant>,
    last_round_trip: Option<Duration>,
    resync_runs: u64,
}

impl RealtimeEngine {
    /// Spawn the engine on the current runtime.
    ///
    /// Nothing connects until the first subscription arrives.
    #[must_use]
    pub fn spawn(
        settings: EngineSettings,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(settings.reconnect.clone());
        let handle = EngineHandle {
            commands: tx,
            state: connection.watch_state(),
            changes: connection.change_sender(),
        };

        let engine = Self {
            cache: BarCache::new(settings.cache_capacity),
            queue: OutboundQueue::new(settings.queue_capacity),
            settings,
            connector,
            clock,
            commands: rx,
            connection,
            registry: SubscriptionRegistry::new(),
            codec: JsonCodec::new(),
            dispatcher: StreamDispatcher::new(),
            sink: None,
            stream: None,
            heartbeat: None,
            connecting: None,
            reconnect_at: None,
            last_round_trip: None,
            resync_runs: 0,
        };

        let task = tokio::spawn(engine.run());
        (handle, task)
    }

    async fn run(mut self) {
        tracing::debug!(url = %self.settings.url, "Realtime engine started");

        loop {
            let event = tokio::select! {
                biased;

                command = self.commands.recv() => Event::Command(command),
                beat = next_heartbeat(&mut self.heartbeat) => Event::Heartbeat(beat),
                frame = next_frame(&mut self.stream) => Event::Frame(frame),
                opened = connect_result(&mut self.connecting) => Event::Opened(opened),
                () = reconnect_due(self.reconnect_at) => Event::ReconnectDue,
            };

            if !self.handle_event(event).await {
                break;
            }
        }

        tracing::debug!("Realtime engine stopped");
    }

    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Command(None) => {
                self.close("handle_dropped").await;
                return false;
            }
            Event::Command(Some(command)) => return self.handle_command(command).await,
            Event::Heartbeat(Some(HeartbeatEvent::SendPing)) => self.send_ping().await,
            Event::Heartbeat(Some(HeartbeatEvent::Timeout)) => {
                self.connection_lost("pong_timeout", true);
            }
            Event::Heartbeat(None) => self.heartbeat = None,
            Event::Frame(Some(Ok(text))) => self.handle_text(&text).await,
            Event::Frame(Some(Err(e))) => {
                tracing::warn!(error = %e, "Realtime socket error");
                self.connection.on_socket_error("socket_error");
                self.connection_lost("socket_error", false);
            }
            Event::Frame(None) => self.connection_lost("socket_closed", false),
            Event::Opened(result) => {
                self.connecting = None;
                match result {
                    Ok(link) => self.on_open(link).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "Realtime connect attempt failed");
                        self.connection_lost("connect_failed", false);
                    }
                }
            }
            Event::ReconnectDue => {
                self.reconnect_at = None;
                self.start_connect();
            }
        }
        true
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SubscribeBars {
                uid,
                subscription,
                reply,
            } => {
                self.subscribe_bars(uid, subscription).await;
                let _ = reply.send(());
            }
            Command::UnsubscribeBars { uid, reply } => {
                self.unsubscribe_bars(uid).await;
                let _ = reply.send(());
            }
            Command::SubscribeQuotes {
                guid,
                subscription,
                reply,
            } => {
                let outcome = self.subscribe_quotes(guid, subscription).await;
                let _ = reply.send(outcome);
            }
            Command::UnsubscribeQuotes { guid, reply } => {
                self.unsubscribe_quotes(guid).await;
                let _ = reply.send(());
            }
            Command::SeedBar { key, bar } => {
                if !self.cache.seed(key.clone(), bar) {
                    tracing::debug!(
                        series = %key,
                        time = bar.time,
                        "History bar older than cached bar"
                    );
                }
            }
            Command::DeliverQuotes { guid, quotes } => self.deliver_quotes(&guid, &quotes),
            Command::SetNetworkAvailable { available, reply } => {
                self.set_network_available(available).await;
                let _ = reply.send(());
            }
            Command::Resync { request, reply } => {
                self.resync(request).await;
                let _ = reply.send(());
            }
            Command::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Shutdown { reply } => {
                self.close("shutdown").await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    async fn subscribe_bars(&mut self, uid: String, subscription: BarSubscription) {
        let key = subscription.key();
        let on_reset = subscription.on_reset_cache.clone();

        match self.registry.upsert_bar(&uid, subscription) {
            BarUpsert::Created => {
                tracing::debug!(subscriber_uid = %uid, series = %key, "Bar subscription added");
            }
            BarUpsert::Replaced {
                session_changed: true,
            } => {
                tracing::info!(subscriber_uid = %uid, series = %key, "Session changed, resetting series");
                if let Some(handler) = on_reset {
                    invoke_guarded("on_reset_cache", &uid, || handler());
                }
                self.cache.remove(&key);
            }
            BarUpsert::Replaced { .. } => {
                tracing::debug!(subscriber_uid = %uid, series = %key, "Bar subscription replaced");
            }
        }
        self.publish_subscription_counts();

        if self.is_open() {
            self.sync_entry(SubscriptionKey::Bars(uid), true).await;
        } else {
            self.ensure_connected();
        }
    }

    async fn unsubscribe_bars(&mut self, uid: String) {
        if self.registry.remove_bar(&uid).is_some() {
            tracing::debug!(subscriber_uid = %uid, "Bar subscription removed");
            self.publish_subscription_counts();
            if self.is_open() {
                self.enqueue_or_send(ClientMessage::Unsubscribe {
                    subscriber_uid: uid,
                })
                .await;
            }
        }
        self.close_if_idle().await;
    }

    async fn subscribe_quotes(
        &mut self,
        guid: String,
        subscription: QuoteSubscription,
    ) -> QuoteUpsert {
        let outcome = self.registry.upsert_quote(&guid, subscription);
        tracing::debug!(listener_guid = %guid, outcome = ?outcome, "Quote subscription upserted");
        self.publish_subscription_counts();

        if self.is_open() {
            self.sync_entry(SubscriptionKey::Quotes(guid), false).await;
        } else {
            self.ensure_connected();
        }
        outcome
    }

    async fn unsubscribe_quotes(&mut self, guid: String) {
        if self.registry.remove_quote(&guid).is_some() {
            tracing::debug!(listener_guid = %guid, "Quote subscription removed");
            self.publish_subscription_counts();
            if self.is_open() {
                self.enqueue_or_send(ClientMessage::UnsubscribeQuotes {
                    listener_guid: guid,
                })
                .await;
            }
        }
        self.close_if_idle().await;
    }

    fn deliver_quotes(&self, guid: &str, quotes: &[serde_json::Value]) {
        let Some(subscription) = self.registry.quote(guid) else {
            tracing::debug!(listener_guid = %guid, "Quote snapshot for removed listener");
            return;
        };
        let on_quotes = &subscription.on_quotes;
        invoke_guarded("on_quotes", guid, || on_quotes(quotes));
    }

    /// Send the subscribe frame for one entry and record it as synchronized.
    async fn sync_entry(&mut self, key: SubscriptionKey, force: bool) {
        if !force && !self.registry.needs_sync(&key) {
            return;
        }
        let Some(send) = ResyncEngine::subscribe_frame(&self.registry, key) else {
            return;
        };
        if self.enqueue_or_send(send.message).await {
            self.registry.mark_synced(send.key, send.signature);
        }
    }

    fn publish_subscription_counts(&self) {
        metrics::set_subscriptions(self.registry.bar_count(), self.registry.quote_count());
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    fn is_open(&self) -> bool {
        self.sink.is_some() && self.connection.state().is_open()
    }

    fn ensure_connected(&mut self) {
        if self.connection.is_exhausted() {
            tracing::info!("Re-arming reconnect attempts for new subscription");
            self.connection.rearm();
        }
        if self.reconnect_at.is_none() {
            self.start_connect();
        }
    }

    fn start_connect(&mut self) {
        if self.sink.is_some() || self.connecting.is_some() {
            return;
        }
        if self.registry.is_empty()
            || !self.connection.network_available()
            || self.connection.is_exhausted()
        {
            return;
        }

        self.connection.begin_connect();

        let connector = Arc::clone(&self.connector);
        let url = self.settings.url.clone();
        let timeout = self.settings.connect_timeout;
        self.connecting = Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(timeout)),
            }
        }));
    }

    async fn on_open(&mut self, link: Connection) {
        if self.registry.is_empty() || !self.connection.network_available() {
            tracing::debug!("Socket opened with nothing to carry, closing");
            drop(link);
            self.connection.on_intentional_close("no_subscriptions");
            return;
        }

        self.sink = Some(link.sink);
        self.stream = Some(link.stream);
        self.start_heartbeat();

        let mode = self.connection.on_open();
        self.flush_queue().await;

        let request = match mode {
            OpenResync::Incremental => ResyncRequest::incremental("connected"),
            OpenResync::Full => ResyncRequest::full("reconnected"),
        };
        self.resync(request).await;
    }

    fn start_heartbeat(&mut self) {
        let state = Arc::new(HeartbeatState::new());
        let (tx, rx) = mpsc::channel(HEARTBEAT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(
            self.settings.heartbeat.clone(),
            Arc::clone(&state),
            tx,
            cancel.clone(),
        );
        tokio::spawn(manager.run());

        self.heartbeat = Some(Heartbeat {
            state,
            events: rx,
            cancel,
        });
    }

    fn teardown_link(&mut self) {
        self.sink = None;
        self.stream = None;
        self.heartbeat = None;
    }

    /// Unexpected loss of the socket or of a connect attempt.
    fn connection_lost(&mut self, reason: &str, force_full_reset: bool) {
        self.teardown_link();

        if self.registry.is_empty() {
            self.connection.on_intentional_close("no_subscriptions");
            return;
        }
        if !self.connection.network_available() {
            return;
        }

        self.reconnect_at = self
            .connection
            .on_connection_lost(reason, force_full_reset)
            .map(|delay| Instant::now() + delay);
    }

    /// Close on purpose. Cancels the pending attempt and the backoff timer.
    async fn close(&mut self, reason: &str) {
        if let Some(attempt) = self.connecting.take() {
            attempt.abort();
        }
        self.reconnect_at = None;
        self.heartbeat = None;
        self.stream = None;

        if let Some(mut sink) = self.sink.take()
            && tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err()
        {
            tracing::debug!("Close handshake timed out");
        }

        self.queue.clear();
        if self.connection.state() != ConnectionState::Disconnected {
            self.connection.on_intentional_close(reason);
        }
    }

    async fn close_if_idle(&mut self) {
        if !self.registry.is_empty() {
            return;
        }
        let active = self.sink.is_some()
            || self.connecting.is_some()
            || self.reconnect_at.is_some()
            || self.connection.state() != ConnectionState::Disconnected;
        if active {
            self.close("no_subscriptions").await;
        }
    }

    async fn set_network_available(&mut self, available: bool) {
        if available {
            self.connection.go_online();
            self.start_connect();
            return;
        }

        if !self.connection.network_available() {
            return;
        }
        if let Some(attempt) = self.connecting.take() {
            attempt.abort();
        }
        self.reconnect_at = None;
        self.teardown_link();
        self.connection.go_offline();
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    async fn write(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(TransportError::Closed);
        };
        let text = self
            .codec
            .encode(message)
            .map_err(|e| TransportError::Send(e.to_string()))?;

        match tokio::time::timeout(SEND_TIMEOUT, sink.send(text)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Send("send timed out".to_string())),
        }

        metrics::record_frame_sent(message.kind());
        tracing::trace!(kind = message.kind(), "Sent frame");
        Ok(())
    }

    /// Send now if open; otherwise queue, except subscription control which
    /// is dropped because the registry replays it. Returns whether the frame
    /// was written.
    /// Write a frame, or queue it for the next open socket.
    ///
    /// A frame whose write fails is queued like one offered while closed.
    async fn enqueue_or_send(&mut self, message: ClientMessage) -> bool {
        if self.is_open() {
            let Err(e) = self.write(&message).await else {
                return true;
            };
            tracing::warn!(error = %e, kind = message.kind(), "Failed to send frame");
            self.connection_lost("send_failed", false);
        }

        if message.is_subscription_control() {
            tracing::debug!(kind = message.kind(), "Socket not open, dropping subscription control");
            metrics::record_dropped(DropReason::DisconnectedControl);
            return false;
        }

        match self.queue.push(message) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Evicted(victim) => {
                tracing::debug!(
                    kind = victim.message.kind(),
                    priority = victim.priority.as_str(),
                    "Outbound queue full, evicted frame"
                );
                metrics::record_dropped(DropReason::QueueEvicted);
            }
            EnqueueOutcome::Rejected(rejected) => {
                tracing::debug!(
                    kind = rejected.message.kind(),
                    priority = rejected.priority.as_str(),
                    "Outbound queue full, rejected frame"
                );
                metrics::record_dropped(DropReason::QueueRejected);
            }
        }
        false
    }

    async fn flush_queue(&mut self) {
        let queued = self.queue.drain();
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "Flushing outbound queue");

        let mut pending = queued.into_iter();
        while let Some(item) = pending.next() {
            if let Err(e) = self.write(&item.message).await {
                let unsent: Vec<_> = std::iter::once(item).chain(pending).collect();
                tracing::warn!(error = %e, requeued = unsent.len(), "Flush interrupted");
                self.queue.restore(unsent);
                self.connection_lost("send_failed", false);
                return;
            }
        }
    }

    async fn send_ping(&mut self) {
        let timestamp = self.clock.now_millis();
        if self.enqueue_or_send(ClientMessage::Ping { timestamp }).await
            && let Some(heartbeat) = &self.heartbeat
        {
            heartbeat.state.mark_ping_sent();
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    async fn handle_text(&mut self, text: &str) {
        let frames = self.codec.decode(text);
        let mut pending = PendingResync::default();

        for frame in frames {
            let directive = self
                .dispatcher
                .dispatch(frame, &mut self.registry, &mut self.cache);
            let Some(directive) = directive else {
                continue;
            };

            match directive {
                Directive::Pong => self.on_pong(),
                Directive::Acknowledge(warning_id) => {
                    self.enqueue_or_send(ClientMessage::AckWarning { warning_id })
                        .await;
                }
                Directive::Resync(request) => pending.push(request),
                Directive::Health {
                    healthy,
                    reason,
                    force_reset,
                } => {
                    if healthy {
                        if self.connection.mark_recovered(&reason) || force_reset {
                            pending.push(ResyncRequest::full(reason));
                        }
                    } else {
                        self.connection.mark_degraded(&reason);
                        if force_reset {
                            pending.push(ResyncRequest::full(reason));
                        }
                    }
                }
            }

            if self.sink.is_none() {
                break;
            }
        }

        if let Some(request) = pending.take() {
            self.resync(request).await;
        }
    }

    fn on_pong(&mut self) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        if let Some(round_trip) = heartbeat.state.record_pong() {
            tracing::trace!(rtt_ms = round_trip.as_millis(), "Heartbeat round trip");
            metrics::record_heartbeat_round_trip(round_trip);
            self.last_round_trip = Some(round_trip);
        }
    }

    // -------------------------------------------------------------------------
    // Resync
    // -------------------------------------------------------------------------

    async fn resync(&mut self, request: ResyncRequest) {
        let plan = ResyncEngine::plan(&request, &self.registry);
        self.resync_runs += 1;
        metrics::record_resync(request.is_full());
        tracing::info!(
            full = request.is_full(),
            reason = %request.reason,
            resets = plan.reset_handlers.len(),
            sends = plan.sends.len(),
            "Resyncing subscriptions"
        );

        for (uid, handler) in &plan.reset_handlers {
            invoke_guarded("on_reset_cache", uid, || handler());
        }
        self.cache.remove_all(&plan.clear_keys);
        self.registry.forget_delivered(&plan.clear_subscribers);
        if plan.clear_synced {
            self.registry.clear_synced();
        }

        for send in plan.sends {
            if !self.is_open() {
                tracing::debug!("Socket closed mid-resync, remaining entries wait for the next open");
                break;
            }
            if self.registry.live_signature(&send.key).as_ref() != Some(&send.signature) {
                continue;
            }
            if !self.enqueue_or_send(send.message).await {
                break;
            }
            self.registry.mark_synced(send.key, send.signature);
        }
    }

    fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            state: self.connection.state(),
            reconnect_attempts: self.connection.attempts(),
            reconnect_exhausted: self.connection.is_exhausted(),
            network_available: self.connection.network_available(),
            queue_depth: self.queue.len(),
            cache_size: self.cache.len(),
            bar_subscriptions: self.registry.bar_count(),
            quote_subscriptions: self.registry.quote_count(),
            last_round_trip: self.last_round_trip,
            resync_runs: self.resync_runs,
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Heartbeat>) -> Option<HeartbeatEvent> {
    match heartbeat {
        Some(beat) => beat.events.recv().await,
        None => future::pending().await,
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<Result<String, TransportError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn connect_result(
    attempt: &mut Option<PendingConnect>,
) -> Result<Connection, TransportError> {
    match attempt {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::ConnectFailed(e.to_string())),
        },
        None => future::pending().await,
    }
}

async fn reconnect_due(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = DatafeedConfig::new("https://feed.example.com/");
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.url, "wss://feed.example.com/ws/realtime");
        assert_eq!(settings.heartbeat.ping_interval, Duration::from_secs(20));
        assert_eq!(settings.heartbeat.pong_timeout, Duration::from_secs(40));
        assert_eq!(settings.reconnect.max_attempts, 15);
        assert_eq!(settings.queue_capacity, 500);
        assert_eq!(settings.cache_capacity, 1000);
    }

    #[test]
    fn command_debug_names_variant() {
        let (reply, _rx) = oneshot::channel();
        let command = Command::Diagnostics { reply };
        assert_eq!(format!("{command:?}"), "Diagnostics");
    }
}
