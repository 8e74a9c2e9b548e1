//! Market Data Client
//!
//! The facade a chart integration talks to. REST calls go through the
//! [`RequestClient`]; streaming subscriptions go to the realtime engine
//! task, which owns the socket.
//!
//! # Usage
//!
//! ```ignore
//! use realtime_datafeed::{DatafeedConfig, MarketDataClient, bar_handler};
//!
//! let client = MarketDataClient::new(DatafeedConfig::from_env()?)?;
//! let info = client.resolve_symbol("AAPL", None).await?;
//! client
//!     .subscribe_bars(&info, "1", "chart-1", bar_handler(|bar| println!("{bar:?}")), None)
//!     .await?;
//! ```

mod types;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::application::ports::{Clock, Connector, SystemClock};
use crate::domain::bars::BarKey;
use crate::domain::connection::{ConnectionState, StateChange};
use crate::domain::subscription::{
    BarHandler, BarSubscription, QuoteHandler, QuoteSubscription, QuoteUpsert, ResetCacheHandler,
};
use crate::infrastructure::config::{ConfigError, DatafeedConfig};
use crate::infrastructure::http::{RequestClient, RequestError, RequestOptions, RequestStats};
use crate::infrastructure::realtime::engine::{
    EngineDiagnostics, EngineHandle, EngineSettings, EngineStopped, RealtimeEngine,
};
use crate::infrastructure::realtime::resync::ResyncRequest;
use crate::infrastructure::realtime::websocket::WebSocketConnector;

pub use types::{
    DatafeedConfiguration, HistoryResult, PeriodParams, QuoteSymbol, SymbolInfo, array_or_empty,
    normalize_symbols, parse_history, parse_symbol, quote_request_payload,
};

const CONFIG_ENDPOINT: &str = "/api/datafeed/config";
const SEARCH_ENDPOINT: &str = "/api/datafeed/search";
const SEARCH_FULL_ENDPOINT: &str = "/api/datafeed/search/full";
const SYMBOLS_ENDPOINT: &str = "/api/datafeed/symbols";
const HISTORY_ENDPOINT: &str = "/api/datafeed/history";
const QUOTES_ENDPOINT: &str = "/api/datafeed/quotes";

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by [`MarketDataClient`].
#[derive(Debug, thiserror::Error)]
pub enum DatafeedError {
    /// REST call failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The backend does not know the symbol.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The symbol payload could not be decoded.
    #[error("invalid symbol payload: {0}")]
    InvalidSymbol(String),

    /// The history payload has an unexpected shape.
    #[error("invalid history response: {0}")]
    InvalidHistory(String),

    /// Symbol info has neither a ticker nor a name.
    #[error("symbol info has neither ticker nor name")]
    MissingSymbol,

    /// Quote listener id is empty.
    #[error("listener GUID is required")]
    MissingListener,

    /// Bar subscriber id is empty.
    #[error("subscriber UID is required")]
    MissingSubscriber,

    /// The realtime engine has exited.
    #[error(transparent)]
    EngineStopped(#[from] EngineStopped),

    /// Configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Engine and request client state.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDiagnostics {
    /// Realtime engine snapshot.
    pub stream: EngineDiagnostics,
    /// REST counters.
    pub requests: RequestStats,
}

// =============================================================================
// Client
// =============================================================================

/// Market data client: REST calls plus multiplexed realtime subscriptions.
///
/// Must be created inside a tokio runtime; the realtime engine is spawned
/// on it immediately but connects only once something subscribes.
pub struct MarketDataClient {
    config: DatafeedConfig,
    http: RequestClient,
    engine: EngineHandle,
    task: Mutex<Option<JoinHandle<()>>>,
    configuration: RwLock<Option<DatafeedConfiguration>>,
}

impl std::fmt::Debug for MarketDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataClient")
            .field("base_url", &self.config.base_url)
            .field("state", &self.engine.state())
            .finish_non_exhaustive()
    }
}

impl MarketDataClient {
    /// Create a client using the WebSocket connector and the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: DatafeedConfig) -> Result<Self, DatafeedError> {
        Self::with_dependencies(config, Arc::new(WebSocketConnector::new()), Arc::new(SystemClock))
    }

    /// Create a client with an explicit connector and clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_dependencies(
        config: DatafeedConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DatafeedError> {
        let http = RequestClient::new(&config.base_url, config.request.clone())?;
        let (engine, task) =
            RealtimeEngine::spawn(EngineSettings::from_config(&config), connector, clock);

        tracing::info!(
            base_url = %config.base_url,
            realtime_url = %config.realtime_url(),
            "Market data client initialized"
        );

        Ok(Self {
            config,
            http,
            engine,
            task: Mutex::new(Some(task)),
            configuration: RwLock::new(None),
        })
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &DatafeedConfig {
        &self.config
    }

    /// Underlying request client.
    #[must_use]
    pub const fn requests(&self) -> &RequestClient {
        &self.http
    }

    // -------------------------------------------------------------------------
    // REST
    // -------------------------------------------------------------------------

    /// Chart capabilities, fetched once and memoised.
    ///
    /// A failed fetch resolves to the defaults and is retried on the next
    /// call.
    pub async fn on_ready(&self) -> DatafeedConfiguration {
        if let Some(configuration) = self.configuration.read().clone() {
            return configuration;
        }

        match self
            .http
            .get(CONFIG_ENDPOINT, &[], RequestOptions::default())
            .await
        {
            Ok(payload) => {
                let configuration = DatafeedConfiguration::from_payload(payload);
                *self.configuration.write() = Some(configuration.clone());
                configuration
            }
            Err(e) => {
                tracing::warn!(error = %e, "Datafeed configuration unavailable, using defaults");
                DatafeedConfiguration::default()
            }
        }
    }

    /// Quick symbol search. Failures yield an empty list.
    pub async fn search_symbols(&self, query: &str, exchange: &str, symbol_type: &str) -> Vec<Value> {
        let params = [("query", query), ("exchange", exchange), ("type", symbol_type)];
        match self
            .http
            .get(SEARCH_ENDPOINT, &params, RequestOptions::default())
            .await
        {
            Ok(payload) => {
                let results = array_or_empty(payload);
                tracing::debug!(query, results = results.len(), "Symbol search");
                results
            }
            Err(e) => {
                tracing::error!(query, error = %e, "Symbol search failed");
                Vec::new()
            }
        }
    }

    /// Paged symbol search. Failures yield an empty list.
    pub async fn search_symbols_full(&self, query: &str, symbol_type: &str, offset: u32) -> Vec<Value> {
        let offset = offset.to_string();
        let params = [("query", query), ("type", symbol_type), ("offset", offset.as_str())];
        match self
            .http
            .get(SEARCH_FULL_ENDPOINT, &params, RequestOptions::default())
            .await
        {
            Ok(payload) => array_or_empty(payload),
            Err(e) => {
                tracing::error!(query, error = %e, "Full symbol search failed");
                Vec::new()
            }
        }
    }

    /// Resolve symbol metadata.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::SymbolNotFound`] when the backend reports an
    /// error payload, or the request error.
    pub async fn resolve_symbol(
        &self,
        symbol: &str,
        session: Option<&str>,
    ) -> Result<SymbolInfo, DatafeedError> {
        let params = [("symbol", symbol), ("session", session.unwrap_or_default())];
        let payload = self
            .http
            .get(SYMBOLS_ENDPOINT, &params, RequestOptions::default())
            .await
            .inspect_err(|e| tracing::error!(symbol, error = %e, "Symbol resolution failed"))?;

        let info = parse_symbol(payload)?;
        tracing::info!(symbol, session = session.unwrap_or("default"), "Symbol resolved");
        Ok(info)
    }

    /// Fetch history bars and seed the bar cache with the last one.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::InvalidHistory`] for an unexpected payload,
    /// [`DatafeedError::MissingSymbol`] for empty symbol info, or the request
    /// error.
    pub async fn get_bars(
        &self,
        symbol_info: &SymbolInfo,
        resolution: &str,
        period: PeriodParams,
    ) -> Result<HistoryResult, DatafeedError> {
        let symbol = symbol_info.symbol().ok_or(DatafeedError::MissingSymbol)?;
        let from = period.from.to_string();
        let to = period.to.to_string();
        let params = [
            ("symbol", symbol),
            ("resolution", resolution),
            ("from", from.as_str()),
            ("to", to.as_str()),
            ("session", symbol_info.session().unwrap_or_default()),
        ];

        tracing::debug!(
            symbol,
            resolution,
            from = period.from,
            to = period.to,
            first_data_request = period.first_data_request,
            "Requesting history"
        );

        let payload = self
            .http
            .get(HISTORY_ENDPOINT, &params, RequestOptions::default())
            .await?;
        let history = parse_history(&payload)?;

        if let Some(last) = history.bars.last() {
            self.engine.seed_bar(BarKey::new(symbol, resolution), *last)?;
        }
        if history.no_data {
            tracing::warn!(symbol, resolution, "History returned no data");
        } else {
            tracing::info!(symbol, resolution, bars = history.bars.len(), "History loaded");
        }
        Ok(history)
    }

    /// Batch quote snapshot. An empty symbol list makes no request.
    ///
    /// # Errors
    ///
    /// Returns the request error.
    pub async fn get_quotes(&self, symbols: &[QuoteSymbol]) -> Result<Vec<Value>, DatafeedError> {
        fetch_quotes(&self.http, symbols).await
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Stream bars for one chart series.
    ///
    /// Re-subscribing an existing `uid` replaces it; a changed session
    /// invokes the new `on_reset_cache` once.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::MissingSymbol`] or
    /// [`DatafeedError::MissingSubscriber`] for unusable input.
    pub async fn subscribe_bars(
        &self,
        symbol_info: &SymbolInfo,
        resolution: &str,
        uid: &str,
        on_bar: BarHandler,
        on_reset_cache: Option<ResetCacheHandler>,
    ) -> Result<(), DatafeedError> {
        let symbol = symbol_info.symbol().ok_or(DatafeedError::MissingSymbol)?;
        let uid = non_empty(uid).ok_or(DatafeedError::MissingSubscriber)?;
        tracing::info!(symbol, resolution, subscriber_uid = uid, "Subscribing to bars");

        let subscription = BarSubscription {
            symbol: symbol.to_string(),
            resolution: resolution.to_string(),
            session: symbol_info.session().map(ToString::to_string),
            on_bar,
            on_reset_cache,
        };
        self.engine
            .subscribe_bars(uid.to_string(), subscription)
            .await?;
        Ok(())
    }

    /// Stop streaming bars for `uid`. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::MissingSubscriber`] for an empty id.
    pub async fn unsubscribe_bars(&self, uid: &str) -> Result<(), DatafeedError> {
        let uid = non_empty(uid).ok_or(DatafeedError::MissingSubscriber)?;
        tracing::info!(subscriber_uid = uid, "Unsubscribing from bars");
        self.engine.unsubscribe_bars(uid.to_string()).await?;
        Ok(())
    }

    /// Stream quotes for a symbol set.
    ///
    /// When the subscription is new or its symbols changed, a snapshot is
    /// fetched in the background and delivered through the same callback.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::MissingListener`] for an empty id.
    pub async fn subscribe_quotes(
        &self,
        symbols: &[QuoteSymbol],
        fast_symbols: &[QuoteSymbol],
        guid: &str,
        on_quotes: QuoteHandler,
    ) -> Result<QuoteUpsert, DatafeedError> {
        let guid = non_empty(guid).ok_or(DatafeedError::MissingListener)?;
        let subscription = QuoteSubscription {
            symbols: normalize_symbols(symbols),
            fast_symbols: normalize_symbols(fast_symbols),
            on_quotes,
        };
        let snapshot_symbols: Vec<QuoteSymbol> = subscription
            .all_symbols()
            .into_iter()
            .map(QuoteSymbol::Plain)
            .collect();
        tracing::info!(
            listener_guid = guid,
            symbols = subscription.symbols.len(),
            fast_symbols = subscription.fast_symbols.len(),
            "Subscribing to quotes"
        );

        let outcome = self
            .engine
            .subscribe_quotes(guid.to_string(), subscription)
            .await?;

        let changed = !matches!(outcome, QuoteUpsert::Unchanged);
        if changed && self.config.stream.initial_quote_snapshot && !snapshot_symbols.is_empty() {
            self.spawn_quote_snapshot(guid.to_string(), snapshot_symbols);
        }
        Ok(outcome)
    }

    /// Stop streaming quotes for `guid`. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::MissingListener`] for an empty id.
    pub async fn unsubscribe_quotes(&self, guid: &str) -> Result<(), DatafeedError> {
        let guid = non_empty(guid).ok_or(DatafeedError::MissingListener)?;
        tracing::info!(listener_guid = guid, "Unsubscribing from quotes");
        self.engine.unsubscribe_quotes(guid.to_string()).await?;
        Ok(())
    }

    fn spawn_quote_snapshot(&self, guid: String, symbols: Vec<QuoteSymbol>) {
        let http = self.http.clone();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            match fetch_quotes(&http, &symbols).await {
                Ok(quotes) => {
                    if engine.deliver_quotes(guid, quotes).is_err() {
                        tracing::debug!("Engine stopped before quote snapshot delivery");
                    }
                }
                Err(e) => {
                    tracing::warn!(listener_guid = %guid, error = %e, "Initial quote snapshot failed");
                }
            }
        });
    }

    /// Replay subscriptions now. A full resync also resets every series.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::EngineStopped`] after shutdown.
    pub async fn resync(&self, full: bool) -> Result<(), DatafeedError> {
        let request = if full {
            ResyncRequest::full("manual")
        } else {
            ResyncRequest::incremental("manual")
        };
        self.engine.resync(request).await?;
        Ok(())
    }

    /// Latest connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Receiver tracking the latest connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.engine.watch_state()
    }

    /// Receiver for every state transition from now on.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.engine.state_changes()
    }

    /// Report network reachability.
    ///
    /// Going offline closes the socket without spending reconnect attempts;
    /// coming back re-arms them and reconnects if anything is subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::EngineStopped`] after shutdown.
    pub async fn set_network_available(&self, available: bool) -> Result<(), DatafeedError> {
        self.engine.set_network_available(available).await?;
        Ok(())
    }

    /// Engine and request client state.
    ///
    /// # Errors
    ///
    /// Returns [`DatafeedError::EngineStopped`] after shutdown.
    pub async fn diagnostics(&self) -> Result<ClientDiagnostics, DatafeedError> {
        Ok(ClientDiagnostics {
            stream: self.engine.diagnostics().await?,
            requests: self.http.stats(),
        })
    }

    /// Close the socket, cancel timers, and stop the engine task.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.engine.shutdown().await.is_err() {
            tracing::debug!("Engine already stopped");
        }
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "Realtime engine task failed");
        }
        tracing::info!("Market data client shut down");
    }
}

async fn fetch_quotes(
    http: &RequestClient,
    symbols: &[QuoteSymbol],
) -> Result<Vec<Value>, DatafeedError> {
    let payload = quote_request_payload(symbols);
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    tracing::debug!(symbols = payload.len(), "Requesting quotes");

    let response = http
        .post_json(QUOTES_ENDPOINT, json!({ "symbols": payload }), RequestOptions::default())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Quote request failed"))?;
    Ok(array_or_empty(response))
}

fn non_empty(id: &str) -> Option<&str> {
    Some(id.trim()).filter(|id| !id.is_empty())
}
