#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Realtime Datafeed - Resilient Market Data Client
//!
//! Keeps one multiplexed WebSocket connection to a charting backend and
//! carries many bar and quote subscriptions over it. Subscriptions survive
//! reconnects, server-initiated resets, and upstream outages; a companion
//! REST client serves configuration, search, symbol, history, and quote
//! calls with deduplication and retry.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types with no I/O
//!   - `bars`: OHLCV bars and the bounded last-bar cache
//!   - `subscription`: Desired subscriptions and their sync signatures
//!   - `connection`: Connection state vocabulary
//!
//! - **Application**: Ports and the facade
//!   - `ports`: Transport and clock seams
//!   - `datafeed`: `MarketDataClient`
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `realtime`: Engine task, wire messages, heartbeat, reconnect
//!   - `http`: REST request client
//!   - `config`, `telemetry`, `metrics`
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!  MarketDataClient ──►│ RealtimeEngine (single task) │◄──► WebSocket
//!        │   commands  │ registry · cache · queue     │
//!        │             └──────────────┬───────────────┘
//!        │                            ▼
//!        │                 on_bar / on_quotes / on_reset_cache
//!        ▼
//!   RequestClient ──► REST endpoints (dedupe + retry)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Ports and the client facade.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::bars::{Bar, BarCache, BarKey, CacheOutcome};
pub use domain::connection::{ConnectionState, StateChange};
pub use domain::subscription::{
    BarHandler, QuoteHandler, QuoteUpsert, ResetCacheHandler, bar_handler, quote_handler,
    reset_handler,
};

// Facade
pub use application::datafeed::{
    ClientDiagnostics, DatafeedConfiguration, DatafeedError, HistoryResult, MarketDataClient,
    PeriodParams, QuoteSymbol, SymbolInfo,
};

// Ports (for custom transports and tests)
pub use application::ports::{Clock, Connection, Connector, SystemClock, TransportError};

// Infrastructure config
pub use infrastructure::config::{ConfigError, DatafeedConfig, RequestSettings, StreamSettings};

// Request client
pub use infrastructure::http::{RequestClient, RequestError, RequestOptions, RequestStats};

// Realtime engine
pub use infrastructure::realtime::{EngineDiagnostics, WebSocketConnector};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
