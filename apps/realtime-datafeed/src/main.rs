//! Realtime Datafeed Binary
//!
//! Streams one bar series and one quote listener and logs what arrives.
//! Useful for exercising a backend by hand.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin realtime-datafeed
//! ```
//!
//! # Environment Variables
//!
//! - `DATAFEED_BASE_URL`: Backend base URL (default: <http://localhost:3001>)
//! - `DATAFEED_DEMO_SYMBOL`: Symbol to stream (default: AAPL)
//! - `DATAFEED_DEMO_RESOLUTION`: Bar resolution (default: 1)
//! - `DATAFEED_METRICS_PORT`: Prometheus exporter port (default: 0, disabled)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: Log level (default: info)

use std::time::Duration;

use anyhow::Context;
use realtime_datafeed::infrastructure::telemetry;
use realtime_datafeed::{
    DatafeedConfig, MarketDataClient, PeriodParams, QuoteSymbol, bar_handler, init_metrics,
    quote_handler, reset_handler,
};
use tokio::signal;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// History window requested before streaming starts.
const HISTORY_WINDOW_SECS: i64 = 6 * 60 * 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting realtime datafeed");

    let config = DatafeedConfig::from_env().context("invalid datafeed configuration")?;
    log_config(&config);

    if let Some(addr) = config.metrics_addr() {
        init_metrics(Some(addr)).context("failed to start metrics exporter")?;
    }

    let symbol = std::env::var("DATAFEED_DEMO_SYMBOL").unwrap_or_else(|_| "AAPL".to_string());
    let resolution = std::env::var("DATAFEED_DEMO_RESOLUTION").unwrap_or_else(|_| "1".to_string());

    let client = MarketDataClient::new(config)?;

    let capabilities = client.on_ready().await;
    tracing::info!(
        resolutions = ?capabilities.supported_resolutions,
        "Datafeed capabilities"
    );

    let info = client.resolve_symbol(&symbol, None).await?;

    let now = chrono::Utc::now().timestamp();
    let history = client
        .get_bars(
            &info,
            &resolution,
            PeriodParams {
                from: now - HISTORY_WINDOW_SECS,
                to: now,
                first_data_request: true,
            },
        )
        .await;
    match history {
        Ok(history) => tracing::info!(bars = history.bars.len(), no_data = history.no_data, "History"),
        Err(e) => tracing::warn!(error = %e, "History unavailable"),
    }

    let mut changes = client.state_changes();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            tracing::info!(from = %change.from, to = %change.to, reason = %change.reason, "State");
        }
    });

    client
        .subscribe_bars(
            &info,
            &resolution,
            "demo-chart",
            bar_handler(|bar| {
                tracing::info!(time = bar.time, close = bar.close, volume = bar.volume, "Bar");
            }),
            Some(reset_handler(|| tracing::info!("Series reset requested"))),
        )
        .await?;

    client
        .subscribe_quotes(
            &[QuoteSymbol::from(symbol.as_str())],
            &[],
            "demo-quotes",
            quote_handler(|quotes| tracing::info!(count = quotes.len(), "Quotes")),
        )
        .await?;

    tracing::info!(symbol = %symbol, resolution = %resolution, "Streaming");

    await_shutdown().await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, client.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("Realtime datafeed stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &DatafeedConfig) {
    tracing::info!(
        base_url = %config.base_url,
        realtime_url = %config.realtime_url(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.stream.heartbeat_interval.as_secs(),
        max_reconnect_attempts = config.stream.max_reconnect_attempts,
        request_max_attempts = config.request.max_attempts,
        "Resilience settings"
    );
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
