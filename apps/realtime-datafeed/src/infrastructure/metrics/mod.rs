//! Prometheus Metrics Module
//!
//! Records client activity through the `metrics` facade. Without an
//! installed recorder every call is a no-op, so library code records
//! unconditionally.
//!
//! # Metrics Categories
//!
//! - **Frames**: Counts of frames received and sent by type
//! - **Drops**: Frames and bars discarded, by reason
//! - **Connection**: State gauge, reconnect attempts, resync runs
//! - **Latency**: Heartbeat round trip
//! - **HTTP**: Request outcomes by method

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Failure installing the Prometheus recorder.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The exporter could not be built.
    #[error("failed to build Prometheus exporter: {0}")]
    Build(#[from] BuildError),

    /// Another recorder owns the global slot.
    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}

/// Install the Prometheus recorder.
///
/// With a listen address, an HTTP endpoint serving `/metrics` is spawned on
/// the current tokio runtime. Repeated calls return the first handle.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or another recorder is
/// already installed.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = match listen {
        Some(addr) => {
            let (recorder, exporter) = PrometheusBuilder::new()
                .with_http_listener(addr)
                .build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|_| MetricsError::RecorderInstalled)?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Prometheus exporter stopped");
                }
            });
            tracing::info!(%addr, "Prometheus exporter listening");
            handle
        }
        None => PrometheusBuilder::new().install_recorder()?,
    };

    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "datafeed_frames_received_total",
        "Frames received on the realtime socket by type"
    );
    describe_counter!(
        "datafeed_frames_sent_total",
        "Frames written to the realtime socket by type"
    );
    describe_counter!(
        "datafeed_dropped_total",
        "Frames or bars discarded by reason"
    );
    describe_counter!(
        "datafeed_callback_panics_total",
        "Subscriber callbacks that panicked"
    );

    // Connection
    describe_gauge!(
        "datafeed_connection_state",
        "Connection state (0 disconnected .. 5 error)"
    );
    describe_counter!(
        "datafeed_reconnects_total",
        "Reconnect attempts scheduled"
    );
    describe_counter!("datafeed_resyncs_total", "Resync runs by scope");
    describe_gauge!(
        "datafeed_subscriptions",
        "Live subscriptions by kind"
    );

    // Latency
    describe_histogram!(
        "datafeed_heartbeat_round_trip_seconds",
        "Ping to pong round trip"
    );

    // HTTP
    describe_counter!(
        "datafeed_http_requests_total",
        "REST requests by method and outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why something was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Evicted from a full outbound queue.
    QueueEvicted,
    /// Refused by a full outbound queue.
    QueueRejected,
    /// Subscription control while the socket was not open.
    DisconnectedControl,
    /// Bar older than the cached one.
    StaleBar,
    /// Bar identical to the cached one.
    DuplicateBar,
    /// Data for a subscription that is not registered.
    UnknownTarget,
    /// Frame that could not be decoded or has an unknown type.
    Unrecognized,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueEvicted => "queue_evicted",
            Self::QueueRejected => "queue_rejected",
            Self::DisconnectedControl => "disconnected_control",
            Self::StaleBar => "stale_bar",
            Self::DuplicateBar => "duplicate_bar",
            Self::UnknownTarget => "unknown_target",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Outcome label for REST requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpOutcome {
    /// Settled successfully.
    Success,
    /// Settled with an error.
    Failure,
    /// Joined an identical in-flight request.
    Deduplicated,
    /// An attempt failed and another was scheduled.
    Retried,
}

impl HttpOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Deduplicated => "deduplicated",
            Self::Retried => "retried",
        }
    }
}

/// Record an inbound frame.
pub fn record_frame_received(kind: &'static str) {
    counter!("datafeed_frames_received_total", "kind" => kind).increment(1);
}

/// Record an outbound frame.
pub fn record_frame_sent(kind: &'static str) {
    counter!("datafeed_frames_sent_total", "kind" => kind).increment(1);
}

/// Record a discarded frame or bar.
pub fn record_dropped(reason: DropReason) {
    counter!("datafeed_dropped_total", "reason" => reason.as_str()).increment(1);
}

/// Record a panicking subscriber callback.
pub fn record_callback_panic(callback: &str) {
    counter!(
        "datafeed_callback_panics_total",
        "callback" => callback.to_string()
    )
    .increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("datafeed_connection_state").set(state.gauge_value());
}

/// Record a scheduled reconnect attempt.
pub fn record_reconnect_attempt() {
    counter!("datafeed_reconnects_total").increment(1);
}

/// Record a resync run.
pub fn record_resync(full: bool) {
    let scope = if full { "full" } else { "partial" };
    counter!("datafeed_resyncs_total", "scope" => scope).increment(1);
}

/// Update live subscription counts.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(bars: usize, quotes: usize) {
    gauge!("datafeed_subscriptions", "kind" => "bars").set(bars as f64);
    gauge!("datafeed_subscriptions", "kind" => "quotes").set(quotes as f64);
}

/// Record a heartbeat round trip.
pub fn record_heartbeat_round_trip(round_trip: Duration) {
    histogram!("datafeed_heartbeat_round_trip_seconds").record(round_trip.as_secs_f64());
}

/// Record a REST request outcome.
pub fn record_http_request(method: &'static str, outcome: HttpOutcome) {
    counter!(
        "datafeed_http_requests_total",
        "method" => method,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::QueueEvicted.as_str(), "queue_evicted");
        assert_eq!(DropReason::DisconnectedControl.as_str(), "disconnected_control");
        assert_eq!(DropReason::StaleBar.as_str(), "stale_bar");
        assert_eq!(DropReason::Unrecognized.as_str(), "unrecognized");
    }

    #[test]
    fn http_outcome_as_str() {
        assert_eq!(HttpOutcome::Success.as_str(), "success");
        assert_eq!(HttpOutcome::Deduplicated.as_str(), "deduplicated");
        assert_eq!(HttpOutcome::Retried.as_str(), "retried");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received("bar");
        record_dropped(DropReason::DuplicateBar);
        set_connection_state(ConnectionState::Degraded);
        record_heartbeat_round_trip(Duration::from_millis(12));
        record_http_request("GET", HttpOutcome::Failure);
    }
}
