//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations behind the application layer: the realtime
//! engine and its WebSocket connector, the REST request client, and the
//! ambient configuration, logging, and metrics plumbing.

/// Realtime streaming engine, wire protocol, and WebSocket connector.
pub mod realtime;

/// REST request client with deduplication and retry.
pub mod http;

/// Configuration loaded from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
