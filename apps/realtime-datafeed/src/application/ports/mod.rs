//! Port Interfaces
//!
//! Contracts the realtime engine depends on, implemented by infrastructure
//! adapters and by test fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Connector`: opens one duplex text-frame connection
//! - `Clock`: wall-clock time for ping timestamps

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

// =============================================================================
// Transport
// =============================================================================

/// Errors raised by a transport connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The connection attempt did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The connection is not open.
    #[error("connection closed")]
    Closed,
}

/// Outbound half of a connection: serialized JSON frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a connection: text frames until the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open duplex connection.
pub struct Connection {
    /// Frames written by the client.
    pub sink: FrameSink,
    /// Frames received from the server; ends when the socket closes.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens streaming connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

// =============================================================================
// Clock
// =============================================================================

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_millis(&self) -> i64;
}

/// `Clock` backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
