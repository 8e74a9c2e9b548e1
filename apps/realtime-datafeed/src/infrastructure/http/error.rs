//! Request errors.

use thiserror::Error;

/// Errors from [`RequestClient`](super::RequestClient).
///
/// `Clone` so that deduplicated callers can share one settled result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The attempt timed out.
    #[error("request timed out")]
    Timeout,

    /// Connection or transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
        /// `Retry-After` in seconds, when the server sent one.
        retry_after: Option<u64>,
    },

    /// Response body was not valid JSON.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Every attempt failed with a retryable error.
    #[error("giving up after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        /// Attempts made.
        attempts: u32,
        /// The final failure.
        last: Box<RequestError>,
    },

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RequestError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status { status, .. } => matches!(*status, 408 | 429 | 500 | 502 | 503 | 504),
            Self::Decode(_) | Self::MaxRetriesExceeded { .. } | Self::InvalidRequest(_) => false,
        }
    }

    /// Server-requested delay before the next attempt.
    #[must_use]
    pub const fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status, looking through retry exhaustion.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::MaxRetriesExceeded { last, .. } => last.status(),
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_builder() {
            Self::InvalidRequest(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}
