//! HTTP Request Client
//!
//! Request/response calls to the datafeed REST endpoints, with in-flight
//! deduplication and retry on transient failures.

mod client;
mod error;

pub use client::{RequestClient, RequestOptions, RequestStats};
pub use error::RequestError;
