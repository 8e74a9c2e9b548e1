//! Domain Layer - Core market data types and subscription state.
//!
//! This layer holds the pieces of the client that have no I/O of their own:
//! bar values and the last-value cache, the desired subscription set, and
//! the connection state vocabulary.

/// OHLCV bars and the bounded last-bar cache.
pub mod bars;

/// Desired bar/quote subscriptions and their synchronization signatures.
pub mod subscription;

/// Connection state machine vocabulary.
pub mod connection;
