//! Application Layer - Port definitions and the client facade.
//!
//! The facade is the only type callers need; the ports are the seams where
//! tests substitute a fake transport and clock.

/// Port interfaces for the streaming transport and time source.
pub mod ports;

/// `MarketDataClient` facade composing the engine and request client.
pub mod datafeed;
