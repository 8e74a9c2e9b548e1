//! Configuration Module
//!
//! Client configuration loaded from `DATAFEED_*` environment variables.

mod settings;

pub use settings::{ConfigError, DatafeedConfig, RequestSettings, StreamSettings};
