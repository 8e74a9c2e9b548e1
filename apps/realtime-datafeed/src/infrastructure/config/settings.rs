//! Datafeed Configuration Settings
//!
//! Configuration types for the market data client, loaded from environment
//! variables. Every value has a default; only a malformed base URL is an
//! error.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::bars::DEFAULT_CACHE_CAPACITY;
use crate::infrastructure::realtime::outbound::DEFAULT_QUEUE_CAPACITY;

/// Default backend base URL.
const DEFAULT_BASE_URL: &str = "http://localhost:3001";

/// Default realtime socket path.
const DEFAULT_REALTIME_PATH: &str = "/ws/realtime";

/// Realtime socket settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnect jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Outbound queue capacity.
    pub outbound_queue_capacity: usize,
    /// Bar cache capacity.
    pub bar_cache_capacity: usize,
    /// Fetch a quote snapshot when a quote subscription is created or changed.
    pub initial_quote_snapshot: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(40),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 1.5,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 15,
            connect_timeout: Duration::from_secs(10),
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            bar_cache_capacity: DEFAULT_CACHE_CAPACITY,
            initial_quote_snapshot: true,
        }
    }
}

/// HTTP request settings.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Attempts per request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_initial: Duration,
    /// Retry delay cap.
    pub backoff_max: Duration,
    /// Retry delay multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_initial: Duration::from_millis(300),
            backoff_max: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct DatafeedConfig {
    /// HTTP base URL of the datafeed backend.
    pub base_url: String,
    /// Path of the realtime socket on the same host.
    pub realtime_path: String,
    /// Realtime socket settings.
    pub stream: StreamSettings,
    /// HTTP request settings.
    pub request: RequestSettings,
    /// Prometheus exporter port (0 = disabled).
    pub metrics_port: u16,
}

impl DatafeedConfig {
    /// Configuration with defaults for the given backend.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            realtime_path: DEFAULT_REALTIME_PATH.to_string(),
            stream: StreamSettings::default(),
            request: RequestSettings::default(),
            metrics_port: 0,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATAFEED_BASE_URL` is set but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration through a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATAFEED_BASE_URL` is set but unusable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = &lookup;

        let base_url = match env("DATAFEED_BASE_URL") {
            Some(url) if url.trim().is_empty() => {
                return Err(ConfigError::EmptyValue("DATAFEED_BASE_URL".to_string()));
            }
            Some(url) => url.trim().to_string(),
            None => DEFAULT_BASE_URL.to_string(),
        };
        if base_url.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidBaseUrl(base_url));
        }

        let realtime_path = env("DATAFEED_REALTIME_PATH")
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_REALTIME_PATH.to_string());

        let defaults = StreamSettings::default();
        let heartbeat_interval = parse_env_duration_secs(
            env,
            "DATAFEED_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval,
        );
        let stream = StreamSettings {
            heartbeat_interval,
            heartbeat_timeout: parse_env_duration_secs(
                env,
                "DATAFEED_HEARTBEAT_TIMEOUT_SECS",
                heartbeat_interval * 2,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                env,
                "DATAFEED_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                env,
                "DATAFEED_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env(
                env,
                "DATAFEED_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter: parse_env(env, "DATAFEED_RECONNECT_JITTER", defaults.reconnect_jitter),
            max_reconnect_attempts: parse_env(
                env,
                "DATAFEED_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            connect_timeout: parse_env_duration_secs(
                env,
                "DATAFEED_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            outbound_queue_capacity: parse_env(
                env,
                "DATAFEED_OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            ),
            bar_cache_capacity: parse_env(
                env,
                "DATAFEED_BAR_CACHE_CAPACITY",
                defaults.bar_cache_capacity,
            ),
            initial_quote_snapshot: parse_env(
                env,
                "DATAFEED_INITIAL_QUOTE_SNAPSHOT",
                defaults.initial_quote_snapshot,
            ),
        };

        let defaults = RequestSettings::default();
        let request = RequestSettings {
            timeout: parse_env_duration_millis(env, "DATAFEED_REQUEST_TIMEOUT_MS", defaults.timeout),
            max_attempts: parse_env(env, "DATAFEED_REQUEST_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_initial: parse_env_duration_millis(
                env,
                "DATAFEED_REQUEST_BACKOFF_INITIAL_MS",
                defaults.backoff_initial,
            ),
            backoff_max: parse_env_duration_millis(
                env,
                "DATAFEED_REQUEST_BACKOFF_MAX_MS",
                defaults.backoff_max,
            ),
            backoff_multiplier: parse_env(
                env,
                "DATAFEED_REQUEST_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
        };

        Ok(Self {
            base_url,
            realtime_path,
            stream,
            request,
            metrics_port: parse_env(env, "DATAFEED_METRICS_PORT", 0),
        })
    }

    /// Realtime socket URL derived from the HTTP base URL.
    ///
    /// `https` becomes `wss`, `http` becomes `ws`, and a bare host gets
    /// `ws://`.
    #[must_use]
    pub fn realtime_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let socket_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            format!("ws://{base}")
        };

        if self.realtime_path.starts_with('/') {
            format!("{socket_base}{}", self.realtime_path)
        } else {
            format!("{socket_base}/{}", self.realtime_path)
        }
    }

    /// Prometheus listen address, if enabled.
    #[must_use]
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        (self.metrics_port != 0)
            .then(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port)))
    }
}

impl Default for DatafeedConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Base URL cannot be used.
    #[error("invalid datafeed base URL: {0}")]
    InvalidBaseUrl(String),
}

fn parse_env<T: FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    env(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<DatafeedConfig, ConfigError> {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        DatafeedConfig::from_lookup(|key| vars.get(key).map(|v| (*v).to_string()))
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.base_url, "http://localhost:3001");
        assert_eq!(config.stream.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.stream.heartbeat_timeout, Duration::from_secs(40));
        assert_eq!(config.stream.max_reconnect_attempts, 15);
        assert!((config.stream.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.stream.outbound_queue_capacity, 500);
        assert_eq!(config.stream.bar_cache_capacity, 1000);
        assert_eq!(config.request.max_attempts, 3);
        assert_eq!(config.request.timeout, Duration::from_secs(10));
        assert_eq!(config.metrics_addr(), None);
    }

    #[test]
    fn heartbeat_timeout_follows_interval() {
        let config = config_from(&[("DATAFEED_HEARTBEAT_INTERVAL_SECS", "5")]).unwrap();
        assert_eq!(config.stream.heartbeat_timeout, Duration::from_secs(10));

        let config = config_from(&[
            ("DATAFEED_HEARTBEAT_INTERVAL_SECS", "5"),
            ("DATAFEED_HEARTBEAT_TIMEOUT_SECS", "7"),
        ])
        .unwrap();
        assert_eq!(config.stream.heartbeat_timeout, Duration::from_secs(7));
    }

    #[test]
    fn malformed_numbers_fall_back() {
        let config = config_from(&[
            ("DATAFEED_MAX_RECONNECT_ATTEMPTS", "lots"),
            ("DATAFEED_REQUEST_TIMEOUT_MS", "-1"),
        ])
        .unwrap();
        assert_eq!(config.stream.max_reconnect_attempts, 15);
        assert_eq!(config.request.timeout, Duration::from_secs(10));
    }

    #[test]
    fn empty_base_url_is_error() {
        assert!(matches!(
            config_from(&[("DATAFEED_BASE_URL", "  ")]),
            Err(ConfigError::EmptyValue(_))
        ));
        assert!(matches!(
            config_from(&[("DATAFEED_BASE_URL", "http://a b")]),
            Err(ConfigError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn metrics_port_enables_exporter() {
        let config = config_from(&[("DATAFEED_METRICS_PORT", "9464")]).unwrap();
        assert_eq!(config.metrics_addr().map(|a| a.port()), Some(9464));
    }

    #[test_case("https://feed.example.com", "wss://feed.example.com/ws/realtime" ; "https")]
    #[test_case("http://localhost:3001/", "ws://localhost:3001/ws/realtime" ; "http trailing slash")]
    #[test_case("feed.internal:8080", "ws://feed.internal:8080/ws/realtime" ; "bare host")]
    #[test_case("wss://stream.example.com", "wss://stream.example.com/ws/realtime" ; "already socket")]
    fn realtime_url_derivation(base: &str, expected: &str) {
        assert_eq!(DatafeedConfig::new(base).realtime_url(), expected);
    }

    #[test]
    fn realtime_path_without_slash() {
        let mut config = DatafeedConfig::new("http://host");
        config.realtime_path = "stream".to_string();
        assert_eq!(config.realtime_url(), "ws://host/stream");
    }
}
