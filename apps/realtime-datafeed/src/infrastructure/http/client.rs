//! Request client with deduplication and retry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, Method, Url};
use serde_json::Value;
use uuid::Uuid;

use super::error::RequestError;
use crate::infrastructure::config::RequestSettings;
use crate::infrastructure::metrics::{self, HttpOutcome};

type ResponseFuture = BoxFuture<'static, Result<Value, RequestError>>;

/// Per-call options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Per-attempt timeout; the client default when `None`.
    pub timeout: Option<Duration>,
    /// Retry transient failures.
    pub retry: bool,
    /// Share an identical in-flight GET.
    pub dedupe: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: true,
            dedupe: true,
        }
    }
}

impl RequestOptions {
    /// Options with a specific timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Options without retries.
    #[must_use]
    pub const fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Options without deduplication.
    #[must_use]
    pub const fn without_dedupe(mut self) -> Self {
        self.dedupe = false;
        self
    }
}

/// Aggregate request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Network executions started (deduplicated joins excluded).
    pub total: u64,
    /// Executions that settled successfully.
    pub success: u64,
    /// Executions that settled with an error.
    pub failure: u64,
    /// Retry attempts scheduled.
    pub retried: u64,
    /// Calls that joined an in-flight execution.
    pub deduplicated: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    retried: AtomicU64,
    deduplicated: AtomicU64,
}

struct Inner {
    client: Client,
    base_url: String,
    settings: RequestSettings,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_execution: AtomicU64,
    counters: Counters,
}

/// In-flight table entry. Only waiters keep the execution alive.
struct InFlight {
    id: u64,
    response: WeakShared<ResponseFuture>,
}

/// Removes its in-flight entry when the execution settles or is dropped.
struct InFlightGuard {
    inner: Weak<Inner>,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut in_flight = inner.in_flight.lock();
        if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// JSON request client for the datafeed REST API.
///
/// Cheap to clone; clones share the connection pool, the in-flight table,
/// and the statistics.
#[derive(Clone)]
pub struct RequestClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("base_url", &self.inner.base_url)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl RequestClient {
    /// Create a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, settings: RequestSettings) -> Result<Self, RequestError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| RequestError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                settings,
                in_flight: Mutex::new(HashMap::new()),
                next_execution: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        })
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// GET a JSON endpoint.
    ///
    /// # Errors
    ///
    /// Returns the final [`RequestError`] once retries are exhausted or on a
    /// non-retryable failure.
    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        self.request(Method::GET, endpoint, params, None, options)
            .await
    }

    /// POST a JSON body. Never deduplicated.
    ///
    /// # Errors
    ///
    /// Returns the final [`RequestError`] once retries are exhausted or on a
    /// non-retryable failure.
    pub async fn post_json(
        &self,
        endpoint: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        self.request(Method::POST, endpoint, &[], Some(body), options)
            .await
    }

    /// Issue a request.
    ///
    /// Concurrent GETs with the same URL share one execution when `dedupe`
    /// is set; every caller receives the same settled result.
    ///
    /// # Errors
    ///
    /// Returns the final [`RequestError`] once retries are exhausted or on a
    /// non-retryable failure.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, &str)],
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let url = self.build_url(endpoint, params)?;

        if !options.dedupe || method != Method::GET {
            return self.execute(method, url, body, options).await;
        }

        let key = format!("{method} {url}");
        let shared: Shared<ResponseFuture> = {
            let mut in_flight = self.inner.in_flight.lock();
            let existing = in_flight.get(&key).and_then(|entry| entry.response.upgrade());
            if let Some(existing) = existing {
                tracing::debug!(key = %key, "Joining in-flight request");
                self.inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                metrics::record_http_request(method_label(&method), HttpOutcome::Deduplicated);
                existing
            } else {
                let id = self.inner.next_execution.fetch_add(1, Ordering::Relaxed);
                let guard = InFlightGuard {
                    inner: Arc::downgrade(&self.inner),
                    key: key.clone(),
                    id,
                };
                let client = self.clone();
                let execution = async move {
                    let _guard = guard;
                    client.execute(method, url, body, options).await
                }
                .boxed()
                .shared();
                if let Some(response) = execution.downgrade() {
                    in_flight.insert(key, InFlight { id, response });
                }
                execution
            }
        };

        shared.await
    }

    /// Snapshot of the aggregate counters.
    #[must_use]
    pub fn stats(&self) -> RequestStats {
        let c = &self.inner.counters;
        RequestStats {
            total: c.total.load(Ordering::Relaxed),
            success: c.success.load(Ordering::Relaxed),
            failure: c.failure.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
        }
    }

    /// Number of distinct executions currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Resolve an endpoint and append non-empty query parameters.
    fn build_url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url, RequestError> {
        let joined = if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.inner.base_url)
        } else {
            format!("{}/{endpoint}", self.inner.base_url)
        };
        let mut url =
            Url::parse(&joined).map_err(|e| RequestError::InvalidRequest(format!("{joined}: {e}")))?;

        let mut present = params.iter().filter(|(_, value)| !value.is_empty()).peekable();
        if present.peek().is_some() {
            let mut query = url.query_pairs_mut();
            for (name, value) in present {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let request_id = Uuid::new_v4();
        let label = method_label(&method);
        let timeout = options.timeout.unwrap_or(self.inner.settings.timeout);
        let mut backoff = ExponentialBackoff::new(&self.inner.settings);
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);

        let result = loop {
            let error = match self.attempt(&method, &url, body.as_ref(), timeout).await {
                Ok(value) => break Ok(value),
                Err(error) => error,
            };

            if !options.retry || !error.is_retryable() {
                break Err(error);
            }

            let Some(delay) = backoff.next_backoff() else {
                break Err(RequestError::MaxRetriesExceeded {
                    attempts: backoff.attempt,
                    last: Box::new(error),
                });
            };
            // Server hints are honoured up to the backoff cap.
            let delay = error.retry_after().map_or(delay, |secs| {
                Duration::from_secs(secs).min(self.inner.settings.backoff_max)
            });

            tracing::warn!(
                %request_id,
                method = label,
                path = url.path(),
                error = %error,
                delay_ms = delay.as_millis(),
                attempt = backoff.attempt,
                "Request failed, retrying"
            );
            self.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
            metrics::record_http_request(label, HttpOutcome::Retried);
            tokio::time::sleep(delay).await;
        };

        match &result {
            Ok(_) => {
                tracing::debug!(%request_id, method = label, path = url.path(), "Request succeeded");
                self.inner.counters.success.fetch_add(1, Ordering::Relaxed);
                metrics::record_http_request(label, HttpOutcome::Success);
            }
            Err(e) => {
                tracing::debug!(%request_id, method = label, path = url.path(), error = %e, "Request failed");
                self.inner.counters.failure.fetch_add(1, Ordering::Relaxed);
                metrics::record_http_request(label, HttpOutcome::Failure);
            }
        }
        result
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let mut request = self
            .inner
            .client
            .request(method.clone(), url.clone())
            .timeout(timeout)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RequestError::from_reqwest(&e))?;
        let status = response.status();

        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| RequestError::from_reqwest(&e))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| RequestError::Decode(e.to_string()));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        Err(RequestError::Status {
            status: status.as_u16(),
            body,
            retry_after,
        })
    }
}

fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::DELETE => "DELETE",
        _ => "OTHER",
    }
}

/// Exponential backoff calculator.
struct ExponentialBackoff {
    attempt: u32,
    max_attempts: u32,
    current_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    const fn new(settings: &RequestSettings) -> Self {
        Self {
            attempt: 0,
            max_attempts: settings.max_attempts,
            current_backoff: settings.backoff_initial,
            max_backoff: settings.backoff_max,
            multiplier: settings.backoff_multiplier,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are spent.
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }

        let backoff = self.current_backoff.min(self.max_backoff);
        self.current_backoff = Duration::from_secs_f64(
            (self.current_backoff.as_secs_f64() * self.multiplier)
                .min(self.max_backoff.as_secs_f64()),
        );

        Some(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RequestClient {
        RequestClient::new(base, RequestSettings::default()).unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let settings = RequestSettings {
            max_attempts: 5,
            backoff_initial: Duration::from_millis(300),
            backoff_max: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            ..RequestSettings::default()
        };
        let mut backoff = ExponentialBackoff::new(&settings);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(600)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.attempt, 5);
    }

    #[test]
    fn single_attempt_never_retries() {
        let settings = RequestSettings {
            max_attempts: 1,
            ..RequestSettings::default()
        };
        let mut backoff = ExponentialBackoff::new(&settings);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn build_url_skips_empty_params() {
        let client = client("http://localhost:3001/");
        let url = client
            .build_url(
                "/api/datafeed/search",
                &[("query", "AAPL"), ("exchange", ""), ("type", "stock")],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:3001/api/datafeed/search?query=AAPL&type=stock"
        );
    }

    #[test]
    fn build_url_without_params_has_no_question_mark() {
        let client = client("http://localhost:3001");
        let url = client
            .build_url("api/datafeed/config", &[("exchange", "")])
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:3001/api/datafeed/config");
    }

    #[test]
    fn build_url_encodes_values() {
        let client = client("http://localhost:3001");
        let url = client
            .build_url("/api/datafeed/symbols", &[("symbol", "BRK B&x")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:3001/api/datafeed/symbols?symbol=BRK+B%26x"
        );
    }

    #[test]
    fn default_options() {
        let options = RequestOptions::default();
        assert!(options.retry);
        assert!(options.dedupe);
        assert_eq!(options.timeout, None);
        assert!(!options.without_dedupe().dedupe);
        assert!(!options.without_retry().retry);
    }

    #[test]
    fn invalid_base_is_request_error() {
        let client = client("not a url");
        assert!(matches!(
            client.build_url("/x", &[]),
            Err(RequestError::InvalidRequest(_))
        ));
    }
}
