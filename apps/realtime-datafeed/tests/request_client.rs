//! Request Client Integration Tests
//!
//! Exercises deduplication, retry, and the REST half of the market data
//! client against a local mock backend.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, timeout};
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use realtime_datafeed::{
    DatafeedConfig, DatafeedError, MarketDataClient, PeriodParams, QuoteSymbol, RequestClient,
    RequestError, RequestOptions, RequestSettings, SymbolInfo,
};

fn fast_settings() -> RequestSettings {
    RequestSettings {
        timeout: Duration::from_secs(2),
        max_attempts: 3,
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        backoff_multiplier: 2.0,
    }
}

fn facade(server: &MockServer) -> MarketDataClient {
    let mut config = DatafeedConfig::new(server.uri());
    config.request = fast_settings();
    MarketDataClient::new(config).unwrap()
}

// =============================================================================
// Request client
// =============================================================================

#[tokio::test]
async fn concurrent_identical_gets_share_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/symbols"))
        .and(query_param("symbol", "AAPL"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"name": "AAPL"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let params = [("symbol", "AAPL")];
    let (first, second) = tokio::join!(
        client.get("/api/datafeed/symbols", &params, RequestOptions::default()),
        client.get("/api/datafeed/symbols", &params, RequestOptions::default()),
    );

    assert_eq!(first.unwrap(), json!({"name": "AAPL"}));
    assert_eq!(second.unwrap(), json!({"name": "AAPL"}));
    let stats = client.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.deduplicated, 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn abandoned_request_leaves_no_in_flight_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/symbols"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"name": "AAPL"}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1..=2)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let params = [("symbol", "AAPL")];
    let abandoned = timeout(
        Duration::from_millis(50),
        client.get("/api/datafeed/symbols", &params, RequestOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(client.in_flight(), 0);

    let payload = client
        .get("/api/datafeed/symbols", &params, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(payload, json!({"name": "AAPL"}));
    assert_eq!(client.stats().total, 2);
    assert_eq!(client.stats().deduplicated, 0);
}

#[tokio::test]
async fn dedupe_can_be_disabled_per_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/config"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let options = RequestOptions::default().without_dedupe();
    let (first, second) = tokio::join!(
        client.get("/api/datafeed/config", &[], options),
        client.get("/api/datafeed/config", &[], options),
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(client.stats().deduplicated, 0);
}

#[tokio::test]
async fn posts_are_never_shared() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/datafeed/quotes"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let body = json!({"symbols": ["AAPL"]});
    let (first, second) = tokio::join!(
        client.post_json("/api/datafeed/quotes", body.clone(), RequestOptions::default()),
        client.post_json("/api/datafeed/quotes", body.clone(), RequestOptions::default()),
    );
    first.unwrap();
    second.unwrap();
}

#[tokio::test]
async fn service_unavailable_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/config"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"supports_marks": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let payload = client
        .get("/api/datafeed/config", &[], RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(payload["supports_marks"], true);
    let stats = client.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.success, 1);
}

#[tokio::test]
async fn retry_after_header_is_honoured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let payload = client
        .get("/api/datafeed/search", &[("query", "AA")], RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(payload, json!([]));
    assert_eq!(client.stats().retried, 1);
}

#[tokio::test]
async fn retry_after_is_capped_by_backoff_max() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/search"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "86400"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let started = Instant::now();
    let payload = timeout(
        Duration::from_secs(5),
        client.get("/api/datafeed/search", &[("query", "AA")], RequestOptions::default()),
    )
    .await
    .expect("retry should wait at most the backoff cap")
    .unwrap();

    assert_eq!(payload, json!([]));
    assert_eq!(client.stats().retried, 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/symbols"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such symbol"))
        .expect(1)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let error = client
        .get("/api/datafeed/symbols", &[("symbol", "XYZ")], RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        error,
        RequestError::Status {
            status: 404,
            body: "no such symbol".to_string(),
            retry_after: None,
        }
    );
    assert_eq!(client.stats().failure, 1);
}

#[tokio::test]
async fn slow_responses_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/history"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let settings = RequestSettings {
        timeout: Duration::from_millis(50),
        max_attempts: 2,
        ..fast_settings()
    };
    let client = RequestClient::new(&server.uri(), settings).unwrap();
    let error = client
        .get("/api/datafeed/history", &[], RequestOptions::default())
        .await
        .unwrap_err();

    match error {
        RequestError::MaxRetriesExceeded { attempts, last } => {
            assert_eq!(attempts, 2);
            assert_eq!(*last, RequestError::Timeout);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn retry_can_be_disabled_per_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/config"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let client = RequestClient::new(&server.uri(), fast_settings()).unwrap();
    let error = client
        .get("/api/datafeed/config", &[], RequestOptions::default().without_retry())
        .await
        .unwrap_err();
    assert_eq!(error.status(), Some(502));
}

// =============================================================================
// Market data client REST surface
// =============================================================================

#[tokio::test]
async fn configuration_is_fetched_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "supported_resolutions": ["1", "D"],
            "supports_marks": true,
            "exchanges": [{"value": "NASDAQ"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = facade(&server);
    let first = client.on_ready().await;
    let second = client.on_ready().await;

    assert_eq!(first, second);
    assert_eq!(first.supported_resolutions, vec!["1", "D"]);
    assert!(first.supports_marks);
    assert!(first.supports_search);
    assert!(first.extra.contains_key("exchanges"));
    client.shutdown().await;
}

#[tokio::test]
async fn configuration_failure_falls_back_to_defaults() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/config"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let client = facade(&server);
    let configuration = client.on_ready().await;
    assert_eq!(configuration.supported_resolutions.len(), 8);
    assert!(configuration.supports_time);
    assert!(!configuration.supports_marks);
    client.shutdown().await;
}

#[tokio::test]
async fn search_passes_filters_and_swallows_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/search"))
        .and(query_param("query", "AA"))
        .and(query_param("exchange", "NASDAQ"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "AAPL"},
            {"symbol": "AAL"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/search/full"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let client = facade(&server);
    let results = client.search_symbols("AA", "NASDAQ", "").await;
    assert_eq!(results.len(), 2);
    assert!(client.search_symbols_full("AA", "stock", 20).await.is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn resolve_symbol_reads_ticker_and_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/symbols"))
        .and(query_param("symbol", "AAPL"))
        .and(query_param("session", "extended"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "AAPL",
            "ticker": "NASDAQ:AAPL",
            "subsession_id": "extended",
            "pricescale": 100
        })))
        .mount(&server)
        .await;

    let client = facade(&server);
    let info = client.resolve_symbol("AAPL", Some("extended")).await.unwrap();
    assert_eq!(info.symbol(), Some("NASDAQ:AAPL"));
    assert_eq!(info.session(), Some("extended"));
    assert_eq!(info.extra["pricescale"], 100);
    client.shutdown().await;
}

#[tokio::test]
async fn resolve_symbol_maps_error_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/symbols"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"s": "error", "errmsg": "unknown_symbol"})),
        )
        .mount(&server)
        .await;

    let client = facade(&server);
    let error = client.resolve_symbol("NOPE", None).await.unwrap_err();
    assert!(matches!(error, DatafeedError::SymbolNotFound(ref message) if message == "unknown_symbol"));
    client.shutdown().await;
}

#[tokio::test]
async fn history_bars_are_parsed_and_seed_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/history"))
        .and(query_param("symbol", "AAPL"))
        .and(query_param("resolution", "5"))
        .and(query_param("from", "1000"))
        .and(query_param("to", "2000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "s": "ok",
            "t": [1200, 1500],
            "o": [1.0, 2.0],
            "h": [1.5, "2.5"],
            "l": [0.5, 1.5],
            "c": [1.2, 2.2],
            "v": [100, null]
        })))
        .mount(&server)
        .await;

    let client = facade(&server);
    let period = PeriodParams {
        from: 1000,
        to: 2000,
        first_data_request: true,
    };
    let history = client
        .get_bars(&SymbolInfo::new("AAPL"), "5", period)
        .await
        .unwrap();

    assert!(!history.no_data);
    assert_eq!(history.bars.len(), 2);
    assert_eq!(history.bars[0].time, 1_200_000);
    assert_eq!(history.bars[1].high, 2.5);
    assert_eq!(history.bars[1].volume, 0.0);

    let diagnostics = client.diagnostics().await.unwrap();
    assert_eq!(diagnostics.stream.cache_size, 1);
    assert_eq!(diagnostics.requests.success, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn history_reports_no_data_with_next_time() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/datafeed/history"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"s": "no_data", "nextTime": 900})),
        )
        .mount(&server)
        .await;

    let client = facade(&server);
    let history = client
        .get_bars(&SymbolInfo::new("AAPL"), "1", PeriodParams::default())
        .await
        .unwrap();
    assert!(history.no_data);
    assert!(history.bars.is_empty());
    assert_eq!(history.next_time, Some(900));
    client.shutdown().await;
}

#[tokio::test]
async fn quotes_are_posted_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/datafeed/quotes"))
        .and(body_json(json!({
            "symbols": ["AAPL", {"symbol": "MSFT", "session": "extended"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"n": "AAPL", "s": "ok", "v": {"lp": 190.1}},
            {"n": "MSFT", "s": "ok", "v": {"lp": 410.5}}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = facade(&server);
    let quotes = client
        .get_quotes(&[
            QuoteSymbol::from(" AAPL "),
            QuoteSymbol::with_session("MSFT", "extended"),
            QuoteSymbol::from("AAPL"),
            QuoteSymbol::from(""),
        ])
        .await
        .unwrap();
    assert_eq!(quotes.len(), 2);
    assert_eq!(quotes[1]["n"], "MSFT");
    client.shutdown().await;
}
