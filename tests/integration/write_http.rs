//! HTTP write path against an in-process mock server.
//!
//! # Scenarios
//! 1. Default write: v2 endpoint, `org`/`bucket`/`precision` params,
//!    `Authorization: Token <t>`, plain-text body.
//! 2. No-sync write: v3 endpoint with long precision names; a 405 surfaces
//!    as client misuse naming the v3-only feature.
//! 3. Gzip gating: payload below the threshold ships uncompressed, at the
//!    threshold ships gzip-encoded.
//! 4. Error classification: 401 -> Auth, 400 -> BadRequest, 429 ->
//!    RateLimit with Retry-After, and `max_retries = 0` means exactly one
//!    attempt.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use tokio::io::AsyncReadExt as _;
use tokio::sync::Mutex;

use influx3::{Client, ClientConfig, ErrorKind, QueryApiOptions, WriteOptions};

// ---------------------------------------------------------------------------
// Harness: capturing mock write server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CapturedRequest {
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// Scripted response: status plus extra headers.
type ScriptedResponse = (u16, Vec<(String, String)>);

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    /// Responses popped per request; empty queue means 204.
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
}

async fn capture(
    State(state): State<MockState>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let header_map: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_owned()))
        .collect();
    state.requests.lock().await.push(CapturedRequest {
        path: uri.path().to_owned(),
        query,
        headers: header_map,
        body: body.to_vec(),
    });

    let scripted = state.responses.lock().await.pop_front();
    match scripted {
        None => (StatusCode::NO_CONTENT, HeaderMap::new()).into_response(),
        Some((status, extra_headers)) => {
            let mut headers = HeaderMap::new();
            for (name, value) in extra_headers {
                headers.insert(
                    axum::http::HeaderName::try_from(name.as_str()).unwrap(),
                    value.parse().unwrap(),
                );
            }
            (StatusCode::from_u16(status).unwrap(), headers).into_response()
        }
    }
}

async fn start_mock_server(state: MockState) -> std::net::SocketAddr {
    let router = Router::new()
        .route("/api/v2/write", post(capture))
        .route("/api/v3/write_lp", post(capture))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    addr
}

fn client_for(addr: std::net::SocketAddr, opts: WriteOptions) -> Client {
    let config = ClientConfig::builder()
        .host(format!("http://{}", addr))
        .token("T")
        .database("D")
        .build()
        .unwrap();
    Client::with_options(config, opts, QueryApiOptions::default()).unwrap()
}

/// A single line whose encoded length is exactly `len` bytes.
fn line_of_len(len: usize) -> String {
    let line = format!("m f=\"{}\"", "a".repeat(len - 6));
    assert_eq!(line.len(), len);
    line
}

async fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await.unwrap();
    out
}

// ---------------------------------------------------------------------------
// Scenario 1: default write
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_write_hits_v2_with_token_auth() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default());

    client.write("m,t=a v=1.0").await.unwrap();

    let requests = state.requests.lock().await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.path, "/api/v2/write");
    assert_eq!(request.query.get("org").unwrap(), "default");
    assert_eq!(request.query.get("bucket").unwrap(), "D");
    assert_eq!(request.query.get("precision").unwrap(), "ns");
    assert_eq!(request.headers.get("authorization").unwrap(), "Token T");
    assert_eq!(
        request.headers.get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
    assert!(
        request.headers.get("user-agent").unwrap().starts_with("influx3-rust/"),
        "user-agent: {:?}",
        request.headers.get("user-agent")
    );
    assert!(!request.headers.contains_key("content-encoding"));
    assert_eq!(request.body, b"m,t=a v=1.0");
}

#[tokio::test]
async fn auth_scheme_override_applies_to_writes() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let config = ClientConfig::builder()
        .host(format!("http://{}", addr))
        .token("T")
        .database("D")
        .auth_scheme("Bearer")
        .build()
        .unwrap();
    let client =
        Client::with_options(config, WriteOptions::default(), QueryApiOptions::default()).unwrap();

    client.write("m v=1").await.unwrap();

    let requests = state.requests.lock().await;
    assert_eq!(requests[0].headers.get("authorization").unwrap(), "Bearer T");
}

// ---------------------------------------------------------------------------
// Scenario 2: no-sync writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_sync_uses_the_v3_endpoint_with_long_precision() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default().no_sync(true));

    client.write("m v=1").await.unwrap();

    let requests = state.requests.lock().await;
    let request = &requests[0];
    assert_eq!(request.path, "/api/v3/write_lp");
    assert_eq!(request.query.get("db").unwrap(), "D");
    assert_eq!(request.query.get("precision").unwrap(), "nanosecond");
    assert_eq!(request.query.get("no_sync").unwrap(), "true");
}

#[tokio::test]
async fn no_sync_405_surfaces_the_v3_only_feature() {
    let state = MockState::default();
    state.responses.lock().await.push_back((405, Vec::new()));
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default().no_sync(true));

    let err = client.write("m v=1").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::ClientMisuse);
    assert!(err.message.contains("v3"), "message: {}", err.message);

    // Client misuse is terminal: exactly one attempt despite retry budget.
    assert_eq!(state.requests.lock().await.len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario 3: gzip threshold
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payload_below_threshold_is_not_compressed() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let config = ClientConfig::builder()
        .host(format!("http://{}", addr))
        .token("T")
        .database("D")
        .enable_gzip(1000)
        .build()
        .unwrap();
    let client =
        Client::with_options(config, WriteOptions::default(), QueryApiOptions::default()).unwrap();

    let line = line_of_len(999);
    client.write(line.as_str()).await.unwrap();

    let requests = state.requests.lock().await;
    let request = &requests[0];
    assert!(!request.headers.contains_key("content-encoding"));
    assert_eq!(request.body, line.as_bytes());
}

#[tokio::test]
async fn payload_at_threshold_is_gzip_encoded() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let config = ClientConfig::builder()
        .host(format!("http://{}", addr))
        .token("T")
        .database("D")
        .enable_gzip(1000)
        .build()
        .unwrap();
    let client =
        Client::with_options(config, WriteOptions::default(), QueryApiOptions::default()).unwrap();

    let line = line_of_len(1000);
    client.write(line.as_str()).await.unwrap();

    let requests = state.requests.lock().await;
    let request = &requests[0];
    assert_eq!(request.headers.get("content-encoding").unwrap(), "gzip");
    assert_eq!(gunzip(&request.body).await, line.as_bytes());
}

#[tokio::test]
async fn compression_disabled_never_gzips() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default());

    let line = line_of_len(5000);
    client.write(line.as_str()).await.unwrap();

    let requests = state.requests.lock().await;
    assert!(!requests[0].headers.contains_key("content-encoding"));
}

// ---------------------------------------------------------------------------
// Scenario 4: error classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auth_failures_are_terminal() {
    let state = MockState::default();
    state.responses.lock().await.push_back((401, Vec::new()));
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default());

    let err = client.write("m v=1").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(err.http_status, Some(401));
    // Never retried.
    assert_eq!(state.requests.lock().await.len(), 1);
}

#[tokio::test]
async fn bad_request_is_terminal() {
    let state = MockState::default();
    state.responses.lock().await.push_back((400, Vec::new()));
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default());

    let err = client.write("garbage").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::BadRequest);
    assert_eq!(state.requests.lock().await.len(), 1);
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let state = MockState::default();
    state
        .responses
        .lock()
        .await
        .push_back((429, vec![("Retry-After".to_owned(), "3".to_owned())]));
    let addr = start_mock_server(state.clone()).await;
    // max_retries = 0: surface the classified error after one attempt.
    let client = client_for(addr, WriteOptions::default().max_retries(0));

    let err = client.write("m v=1").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::RateLimit);
    assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
    assert_eq!(state.requests.lock().await.len(), 1);
}

#[tokio::test]
async fn max_retries_zero_means_one_attempt_on_5xx() {
    let state = MockState::default();
    for _ in 0..4 {
        state.responses.lock().await.push_back((503, Vec::new()));
    }
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default().max_retries(0));

    let err = client.write("m v=1").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::Server);
    assert_eq!(state.requests.lock().await.len(), 1);
}

#[tokio::test]
async fn per_point_precision_splits_requests() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = client_for(addr, WriteOptions::default());

    let records: Vec<influx3::Record> = vec![
        influx3::Point::new("m").field("v", 1i64).into(),
        influx3::Point::new("m")
            .field("v", 2i64)
            .precision(influx3::Precision::Second)
            .into(),
    ];
    client.write(records).await.unwrap();

    let requests = state.requests.lock().await;
    assert_eq!(requests.len(), 2);
    let mut precisions: Vec<String> = requests
        .iter()
        .map(|r| r.query.get("precision").unwrap().clone())
        .collect();
    precisions.sort();
    assert_eq!(precisions, ["ns", "s"]);
}
