//! Batching dispatcher behavior against an in-process mock server.
//!
//! # Scenarios
//! 1. Retry with exponential backoff: four 503s exhaust a 3-retry budget;
//!    three retry events, one terminal error event, four attempts.
//! 2. Size trigger: reaching `batch_size` closes the batch without flush.
//! 3. Ordering: without retries, batches of one partition arrive in the
//!    order they were closed.
//! 4. `flush` idempotence and empty-record no-ops.
//! 5. `close`: `max_close_wait = 0` returns immediately and drops
//!    in-flight work; a second close is a no-op.
//! 6. Backpressure: a full queue times the write out into client misuse.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tokio::sync::Mutex;

use influx3::{
    Client, ClientConfig, ErrorKind, QueryApiOptions, WriteEvent, WriteOptions, WriteType,
};

// ---------------------------------------------------------------------------
// Harness: mock server with scripted failures and optional latency
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct MockState {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    hits: Arc<AtomicUsize>,
    /// Respond 503 to the first N requests.
    fail_first: Arc<AtomicUsize>,
    /// Artificial response latency in milliseconds.
    delay_ms: Arc<AtomicUsize>,
}

async fn capture(State(state): State<MockState>, body: Bytes) -> StatusCode {
    let delay = state.delay_ms.load(Ordering::Relaxed);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.bodies.lock().await.push(body.to_vec());

    let remaining = state.fail_first.load(Ordering::SeqCst);
    if remaining > 0 {
        state.fail_first.fetch_sub(1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::NO_CONTENT
}

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_mock_server(state: MockState) -> std::net::SocketAddr {
    init_tracing();
    let router = Router::new()
        .route("/api/v2/write", post(capture))
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

fn batching_client(addr: std::net::SocketAddr, opts: WriteOptions) -> Client {
    let config = ClientConfig::builder()
        .host(format!("http://{}", addr))
        .token("T")
        .database("D")
        .build()
        .unwrap();
    Client::with_options(
        config,
        opts.write_type(WriteType::Batching),
        QueryApiOptions::default(),
    )
    .unwrap()
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<WriteEvent>) -> Vec<WriteEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Scenario 1: exponential backoff retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_budget_fires_retry_events_then_one_terminal_error() {
    let state = MockState::default();
    state.fail_first.store(10, Ordering::SeqCst);
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(
        addr,
        WriteOptions::default()
            .retry_interval(Duration::from_millis(100))
            .exponential_base(2)
            .max_retries(3)
            .jitter_interval(Duration::ZERO)
            .flush_interval(Duration::from_millis(20)),
    );
    let mut events = client.write_events();

    let started = Instant::now();
    client.write("m v=1").await.unwrap();
    client.flush().await.unwrap();

    // Four attempts: the original plus three retries.
    assert_eq!(state.hits.load(Ordering::SeqCst), 4);
    // Backoff sums to 100 + 200 + 400 ms.
    assert!(started.elapsed() >= Duration::from_millis(700));

    let events = drain_events(&mut events);
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            WriteEvent::BatchRetry { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, [1, 2, 3]);
    let terminal: Vec<&influx3::Error> = events
        .iter()
        .filter_map(|e| match e {
            WriteEvent::BatchError { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, ErrorKind::Server);
}

#[tokio::test]
async fn transient_failures_recover_and_report_success() {
    let state = MockState::default();
    state.fail_first.store(2, Ordering::SeqCst);
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(
        addr,
        WriteOptions::default()
            .retry_interval(Duration::from_millis(50))
            .max_retries(5)
            .jitter_interval(Duration::ZERO)
            .flush_interval(Duration::from_millis(20)),
    );
    let mut events = client.write_events();

    client.write("m v=1").await.unwrap();
    client.flush().await.unwrap();

    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    let events = drain_events(&mut events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, WriteEvent::BatchSuccess { .. })),
        "expected a success event"
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: size trigger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaching_batch_size_closes_without_flush() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(
        addr,
        WriteOptions::default()
            .batch_size(10)
            // Long enough that only the size trigger can fire.
            .flush_interval(Duration::from_secs(60)),
    );
    let mut events = client.write_events();

    client.write("m v=111111").await.unwrap();

    // Wait for the submission without calling flush.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("batch should close on size alone")
        .unwrap();
    assert!(matches!(event, WriteEvent::BatchSuccess { .. }));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenario 3: ordering without retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batches_submit_in_close_order_without_retries() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(
        addr,
        WriteOptions::default()
            .batch_size(1)
            .flush_interval(Duration::from_secs(60)),
    );

    for i in 0..5 {
        client.write(format!("m v={}", i)).await.unwrap();
    }
    client.flush().await.unwrap();

    let bodies = state.bodies.lock().await;
    let lines: Vec<String> = bodies
        .iter()
        .map(|b| String::from_utf8(b.clone()).unwrap())
        .collect();
    assert_eq!(lines, ["m v=0", "m v=1", "m v=2", "m v=3", "m v=4"]);
}

// ---------------------------------------------------------------------------
// Scenario 4: flush idempotence, empty writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flush_twice_makes_no_additional_submissions() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(addr, WriteOptions::default());

    client.write("m v=1").await.unwrap();
    client.flush().await.unwrap();
    let after_first = state.hits.load(Ordering::SeqCst);
    client.flush().await.unwrap();
    assert_eq!(state.hits.load(Ordering::SeqCst), after_first);
    assert_eq!(after_first, 1);
}

#[tokio::test]
async fn empty_record_list_is_a_no_op() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(addr, WriteOptions::default());

    client
        .write(influx3::Record::Many(Vec::new()))
        .await
        .unwrap();
    client.flush().await.unwrap();
    assert_eq!(state.hits.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Scenario 5: close semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_with_zero_wait_returns_immediately_and_drops() {
    let state = MockState::default();
    state.delay_ms.store(2000, Ordering::SeqCst);
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(
        addr,
        WriteOptions::default()
            .batch_size(1)
            .max_close_wait(Duration::ZERO),
    );

    client.write("m v=1").await.unwrap();

    let started = Instant::now();
    client.close().await;
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "close took {:?}",
        started.elapsed()
    );

    // Second close is a no-op and must not hang or panic.
    client.close().await;

    // Writes after close are rejected at the call site.
    let err = client.write("m v=2").await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::ClientMisuse);
}

#[tokio::test]
async fn close_flushes_open_batches_within_the_wait() {
    let state = MockState::default();
    let addr = start_mock_server(state.clone()).await;
    let client = batching_client(
        addr,
        // Flush only on close: both triggers are far away.
        WriteOptions::default().flush_interval(Duration::from_secs(60)),
    );

    client.write("m v=1").await.unwrap();
    client.close().await;
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenario 6: backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_times_out_into_client_misuse() {
    let state = MockState::default();
    state.delay_ms.store(10_000, Ordering::SeqCst);
    let addr = start_mock_server(state.clone()).await;
    let client = Arc::new(batching_client(
        addr,
        WriteOptions::default()
            .batch_size(1)
            .queue_capacity(1)
            .timeout(Duration::from_millis(200)),
    ));

    // Every append closes a batch; the slow server wedges the worker, the
    // submit queue and then the command queue fill, and surplus concurrent
    // writers run into the enqueue timeout.
    let mut writers = Vec::new();
    for i in 0..32 {
        let client = Arc::clone(&client);
        writers.push(tokio::spawn(
            async move { client.write(format!("m v={}", i)).await },
        ));
    }

    let mut timeouts = 0;
    for writer in writers {
        if let Err(err) = writer.await.unwrap() {
            assert_eq!(err.kind, ErrorKind::ClientMisuse);
            assert!(err.message.contains("queue"), "message: {}", err.message);
            timeouts += 1;
        }
    }
    assert!(timeouts > 0, "expected at least one queue-full timeout");
}
