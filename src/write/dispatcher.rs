//! Background batching engine.
//!
//! # Architecture
//! - `write` calls enqueue serialized records into a bounded command queue.
//! - A single batcher task owns the open batches, one per
//!   (database, org, precision) partition, and closes them on size, time
//!   (jittered), explicit flush, or shutdown.
//! - Closed batches enter a bounded submit queue drained by a pool of
//!   worker tasks that perform the HTTP submission.
//! - A failed retryable batch re-enters the submit queue after its backoff
//!   delay, so a newer batch of the same partition may overtake it.
//!   Without retries, submission order within a partition equals the order
//!   batches were closed.
//!
//! Outcomes are delivered on a broadcast channel rather than through
//! callbacks; subscriber code never runs on a worker task, so it cannot
//! deadlock against a full queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use influx3_lp::Precision;

use crate::error::Error;
use crate::http::HttpSubmitter;
use crate::write::options::WriteOptions;

/// Closed batches waiting for a worker.  Small on purpose: the memory
/// bound is `batch_size * (partitions + queue depth)`.
const SUBMIT_QUEUE_DEPTH: usize = 8;

/// Outcome broadcast capacity; slow subscribers lag rather than block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Batch partition key.  A batch never mixes databases, orgs, or
/// precisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub database: String,
    pub org: String,
    pub precision: Precision,
}

/// Terminal and intermediate batch outcomes, delivered on the write-event
/// channel.
#[derive(Debug, Clone)]
pub enum WriteEvent {
    /// The batch was accepted by the server.
    BatchSuccess { key: BatchKey, bytes: usize },
    /// A retryable failure; the batch re-enters the queue after
    /// `next_delay`.
    BatchRetry {
        key: BatchKey,
        payload: Arc<Vec<u8>>,
        error: Error,
        attempt: u32,
        next_delay: Duration,
    },
    /// The batch was dropped after exhausting its retry budget or failing
    /// terminally.
    BatchError { key: BatchKey, error: Error },
}

pub(crate) fn event_channel() -> broadcast::Sender<WriteEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

// ---------------------------------------------------------------------------
// Pending-work counter
// ---------------------------------------------------------------------------

/// Counts batches between dispatch and terminal outcome; `flush` and
/// `close` wait on it.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    count: AtomicUsize,
    notify: Notify,
}

impl Pending {
    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once the counter reaches zero.
    pub async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

enum Command {
    Append { key: BatchKey, bytes: Vec<u8> },
    /// Close every open batch; ack fires once they are all enqueued.
    Flush { ack: oneshot::Sender<()> },
}

struct Job {
    key: BatchKey,
    payload: Arc<Vec<u8>>,
    /// Completed re-submissions (0 for the first attempt).
    attempts: u32,
    first_failure: Option<Instant>,
}

/// Handle to the running batcher/worker tasks.
pub(crate) struct Dispatcher {
    cmd_tx: mpsc::Sender<Command>,
    pending: Arc<Pending>,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn start(
        opts: WriteOptions,
        submitter: Arc<HttpSubmitter>,
        events: broadcast::Sender<WriteEvent>,
    ) -> Dispatcher {
        let (cmd_tx, cmd_rx) = mpsc::channel(opts.queue_capacity);
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(Pending::default());

        tokio::spawn(run_batcher(
            cmd_rx,
            submit_tx.clone(),
            Arc::clone(&pending),
            opts.clone(),
            shutdown_rx.clone(),
        ));

        let submit_rx = Arc::new(Mutex::new(submit_rx));
        for worker in 0..opts.workers {
            tokio::spawn(run_worker(
                worker,
                Arc::clone(&submit_rx),
                submit_tx.clone(),
                Arc::clone(&submitter),
                opts.clone(),
                events.clone(),
                Arc::clone(&pending),
                shutdown_rx.clone(),
            ));
        }

        Dispatcher {
            cmd_tx,
            pending,
            shutdown_tx,
        }
    }

    /// Enqueue one serialized payload, blocking up to `timeout` when the
    /// queue is full.
    pub async fn enqueue(
        &self,
        key: BatchKey,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), Error> {
        match self
            .cmd_tx
            .send_timeout(Command::Append { key, bytes }, timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(Error::client_misuse(
                "write queue is full and the enqueue timeout expired",
            )),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(Error::client_misuse("write dispatcher is shut down"))
            }
        }
    }

    /// Close all open batches and wait for every in-flight batch (including
    /// ones sleeping out a retry backoff) to reach a terminal outcome.
    pub async fn flush(&self) -> Result<(), Error> {
        let (ack, acked) = oneshot::channel();
        if self.cmd_tx.send(Command::Flush { ack }).await.is_ok() {
            let _ = acked.await;
        }
        self.pending.drained().await;
        Ok(())
    }

    /// Flush, wait up to `max_close_wait`, then stop the tasks.  Work still
    /// in flight past the deadline is dropped and logged.
    pub async fn shutdown(&self, max_close_wait: Duration) {
        let drain = async {
            let (ack, acked) = oneshot::channel();
            if self.cmd_tx.send(Command::Flush { ack }).await.is_ok() {
                let _ = acked.await;
            }
            self.pending.drained().await;
        };
        if tokio::time::timeout(max_close_wait, drain).await.is_err() {
            warn!(
                dropped = self.pending.count(),
                "close wait expired, dropping in-flight batches"
            );
        }
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Dispatcher {
    /// Workers hold requeue senders, so the submit channel alone cannot
    /// close; the shutdown signal is what lets every task exit when the
    /// dispatcher goes away without an explicit `close`.
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Batcher task
// ---------------------------------------------------------------------------

struct OpenBatch {
    buf: Vec<u8>,
    deadline: Instant,
}

async fn run_batcher(
    mut cmd_rx: mpsc::Receiver<Command>,
    submit_tx: mpsc::Sender<Job>,
    pending: Arc<Pending>,
    opts: WriteOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut open: HashMap<BatchKey, OpenBatch> = HashMap::new();
    loop {
        let next_deadline = open.values().map(|b| b.deadline).min();
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Append { key, bytes }) => {
                    let deadline = Instant::now()
                        + opts.flush_interval
                        + sample_jitter(opts.jitter_interval);
                    let batch = open
                        .entry(key.clone())
                        .or_insert_with(|| OpenBatch { buf: Vec::new(), deadline });
                    if !batch.buf.is_empty() {
                        batch.buf.push(b'\n');
                    }
                    batch.buf.extend_from_slice(&bytes);
                    if batch.buf.len() >= opts.batch_size {
                        if let Some(batch) = open.remove(&key) {
                            dispatch(&submit_tx, &pending, key, batch.buf).await;
                        }
                    }
                }
                Some(Command::Flush { ack }) => {
                    let closing: Vec<BatchKey> = open.keys().cloned().collect();
                    for key in closing {
                        if let Some(batch) = open.remove(&key) {
                            dispatch(&submit_tx, &pending, key, batch.buf).await;
                        }
                    }
                    let _ = ack.send(());
                }
                None => {
                    let closing: Vec<BatchKey> = open.keys().cloned().collect();
                    for key in closing {
                        if let Some(batch) = open.remove(&key) {
                            dispatch(&submit_tx, &pending, key, batch.buf).await;
                        }
                    }
                    break;
                }
            },
            _ = deadline_sleep(next_deadline) => {
                let now = Instant::now();
                let due: Vec<BatchKey> = open
                    .iter()
                    .filter(|(_, b)| b.deadline <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    if let Some(batch) = open.remove(&key) {
                        dispatch(&submit_tx, &pending, key, batch.buf).await;
                    }
                }
            }
        }
    }
    if !open.is_empty() {
        warn!(batches = open.len(), "dropping open batches at shutdown");
    }
}

async fn dispatch(
    submit_tx: &mpsc::Sender<Job>,
    pending: &Arc<Pending>,
    key: BatchKey,
    buf: Vec<u8>,
) {
    debug!(
        database = %key.database,
        precision = %key.precision,
        bytes = buf.len(),
        "batch closed"
    );
    pending.begin();
    let job = Job {
        key,
        payload: Arc::new(buf),
        attempts: 0,
        first_failure: None,
    };
    if submit_tx.send(job).await.is_err() {
        pending.finish();
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Worker tasks
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker: usize,
    submit_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    requeue_tx: mpsc::Sender<Job>,
    submitter: Arc<HttpSubmitter>,
    opts: WriteOptions,
    events: broadcast::Sender<WriteEvent>,
    pending: Arc<Pending>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = submit_rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            }
        };
        handle_job(worker, job, &submitter, &opts, &events, &pending, &requeue_tx).await;
    }
}

async fn handle_job(
    worker: usize,
    job: Job,
    submitter: &HttpSubmitter,
    opts: &WriteOptions,
    events: &broadcast::Sender<WriteEvent>,
    pending: &Arc<Pending>,
    requeue_tx: &mpsc::Sender<Job>,
) {
    match submitter.submit(&job.key, &job.payload, opts.timeout).await {
        Ok(()) => {
            debug!(worker, bytes = job.payload.len(), "batch submitted");
            let _ = events.send(WriteEvent::BatchSuccess {
                key: job.key,
                bytes: job.payload.len(),
            });
            pending.finish();
        }
        Err(error) => {
            let retry_number = job.attempts + 1;
            let first_failure = job.first_failure.unwrap_or_else(Instant::now);
            match retry_decision(opts, &error, retry_number, first_failure.elapsed()) {
                Some(delay) => {
                    warn!(
                        worker,
                        error = %error,
                        attempt = retry_number,
                        delay_ms = delay.as_millis() as u64,
                        "batch submission failed, will retry"
                    );
                    let _ = events.send(WriteEvent::BatchRetry {
                        key: job.key.clone(),
                        payload: Arc::clone(&job.payload),
                        error,
                        attempt: retry_number,
                        next_delay: delay,
                    });
                    let job = Job {
                        attempts: retry_number,
                        first_failure: Some(first_failure),
                        ..job
                    };
                    let requeue_tx = requeue_tx.clone();
                    let pending = Arc::clone(pending);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if requeue_tx.send(job).await.is_err() {
                            pending.finish();
                        }
                    });
                }
                None => {
                    warn!(worker, error = %error, "batch submission failed terminally");
                    let _ = events.send(WriteEvent::BatchError {
                        key: job.key,
                        error,
                    });
                    pending.finish();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inline submission (synchronous / asynchronous write types)
// ---------------------------------------------------------------------------

/// Submit one payload with the same retry policy the worker pool applies,
/// sleeping out backoffs inline.
pub(crate) async fn submit_with_retry(
    submitter: &HttpSubmitter,
    opts: &WriteOptions,
    key: BatchKey,
    payload: Arc<Vec<u8>>,
    events: &broadcast::Sender<WriteEvent>,
) -> Result<(), Error> {
    let mut attempts = 0u32;
    let mut first_failure: Option<Instant> = None;
    loop {
        match submitter.submit(&key, &payload, opts.timeout).await {
            Ok(()) => {
                let _ = events.send(WriteEvent::BatchSuccess {
                    key,
                    bytes: payload.len(),
                });
                return Ok(());
            }
            Err(error) => {
                let retry_number = attempts + 1;
                let first = *first_failure.get_or_insert_with(Instant::now);
                match retry_decision(opts, &error, retry_number, first.elapsed()) {
                    Some(delay) => {
                        let _ = events.send(WriteEvent::BatchRetry {
                            key: key.clone(),
                            payload: Arc::clone(&payload),
                            error,
                            attempt: retry_number,
                            next_delay: delay,
                        });
                        tokio::time::sleep(delay).await;
                        attempts = retry_number;
                    }
                    None => {
                        let _ = events.send(WriteEvent::BatchError {
                            key: key.clone(),
                            error: error.clone(),
                        });
                        return Err(error);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Decide whether retry number `retry_number` (1-indexed) may run, and with
/// what delay.  `None` means the error is terminal.
fn retry_decision(
    opts: &WriteOptions,
    error: &Error,
    retry_number: u32,
    since_first_failure: Duration,
) -> Option<Duration> {
    if !error.is_retryable() {
        return None;
    }
    if retry_number > opts.max_retries {
        return None;
    }
    if since_first_failure > opts.max_retry_time {
        return None;
    }
    Some(backoff_delay(
        opts,
        retry_number,
        error.retry_after,
        sample_jitter(opts.jitter_interval),
    ))
}

/// `min(retry_interval * base^(k-1), max_retry_delay) + jitter`, floored by
/// a server-supplied `Retry-After`.
fn backoff_delay(
    opts: &WriteOptions,
    retry_number: u32,
    retry_after: Option<Duration>,
    jitter: Duration,
) -> Duration {
    let factor = f64::from(opts.exponential_base).powi(retry_number.saturating_sub(1) as i32);
    let base = (opts.retry_interval.as_secs_f64() * factor)
        .min(opts.max_retry_delay.as_secs_f64());
    let actual = Duration::from_secs_f64(base) + jitter;
    match retry_after {
        Some(floor) => actual.max(floor),
        None => actual,
    }
}

fn sample_jitter(jitter_interval: Duration) -> Duration {
    if jitter_interval.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = jitter_interval.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
