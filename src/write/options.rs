//! Write-path options.
//!
//! Builder-style struct with the documented defaults.  Invalid values are
//! rejected when the write API is constructed, so misuse surfaces at the
//! call site rather than at flush time.

use std::collections::BTreeMap;
use std::time::Duration;

use influx3_lp::Precision;

use crate::config::ClientConfig;
use crate::error::Error;

// ---------------------------------------------------------------------------
// WriteType
// ---------------------------------------------------------------------------

/// How `write` calls are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    /// Submit inline; `write` returns after the HTTP call (and its retries)
    /// complete.  The only mode with strict per-partition ordering.
    #[default]
    Synchronous,
    /// Submit on a spawned task; `write` returns immediately and the
    /// outcome arrives on the event channel.
    Asynchronous,
    /// Enqueue into the batching dispatcher; `write` returns once the
    /// record is accepted by the queue.
    Batching,
}

// ---------------------------------------------------------------------------
// WriteOptions
// ---------------------------------------------------------------------------

/// Batching, retry, and shutdown knobs for the write path.
///
/// ```
/// use influx3::write::{WriteOptions, WriteType};
/// use std::time::Duration;
///
/// let opts = WriteOptions::default()
///     .write_type(WriteType::Batching)
///     .batch_size(10_000)
///     .flush_interval(Duration::from_millis(500));
/// assert_eq!(opts.batch_size, 10_000);
/// ```
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Closes an open batch once its payload reaches this many bytes.
    pub batch_size: usize,
    /// Closes an open batch this long after its first append.
    pub flush_interval: Duration,
    /// Uniform random extra delay in `[0, jitter_interval]` added to both
    /// the flush deadline and every retry backoff.
    pub jitter_interval: Duration,
    /// Base delay of the first retry.
    pub retry_interval: Duration,
    /// Retries stop once this many re-submissions have been attempted.
    pub max_retries: u32,
    /// Upper bound on a single backoff delay.
    pub max_retry_delay: Duration,
    /// Retries stop once this much time has passed since the first failure.
    pub max_retry_time: Duration,
    /// How long `close` waits for in-flight work before dropping it.
    pub max_close_wait: Duration,
    /// Backoff multiplier: delay for retry *k* is
    /// `retry_interval * exponential_base^(k-1)`, capped by
    /// `max_retry_delay`.
    pub exponential_base: u32,
    pub write_type: WriteType,
    /// Default timestamp precision for records that do not pin their own.
    pub write_precision: Precision,
    /// Route writes through the v3 no-sync endpoint.
    pub no_sync: bool,
    /// Per-attempt HTTP timeout, and the bound on how long an enqueue may
    /// block on a full queue.
    pub timeout: Duration,
    /// Capacity of the record queue feeding the batcher.
    pub queue_capacity: usize,
    /// Number of submission workers draining closed batches.
    pub workers: usize,
    /// Tags applied to every point that does not already carry them.
    pub default_tags: BTreeMap<String, String>,
}

impl Default for WriteOptions {
    fn default() -> WriteOptions {
        WriteOptions {
            batch_size: 1000,
            flush_interval: Duration::from_millis(1000),
            jitter_interval: Duration::ZERO,
            retry_interval: Duration::from_millis(5000),
            max_retries: 5,
            max_retry_delay: Duration::from_millis(30_000),
            max_retry_time: Duration::from_millis(180_000),
            max_close_wait: Duration::from_millis(300_000),
            exponential_base: 2,
            write_type: WriteType::Synchronous,
            write_precision: Precision::Nanosecond,
            no_sync: false,
            timeout: Duration::from_millis(10_000),
            queue_capacity: 1024,
            workers: 1,
            default_tags: BTreeMap::new(),
        }
    }
}

impl WriteOptions {
    /// Defaults with the client-level environment settings folded in
    /// (precision, no-sync, write timeout).
    pub fn defaults_for(config: &ClientConfig) -> WriteOptions {
        WriteOptions {
            write_precision: config.precision,
            no_sync: config.write_no_sync,
            timeout: config.write_timeout,
            ..WriteOptions::default()
        }
    }

    pub fn batch_size(mut self, bytes: usize) -> Self {
        self.batch_size = bytes;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn jitter_interval(mut self, interval: Duration) -> Self {
        self.jitter_interval = interval;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn max_retry_time(mut self, time: Duration) -> Self {
        self.max_retry_time = time;
        self
    }

    pub fn max_close_wait(mut self, wait: Duration) -> Self {
        self.max_close_wait = wait;
        self
    }

    pub fn exponential_base(mut self, base: u32) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn write_type(mut self, write_type: WriteType) -> Self {
        self.write_type = write_type;
        self
    }

    pub fn write_precision(mut self, precision: Precision) -> Self {
        self.write_precision = precision;
        self
    }

    pub fn no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Add a tag applied to every point that does not already carry it.
    pub fn default_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::client_misuse("batch_size must be positive"));
        }
        if self.exponential_base == 0 {
            return Err(Error::client_misuse("exponential_base must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::client_misuse("queue_capacity must be positive"));
        }
        if self.workers == 0 {
            return Err(Error::client_misuse("workers must be at least 1"));
        }
        Ok(())
    }
}
