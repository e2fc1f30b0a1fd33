//! Write path: records in, line-protocol batches out.
//!
//! [`WriteApi`] is the producer surface.  Depending on
//! [`WriteType`](options::WriteType), a `write` call either submits inline
//! (synchronous), submits on a spawned task (asynchronous), or enqueues
//! into the batching dispatcher and returns once accepted.
//!
//! Outcomes for the non-synchronous paths arrive on the broadcast channel
//! returned by [`WriteApi::events`].

mod dispatcher;
pub mod frame;
pub mod options;
pub mod record;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::warn;

pub use dispatcher::{BatchKey, WriteEvent};
pub use frame::FrameWriteOptions;
pub use options::{WriteOptions, WriteType};
pub use record::{FrameRecord, Record};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::http::HttpSubmitter;
use dispatcher::{Dispatcher, Pending};

// ---------------------------------------------------------------------------
// WriteApi
// ---------------------------------------------------------------------------

/// The write surface.  Safe to share across tasks; all methods take
/// `&self`.
pub struct WriteApi {
    opts: WriteOptions,
    submitter: Arc<HttpSubmitter>,
    database: String,
    org: String,
    events: broadcast::Sender<WriteEvent>,
    dispatcher: Option<Dispatcher>,
    /// Tracks spawned submissions in asynchronous mode.
    spawned: Arc<Pending>,
    closed: AtomicBool,
}

impl WriteApi {
    pub fn new(config: &ClientConfig, opts: WriteOptions) -> Result<WriteApi, Error> {
        opts.validate()?;
        let submitter = Arc::new(HttpSubmitter::new(config, opts.no_sync)?);
        let events = dispatcher::event_channel();
        let dispatcher = match opts.write_type {
            WriteType::Batching => Some(Dispatcher::start(
                opts.clone(),
                Arc::clone(&submitter),
                events.clone(),
            )),
            WriteType::Synchronous | WriteType::Asynchronous => None,
        };
        Ok(WriteApi {
            opts,
            submitter,
            database: config.database.clone(),
            org: config.org.clone(),
            events,
            dispatcher,
            spawned: Arc::new(Pending::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Subscribe to batch outcomes (success, retry, terminal error).
    pub fn events(&self) -> broadcast::Receiver<WriteEvent> {
        self.events.subscribe()
    }

    /// Write to the default database.
    pub async fn write(&self, record: impl Into<Record>) -> Result<(), Error> {
        let database = self.database.clone();
        self.write_to(&database, record).await
    }

    /// Write to an explicit database.
    pub async fn write_to(&self, database: &str, record: impl Into<Record>) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::client_misuse("write API is closed"));
        }
        let payloads = record::normalize(
            record.into(),
            self.opts.write_precision,
            &self.opts.default_tags,
        )?;
        if payloads.is_empty() {
            return Ok(());
        }

        for (precision, payload) in payloads {
            let key = BatchKey {
                database: database.to_owned(),
                org: self.org.clone(),
                precision,
            };
            match self.opts.write_type {
                WriteType::Batching => {
                    if let Some(dispatcher) = &self.dispatcher {
                        dispatcher.enqueue(key, payload, self.opts.timeout).await?;
                    }
                }
                WriteType::Synchronous => {
                    dispatcher::submit_with_retry(
                        &self.submitter,
                        &self.opts,
                        key,
                        Arc::new(payload),
                        &self.events,
                    )
                    .await?;
                }
                WriteType::Asynchronous => {
                    let submitter = Arc::clone(&self.submitter);
                    let opts = self.opts.clone();
                    let events = self.events.clone();
                    let spawned = Arc::clone(&self.spawned);
                    spawned.begin();
                    tokio::spawn(async move {
                        let _ = dispatcher::submit_with_retry(
                            &submitter,
                            &opts,
                            key,
                            Arc::new(payload),
                            &events,
                        )
                        .await;
                        spawned.finish();
                    });
                }
            }
        }
        Ok(())
    }

    /// Wait until all previously submitted work reaches a terminal
    /// outcome.  Idempotent; does not stop the API from accepting writes.
    pub async fn flush(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.flush().await,
            None => {
                self.spawned.drained().await;
                Ok(())
            }
        }
    }

    /// Stop accepting writes, flush, and wait up to `max_close_wait` for
    /// in-flight work.  A second call is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.shutdown(self.opts.max_close_wait).await,
            None => {
                let wait =
                    tokio::time::timeout(self.opts.max_close_wait, self.spawned.drained());
                if wait.await.is_err() {
                    warn!(
                        dropped = self.spawned.count(),
                        "close wait expired, abandoning in-flight writes"
                    );
                }
            }
        }
    }
}
