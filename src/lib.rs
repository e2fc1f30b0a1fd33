//! InfluxDB 3 client: HTTP line-protocol ingest and Arrow Flight queries.
//!
//! The write path serializes heterogeneous records (points, raw lines,
//! JSON objects, Arrow record batches) into line protocol and ships them
//! through `/api/v2/write` (or `/api/v3/write_lp` in no-sync mode), with
//! an optional background batching engine providing size/time triggered
//! flushing, jittered exponential-backoff retry, and outcome events.
//!
//! The query path sends a JSON ticket through a Flight `DoGet` and exposes
//! the decoded stream as a materialized table, a raw stream, a blocking
//! reader, or a schema.
//!
//! See [`Client`] for the facade, [`write::WriteApi`] and
//! [`query::QueryApi`] for the individual surfaces.

pub mod client;
pub mod config;
pub mod error;
mod http;
pub mod query;
pub mod write;

pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{Error, ErrorKind};
pub use influx3_lp::{FieldValue, Point, Precision};
pub use query::{QueryApiOptions, QueryLanguage, QueryMode, QueryOptions, QueryOutput};
pub use write::{
    BatchKey, FrameRecord, FrameWriteOptions, Record, WriteApi, WriteEvent, WriteOptions,
    WriteType,
};
