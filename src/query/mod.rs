//! Arrow Flight query path.
//!
//! A query is a JSON ticket
//! `{"database": ..., "sql_query": ..., "query_type": "sql"|"influxql"[, "params": {...}]}`
//! sent through a Flight `DoGet`.  The result stream decodes into
//! `RecordBatch`es and is exposed in one of several shapes selected by
//! [`QueryMode`].
//!
//! The gRPC metadata always carries `authorization: Bearer <token>`
//! (scheme overridable; note this differs from the HTTP write path, whose
//! default scheme is `Token`).  Per-call headers may extend the standard
//! set but never replace it; query parameters travel in the ticket body,
//! not in headers.
//!
//! The per-call deadline is enforced while opening the stream and handed
//! to the server as the gRPC timeout for the drain.  Dropping the returned
//! future or stream cancels the underlying call.
//!
//! Query errors are never retried at this layer.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{RecordBatch, RecordBatchIterator, RecordBatchReader};
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::Ticket;
use arrow_schema::{Schema, SchemaRef};
use futures_util::{StreamExt as _, TryStreamExt as _};
use serde::Serialize;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::Error;

// ---------------------------------------------------------------------------
// Language / mode selectors
// ---------------------------------------------------------------------------

/// Query language named in the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryLanguage {
    #[default]
    Sql,
    InfluxQl,
}

impl QueryLanguage {
    fn as_str(self) -> &'static str {
        match self {
            QueryLanguage::Sql => "sql",
            QueryLanguage::InfluxQl => "influxql",
        }
    }
}

/// Return-shape selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Drain the stream into a materialized table.
    #[default]
    All,
    /// Hand back the raw decoded stream.
    Chunk,
    /// Drain and wrap in a blocking record-batch iterator.
    Reader,
    /// Read only the schema, then close the call.
    Schema,
    /// Drain and convert to a polars `DataFrame` (requires the `polars`
    /// feature; fails with client misuse otherwise).
    Polars,
}

impl FromStr for QueryMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(QueryMode::All),
            "chunk" => Ok(QueryMode::Chunk),
            "reader" => Ok(QueryMode::Reader),
            "schema" => Ok(QueryMode::Schema),
            "polars" | "dataframe" => Ok(QueryMode::Polars),
            _ => Err("Invalid query mode"),
        }
    }
}

impl QueryMode {
    /// Parse a mode name, falling back to [`QueryMode::All`] for unknown
    /// names.
    pub fn parse_or_all(s: &str) -> QueryMode {
        s.parse().unwrap_or(QueryMode::All)
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Construction-time Flight channel options.
#[derive(Debug, Clone, Default)]
pub struct QueryApiOptions {
    /// PEM bundle overriding the native root certificates.
    pub tls_root_certs: Option<PathBuf>,
}

impl QueryApiOptions {
    pub fn tls_root_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_root_certs = Some(path.into());
        self
    }
}

/// Per-call query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Database override; defaults to the client database.
    pub database: Option<String>,
    pub language: QueryLanguage,
    pub mode: QueryMode,
    /// Scalar parameters folded into the ticket body.
    pub params: BTreeMap<String, serde_json::Value>,
    /// Extra gRPC metadata; extends the standard headers, never replaces
    /// them.
    pub headers: Vec<(String, String)>,
    /// Per-call deadline override.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn language(mut self, language: QueryLanguage) -> Self {
        self.language = language;
        self
    }

    pub fn mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Query result in the shape selected by [`QueryMode`].
pub enum QueryOutput {
    Batches(Vec<RecordBatch>),
    Stream(FlightRecordBatchStream),
    Reader(Box<dyn RecordBatchReader + Send>),
    Schema(SchemaRef),
    #[cfg(feature = "polars")]
    DataFrame(polars::prelude::DataFrame),
}

// ---------------------------------------------------------------------------
// Ticket body
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TicketData<'a> {
    database: &'a str,
    sql_query: &'a str,
    query_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a BTreeMap<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// QueryApi
// ---------------------------------------------------------------------------

/// Flight query client.  The channel is shared by all queries and torn
/// down when the client is dropped.
#[derive(Debug, Clone)]
pub struct QueryApi {
    flight: FlightServiceClient<Channel>,
    database: String,
    auth_header: String,
    timeout: Duration,
}

impl QueryApi {
    pub(crate) fn new(config: &ClientConfig, options: &QueryApiOptions) -> Result<QueryApi, Error> {
        let (uri, tls) = config.grpc_endpoint()?;
        let uri: tonic::transport::Uri = uri
            .parse()
            .map_err(|e| Error::client_misuse(format!("invalid gRPC endpoint '{}': {}", uri, e)))?;
        let mut endpoint = Channel::builder(uri);
        if tls {
            let mut tls_config = ClientTlsConfig::new().with_native_roots();
            if let Some(path) = &options.tls_root_certs {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::client_misuse(format!(
                        "reading root certificates '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                tls_config = tls_config.ca_certificate(Certificate::from_pem(pem));
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| Error::client_misuse(format!("TLS configuration: {}", e)))?;
        }
        let channel = endpoint.connect_lazy();
        Ok(QueryApi {
            flight: FlightServiceClient::new(channel),
            database: config.database.clone(),
            auth_header: config.flight_auth_header(),
            timeout: config.query_timeout,
        })
    }

    /// Run a SQL query and materialize the full result.
    pub async fn query(&self, query: &str) -> Result<Vec<RecordBatch>, Error> {
        let stream = self.open_stream(query, &QueryOptions::default()).await?;
        collect_batches(stream).await
    }

    /// Run a query with explicit language, mode, parameters, headers, or
    /// deadline.
    pub async fn query_with_options(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<QueryOutput, Error> {
        let mut stream = self.open_stream(query, options).await?;
        match options.mode {
            QueryMode::All => Ok(QueryOutput::Batches(collect_batches(stream).await?)),
            QueryMode::Chunk => Ok(QueryOutput::Stream(stream)),
            QueryMode::Reader => {
                let batches = drain(&mut stream).await?;
                let schema = stream
                    .schema()
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Schema::empty()));
                Ok(QueryOutput::Reader(Box::new(RecordBatchIterator::new(
                    batches.into_iter().map(Ok),
                    schema,
                ))))
            }
            QueryMode::Schema => loop {
                if let Some(schema) = stream.schema() {
                    // Dropping the stream here closes the call without
                    // draining the data.
                    return Ok(QueryOutput::Schema(schema.clone()));
                }
                match stream.next().await {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(flight_error(e)),
                    None => {
                        return Err(Error::query(
                            "stream ended before a schema message arrived",
                        ));
                    }
                }
            },
            QueryMode::Polars => {
                #[cfg(feature = "polars")]
                {
                    let batches = drain(&mut stream).await?;
                    let schema = stream
                        .schema()
                        .cloned()
                        .unwrap_or_else(|| Arc::new(Schema::empty()));
                    Ok(QueryOutput::DataFrame(batches_to_dataframe(
                        &schema, &batches,
                    )?))
                }
                #[cfg(not(feature = "polars"))]
                {
                    Err(Error::client_misuse(
                        "the polars query mode requires building with the `polars` feature",
                    ))
                }
            }
        }
    }

    async fn open_stream(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<FlightRecordBatchStream, Error> {
        for (name, value) in &options.params {
            if value.is_object() || value.is_array() {
                return Err(Error::client_misuse(format!(
                    "query parameter '{}' must be a scalar",
                    name
                )));
            }
        }

        let database = options.database.as_deref().unwrap_or(&self.database);
        let ticket = TicketData {
            database,
            sql_query: query,
            query_type: options.language.as_str(),
            params: (!options.params.is_empty()).then_some(&options.params),
        };
        let ticket_json = serde_json::to_vec(&ticket)
            .map_err(|e| Error::client_misuse(format!("encoding query ticket: {}", e)))?;

        let timeout = options.timeout.unwrap_or(self.timeout);
        let mut request = tonic::Request::new(Ticket {
            ticket: ticket_json.into(),
        });
        request.set_timeout(timeout);

        let metadata = request.metadata_mut();
        let auth: AsciiMetadataValue = self
            .auth_header
            .parse()
            .map_err(|_| Error::client_misuse("auth token is not a valid header value"))?;
        metadata.insert("authorization", auth);
        for (name, value) in &options.headers {
            if name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            let key: AsciiMetadataKey = name.to_ascii_lowercase().parse().map_err(|_| {
                Error::client_misuse(format!("invalid header name '{}'", name))
            })?;
            let value: AsciiMetadataValue = value.parse().map_err(|_| {
                Error::client_misuse(format!("invalid value for header '{}'", name))
            })?;
            metadata.insert(key, value);
        }

        debug!(database, language = options.language.as_str(), "opening flight stream");
        let mut flight = self.flight.clone();
        let response = tokio::time::timeout(timeout, flight.do_get(request))
            .await
            .map_err(|_| Error::timeout("query deadline exceeded while opening the stream"))?
            .map_err(status_error)?;
        let stream = response.into_inner().map_err(FlightError::from);
        Ok(FlightRecordBatchStream::new_from_flight_data(stream))
    }
}

async fn drain(stream: &mut FlightRecordBatchStream) -> Result<Vec<RecordBatch>, Error> {
    let mut batches = Vec::new();
    while let Some(item) = stream.next().await {
        batches.push(item.map_err(flight_error)?);
    }
    Ok(batches)
}

async fn collect_batches(mut stream: FlightRecordBatchStream) -> Result<Vec<RecordBatch>, Error> {
    drain(&mut stream).await
}

fn status_error(status: tonic::Status) -> Error {
    if status.code() == tonic::Code::DeadlineExceeded {
        Error::timeout(format!("query deadline exceeded: {}", status.message()))
    } else {
        Error::query(format!("flight error: {}: {}", status.code(), status.message()))
    }
}

fn flight_error(error: FlightError) -> Error {
    match error {
        FlightError::Tonic(status) => status_error(*status),
        other => Error::query(format!("flight error: {}", other)),
    }
}

#[cfg(feature = "polars")]
fn batches_to_dataframe(
    schema: &SchemaRef,
    batches: &[RecordBatch],
) -> Result<polars::prelude::DataFrame, Error> {
    use polars::prelude::{IpcReader, SerReader};

    // Round-trip through Arrow IPC; polars reads IPC natively, which keeps
    // the two arrow implementations decoupled.
    let mut buf = Vec::new();
    {
        let mut writer = arrow_ipc::writer::FileWriter::try_new(&mut buf, schema.as_ref())
            .map_err(|e| Error::query(format!("encoding IPC: {}", e)))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| Error::query(format!("encoding IPC: {}", e)))?;
        }
        writer
            .finish()
            .map_err(|e| Error::query(format!("encoding IPC: {}", e)))?;
    }
    IpcReader::new(std::io::Cursor::new(buf))
        .finish()
        .map_err(|e| Error::query(format!("converting to polars: {}", e)))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
