//! Client facade tying the write and query paths together.

use arrow_array::RecordBatch;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::query::{QueryApi, QueryApiOptions, QueryOptions, QueryOutput};
use crate::write::{Record, WriteApi, WriteEvent, WriteOptions};

/// An InfluxDB 3 client: line-protocol writes over HTTP, queries over
/// Arrow Flight.
///
/// ```no_run
/// use influx3::{Client, Point};
///
/// # async fn example() -> Result<(), influx3::Error> {
/// let client = Client::from_env()?;
/// client.write(Point::new("cpu").tag("host", "h1").field("usage", 0.5)).await?;
/// let batches = client.query("SELECT * FROM cpu").await?;
/// # let _ = batches;
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    write: WriteApi,
    query: QueryApi,
}

impl Client {
    /// Build a client with default write and query options.
    pub fn new(config: ClientConfig) -> Result<Client, Error> {
        let write_options = WriteOptions::defaults_for(&config);
        Client::with_options(config, write_options, QueryApiOptions::default())
    }

    /// Build a client from the `INFLUX_*` environment variables.
    pub fn from_env() -> Result<Client, Error> {
        Client::new(ClientConfig::from_env()?)
    }

    /// Build a client with explicit write and query options.
    pub fn with_options(
        config: ClientConfig,
        write_options: WriteOptions,
        query_options: QueryApiOptions,
    ) -> Result<Client, Error> {
        let write = WriteApi::new(&config, write_options)?;
        let query = QueryApi::new(&config, &query_options)?;
        Ok(Client {
            config,
            write,
            query,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Write a record (point, line, bytes, JSON object, frame, or a
    /// collection of them) to the default database.
    pub async fn write(&self, record: impl Into<Record>) -> Result<(), Error> {
        self.write.write(record).await
    }

    /// Write to an explicit database.
    pub async fn write_to(&self, database: &str, record: impl Into<Record>) -> Result<(), Error> {
        self.write.write_to(database, record).await
    }

    /// Subscribe to write outcomes (success, retry, terminal error).
    pub fn write_events(&self) -> broadcast::Receiver<WriteEvent> {
        self.write.events()
    }

    /// Wait for all previously submitted writes to reach a terminal
    /// outcome.
    pub async fn flush(&self) -> Result<(), Error> {
        self.write.flush().await
    }

    /// Run a SQL query against the default database and materialize the
    /// result.
    pub async fn query(&self, query: &str) -> Result<Vec<RecordBatch>, Error> {
        self.query.query(query).await
    }

    /// Run a query with explicit language, mode, parameters, headers, or
    /// deadline.
    pub async fn query_with_options(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<QueryOutput, Error> {
        self.query.query_with_options(query, options).await
    }

    /// Stop accepting writes, flush pending batches, and wait up to
    /// `max_close_wait`.  Idempotent.  The Flight channel is torn down
    /// when the client is dropped.
    pub async fn close(&self) {
        self.write.close().await;
    }
}
