//! HTTP write submission.
//!
//! Wraps the shared `reqwest` client: picks the endpoint (v2 vs v3
//! no-sync), applies gzip when both the compression switch and the size
//! threshold allow it, composes headers, and classifies failures into the
//! domain error taxonomy.
//!
//! # Endpoints
//! - `POST /api/v2/write?org=<org>&bucket=<db>&precision=<ns|us|ms|s>`
//! - `POST /api/v3/write_lp?db=<db>&precision=<nanosecond|...>&no_sync=true`
//!
//! A 405 from the v3 path means the server does not offer the no-sync
//! feature; that is surfaced as client misuse, not retried.

use std::time::Duration;

use async_compression::tokio::write::GzipEncoder;
use reqwest::{header, StatusCode};
use tokio::io::AsyncWriteExt as _;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind};
use crate::write::BatchKey;

/// Fixed product identifier sent on every write request.
pub(crate) const USER_AGENT: &str = concat!("influx3-rust/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// HttpSubmitter
// ---------------------------------------------------------------------------

/// One submitter is shared by all dispatcher workers; the underlying
/// reqwest client pools connections across them.
#[derive(Debug)]
pub(crate) struct HttpSubmitter {
    http: reqwest::Client,
    write_url_v2: Url,
    write_url_v3: Url,
    auth_header: String,
    enable_gzip: bool,
    gzip_threshold: usize,
    no_sync: bool,
}

impl HttpSubmitter {
    pub fn new(config: &ClientConfig, no_sync: bool) -> Result<HttpSubmitter, Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::client_misuse(format!("building HTTP client: {}", e)))?;
        let base = config.http_base()?;
        Ok(HttpSubmitter {
            http,
            write_url_v2: endpoint_url(&base, &["api", "v2", "write"])?,
            write_url_v3: endpoint_url(&base, &["api", "v3", "write_lp"])?,
            auth_header: config.http_auth_header(),
            enable_gzip: config.enable_gzip,
            gzip_threshold: config.gzip_threshold,
            no_sync,
        })
    }

    /// Submit one closed batch.  `timeout` bounds this single attempt; the
    /// retry sequence around it is the dispatcher's concern.
    pub async fn submit(
        &self,
        key: &BatchKey,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let (url, params) = if self.no_sync {
            (
                self.write_url_v3.clone(),
                vec![
                    ("db", key.database.clone()),
                    ("precision", key.precision.as_long_name().to_owned()),
                    ("no_sync", "true".to_owned()),
                ],
            )
        } else {
            (
                self.write_url_v2.clone(),
                vec![
                    ("org", key.org.clone()),
                    ("bucket", key.database.clone()),
                    ("precision", key.precision.as_short_name().to_owned()),
                ],
            )
        };

        let compress = self.enable_gzip && payload.len() >= self.gzip_threshold;
        let body = if compress {
            gzip(payload).await?
        } else {
            payload.to_vec()
        };

        debug!(
            url = %url,
            bytes = payload.len(),
            gzip = compress,
            precision = %key.precision,
            "submitting write batch"
        );

        let mut request = self
            .http
            .post(url)
            .query(&params)
            .header(header::AUTHORIZATION, &self.auth_header)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .timeout(timeout)
            .body(body);
        if compress {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if self.no_sync && status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(Error::client_misuse(
                "no_sync writes require the v3 write endpoint (/api/v3/write_lp), \
                 which this server does not provide",
            ));
        }

        let reason = status.canonical_reason().unwrap_or("").to_owned();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let body = response.bytes().await.unwrap_or_default();
        Err(Error::from_http_response(
            status.as_u16(),
            &reason,
            headers,
            &body,
        ))
    }
}

/// Append `segments` to the base URL, preserving any path prefix.
fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, Error> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| Error::client_misuse("host URL cannot carry a path"))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

async fn gzip(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder
        .write_all(payload)
        .await
        .map_err(|e| Error::client_misuse(format!("gzip encoding failed: {}", e)))?;
    encoder
        .shutdown()
        .await
        .map_err(|e| Error::client_misuse(format!("gzip encoding failed: {}", e)))?;
    Ok(encoder.into_inner())
}

/// Map transport-level reqwest failures onto the taxonomy.
///
/// rustls reports certificate-verification failures as connect errors;
/// those are auth-shaped and must not be retried, so the source chain is
/// inspected for them.
fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        return Error::timeout(format!("write request timed out: {}", e));
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
    while let Some(err) = source {
        let text = err.to_string();
        if text.contains("certificate") || text.contains("Certificate") {
            return Error::new(
                ErrorKind::Auth,
                format!("TLS verification failed: {}", e),
            );
        }
        source = err.source();
    }
    Error::new(
        ErrorKind::RetryableNetwork,
        format!("write request failed: {}", e),
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
