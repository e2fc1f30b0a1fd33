//! Client configuration.
//!
//! A [`ClientConfig`] can be assembled with the builder or read from the
//! environment.  Environment loading goes through an injectable lookup so
//! tests never mutate process-global state.
//!
//! # Required keys
//! - `INFLUX_HOST` — base URL (scheme, host, port, optional path prefix)
//! - `INFLUX_TOKEN`
//! - `INFLUX_DATABASE`
//!
//! Every absent required key is reported in a single error.
//!
//! # URL schemes
//! `https` and `grpc+tls` select a TLS Flight channel; `http` and
//! `grpc+tcp` select cleartext.  The HTTP write base always uses plain
//! `http`/`https`.

use std::time::Duration;

use url::Url;

use crate::error::Error;
use influx3_lp::Precision;

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: Url,
    pub token: String,
    pub database: String,
    pub org: String,
    /// Explicit auth-scheme override.  When unset, HTTP uses `Token` and
    /// Flight uses `Bearer`.
    pub auth_scheme: Option<String>,
    pub precision: Precision,
    pub enable_gzip: bool,
    /// Minimum payload size, in bytes, at which gzip kicks in.  Compression
    /// requires both `enable_gzip` and `len >= gzip_threshold`.
    pub gzip_threshold: usize,
    pub write_no_sync: bool,
    pub write_timeout: Duration,
    pub query_timeout: Duration,
}

pub const DEFAULT_ORG: &str = "default";
pub const DEFAULT_GZIP_THRESHOLD: usize = 1000;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(300_000);

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Read configuration from the process environment (`INFLUX_*` keys).
    pub fn from_env() -> Result<ClientConfig, Error> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, collecting every missing
    /// required key into one error.
    pub fn from_env_with(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ClientConfig, Error> {
        let mut missing = Vec::new();
        let mut require = |key: &'static str| match lookup(key) {
            Some(v) if !v.trim().is_empty() => Some(v),
            _ => {
                missing.push(key);
                None
            }
        };

        let host = require("INFLUX_HOST");
        let token = require("INFLUX_TOKEN");
        let database = require("INFLUX_DATABASE");
        if !missing.is_empty() {
            return Err(Error::client_misuse(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let mut builder = ClientConfigBuilder::default()
            .host(host.unwrap_or_default())
            .token(token.unwrap_or_default())
            .database(database.unwrap_or_default());

        if let Some(org) = lookup("INFLUX_ORG") {
            builder = builder.org(org);
        }
        if let Some(precision) = lookup("INFLUX_PRECISION") {
            let parsed = precision.parse::<Precision>().map_err(|_| {
                Error::client_misuse(format!("INFLUX_PRECISION: unrecognized value '{}'", precision))
            })?;
            builder = builder.precision(parsed);
        }
        if let Some(scheme) = lookup("INFLUX_AUTH_SCHEME") {
            builder = builder.auth_scheme(scheme);
        }
        if let Some(threshold) = lookup("INFLUX_GZIP_THRESHOLD") {
            let parsed = threshold.trim().parse::<usize>().map_err(|_| {
                Error::client_misuse(format!(
                    "INFLUX_GZIP_THRESHOLD: expected a non-negative integer, got '{}'",
                    threshold
                ))
            })?;
            builder = builder.enable_gzip(parsed);
        }
        if let Some(no_sync) = lookup("INFLUX_WRITE_NO_SYNC") {
            builder = builder.write_no_sync(no_sync.trim().eq_ignore_ascii_case("true"));
        }
        if let Some(ms) = lookup("INFLUX_WRITE_TIMEOUT") {
            builder = builder.write_timeout(parse_timeout_ms("INFLUX_WRITE_TIMEOUT", &ms)?);
        }
        if let Some(ms) = lookup("INFLUX_QUERY_TIMEOUT") {
            builder = builder.query_timeout(parse_timeout_ms("INFLUX_QUERY_TIMEOUT", &ms)?);
        }

        builder.build()
    }

    /// Base URL for the HTTP write endpoints (`grpc+*` schemes mapped onto
    /// plain HTTP equivalents).
    pub(crate) fn http_base(&self) -> Result<Url, Error> {
        let scheme = match self.host.scheme() {
            "https" | "grpc+tls" => "https",
            "http" | "grpc+tcp" => "http",
            other => {
                return Err(Error::client_misuse(format!(
                    "unsupported URL scheme '{}'",
                    other
                )));
            }
        };
        let mut base = self.host.clone();
        // set_scheme rejects some cross-scheme changes; rebuild instead.
        if base.scheme() != scheme {
            let rebuilt = format!(
                "{}{}",
                scheme,
                &self.host.as_str()[self.host.scheme().len()..]
            );
            base = Url::parse(&rebuilt)
                .map_err(|e| Error::client_misuse(format!("invalid host URL: {}", e)))?;
        }
        Ok(base)
    }

    /// gRPC endpoint URI for the Flight channel, plus whether it is TLS.
    pub(crate) fn grpc_endpoint(&self) -> Result<(String, bool), Error> {
        let (scheme, tls) = match self.host.scheme() {
            "https" | "grpc+tls" => ("https", true),
            "http" | "grpc+tcp" => ("http", false),
            other => {
                return Err(Error::client_misuse(format!(
                    "unsupported URL scheme '{}'",
                    other
                )));
            }
        };
        let host = self
            .host
            .host_str()
            .ok_or_else(|| Error::client_misuse("host URL has no host name"))?;
        let uri = match self.host.port() {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };
        Ok((uri, tls))
    }

    /// `Authorization` header value for the HTTP write path.
    pub(crate) fn http_auth_header(&self) -> String {
        let scheme = self.auth_scheme.as_deref().unwrap_or("Token");
        format!("{} {}", scheme, self.token)
    }

    /// `authorization` metadata value for the Flight path.
    pub(crate) fn flight_auth_header(&self) -> String {
        let scheme = self.auth_scheme.as_deref().unwrap_or("Bearer");
        format!("{} {}", scheme, self.token)
    }
}

fn parse_timeout_ms(key: &str, value: &str) -> Result<Duration, Error> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| {
            Error::client_misuse(format!(
                "{}: expected a non-negative integer of milliseconds, got '{}'",
                key, value
            ))
        })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`ClientConfig`].  `host`, `token`, and `database` are
/// required; everything else has a default.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    host: Option<String>,
    token: Option<String>,
    database: Option<String>,
    org: Option<String>,
    auth_scheme: Option<String>,
    precision: Option<Precision>,
    gzip_threshold: Option<usize>,
    write_no_sync: bool,
    write_timeout: Option<Duration>,
    query_timeout: Option<Duration>,
}

impl ClientConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    /// Override the auth scheme for both transports (e.g. `Bearer`).
    pub fn auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = Some(scheme.into());
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Enable gzip compression for payloads of at least `threshold` bytes.
    pub fn enable_gzip(mut self, threshold: usize) -> Self {
        self.gzip_threshold = Some(threshold);
        self
    }

    pub fn write_no_sync(mut self, no_sync: bool) -> Self {
        self.write_no_sync = no_sync;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ClientConfig, Error> {
        let mut missing = Vec::new();
        if self.host.as_deref().is_none_or(str::is_empty) {
            missing.push("host");
        }
        if self.token.as_deref().is_none_or(str::is_empty) {
            missing.push("token");
        }
        if self.database.as_deref().is_none_or(str::is_empty) {
            missing.push("database");
        }
        if !missing.is_empty() {
            return Err(Error::client_misuse(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }

        let raw_host = self.host.unwrap_or_default();
        let host = Url::parse(&raw_host)
            .map_err(|e| Error::client_misuse(format!("invalid host URL '{}': {}", raw_host, e)))?;

        Ok(ClientConfig {
            host,
            token: self.token.unwrap_or_default(),
            database: self.database.unwrap_or_default(),
            org: self.org.unwrap_or_else(|| DEFAULT_ORG.to_owned()),
            auth_scheme: self.auth_scheme,
            precision: self.precision.unwrap_or_default(),
            enable_gzip: self.gzip_threshold.is_some(),
            gzip_threshold: self.gzip_threshold.unwrap_or(DEFAULT_GZIP_THRESHOLD),
            write_no_sync: self.write_no_sync,
            write_timeout: self.write_timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT),
            query_timeout: self.query_timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT),
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
