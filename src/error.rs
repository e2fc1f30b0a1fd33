//! Domain error type shared by the write and query paths.
//!
//! Every failure the client surfaces carries a [`ErrorKind`] discriminator,
//! a human-readable message, and — when the server produced the failure —
//! the HTTP status, response headers, and any `Retry-After` hint.
//!
//! # Retryability
//! `RateLimit`, `Server`, `RetryableNetwork`, and `Timeout` are retryable,
//! as is any error for which the server supplied a `Retry-After` header.
//! `Auth`, `BadRequest`, `ClientMisuse`, and `Query` are terminal.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Failure classification, used by the retry state machine and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401/403 or a TLS verification failure.  Never retried.
    Auth,
    /// 400/404 and other request-shape rejections.  Never retried.
    BadRequest,
    /// 429.  Retried, honoring `Retry-After`.
    RateLimit,
    /// 5xx.  Retried.
    Server,
    /// Connect, DNS, or TLS-handshake failure.  Retried.
    RetryableNetwork,
    /// Per-attempt timeout.  Retried.
    Timeout,
    /// Invalid input or configuration.  Raised at the call site, never at
    /// flush time, and never retried.
    ClientMisuse,
    /// Flight/gRPC failure.  Propagates immediately, never retried.
    Query,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Auth => "authorization error",
            ErrorKind::BadRequest => "bad request",
            ErrorKind::RateLimit => "rate limited",
            ErrorKind::Server => "server error",
            ErrorKind::RetryableNetwork => "network error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ClientMisuse => "client misuse",
            ErrorKind::Query => "query error",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// The single client error type.
///
/// `Clone` so terminal outcomes can be delivered over the write-event
/// broadcast channel as well as returned to the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-requested minimum delay before the next attempt.
    pub retry_after: Option<Duration>,
    pub http_status: Option<u16>,
    pub headers: Vec<(String, String)>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            retry_after: None,
            http_status: None,
            headers: Vec::new(),
        }
    }

    pub fn client_misuse(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::ClientMisuse, message)
    }

    pub fn query(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Query, message)
    }

    pub fn timeout(message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Timeout, message)
    }

    /// Build an error from a non-2xx write response, classifying the status
    /// and extracting the best available message per the taxonomy rules.
    pub(crate) fn from_http_response(
        status: u16,
        reason: &str,
        headers: Vec<(String, String)>,
        body: &[u8],
    ) -> Error {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            s if s >= 500 => ErrorKind::Server,
            _ => ErrorKind::BadRequest,
        };
        let message = message_from_response(reason, &headers, body);
        Error {
            kind,
            message,
            retry_after: retry_after_from_headers(&headers),
            http_status: Some(status),
            headers,
        }
    }

    /// Whether the retry state machine may re-submit after this error.
    pub fn is_retryable(&self) -> bool {
        self.retry_after.is_some()
            || matches!(
                self.kind,
                ErrorKind::RateLimit
                    | ErrorKind::Server
                    | ErrorKind::RetryableNetwork
                    | ErrorKind::Timeout
            )
    }
}

impl From<influx3_lp::EncodeError> for Error {
    fn from(e: influx3_lp::EncodeError) -> Error {
        Error::client_misuse(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Server error-body parsing
// ---------------------------------------------------------------------------

/// One per-line entry in the structured v3 error body.
#[derive(Debug, Deserialize)]
struct ErrorLine {
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    line_number: Option<u64>,
    #[serde(default)]
    original_line: Option<String>,
}

/// The known server error-body shapes, all fields optional.  `data` stays
/// raw so an unexpected shape there cannot mask the `message`/`error`
/// keys.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Extract the most specific error message available.
///
/// Order: structured `error` + `data[]` body, `message` key, `error` key,
/// verbatim body, `X-Platform-Error-Code` / `X-Influx-Error` /
/// `X-InfluxDb-Error` headers, HTTP reason phrase.
fn message_from_response(reason: &str, headers: &[(String, String)], body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        let lines = parsed
            .data
            .as_ref()
            .and_then(|data| serde_json::from_value::<Vec<ErrorLine>>(data.clone()).ok());
        if let (Some(error), Some(data)) = (&parsed.error, &lines) {
            let mut message = error.clone();
            for entry in data {
                message.push('\n');
                match (entry.line_number, &entry.error_message) {
                    (Some(n), Some(msg)) => message.push_str(&format!("Line {}: {}", n, msg)),
                    (None, Some(msg)) => message.push_str(msg),
                    (Some(n), None) => message.push_str(&format!("Line {}", n)),
                    (None, None) => {}
                }
                if let Some(original) = &entry.original_line {
                    message.push_str(&format!("\n  Original: {}", original));
                }
            }
            return message;
        }
        if let Some(message) = parsed.message {
            return message;
        }
        if let Some(error) = parsed.error {
            return error;
        }
    }

    if let Ok(text) = std::str::from_utf8(body) {
        if !text.trim().is_empty() {
            return text.to_owned();
        }
    }

    for name in ["X-Platform-Error-Code", "X-Influx-Error", "X-InfluxDb-Error"] {
        if let Some(value) = header_value(headers, name) {
            return value.to_owned();
        }
    }

    reason.to_owned()
}

fn retry_after_from_headers(headers: &[(String, String)]) -> Option<Duration> {
    header_value(headers, "Retry-After")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
