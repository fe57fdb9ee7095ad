//! Backend error classification and retry policy.

use std::fmt;
use std::time::Duration;

/// Broad failure class of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 from the provider.
    RateLimited,
    /// 5xx from the provider.
    ServerError,
    /// 4xx other than 429. Not retryable.
    ClientError,
    /// Connection refused, reset, timed out.
    NetworkError,
    /// Response body could not be understood.
    ParseError,
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LlmErrorKind::RateLimited => "rate_limited",
            LlmErrorKind::ServerError => "server_error",
            LlmErrorKind::ClientError => "client_error",
            LlmErrorKind::NetworkError => "network_error",
            LlmErrorKind::ParseError => "parse_error",
        };
        f.write_str(label)
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::ClientError,
    }
}

/// Error returned by a [`Backend`](super::Backend).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            status_code: None,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            status_code: Some(429),
            retry_after,
            ..Self::new(LlmErrorKind::RateLimited, message)
        }
    }

    pub fn server_error(status: u16, message: String) -> Self {
        Self {
            status_code: Some(status),
            ..Self::new(LlmErrorKind::ServerError, message)
        }
    }

    pub fn client_error(status: u16, message: String) -> Self {
        Self {
            status_code: Some(status),
            ..Self::new(LlmErrorKind::ClientError, message)
        }
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, message)
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, message)
    }

    /// Delay before the next attempt: the server's `Retry-After` when given,
    /// otherwise exponential backoff from one second capped at 30 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(delay) = self.retry_after {
            return delay;
        }
        let secs = 1u64.checked_shl(attempt.min(5)).unwrap_or(32).min(30);
        Duration::from_secs(secs)
    }
}

/// Retry policy owned by the backend client. The runner never retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub max_retry_duration: Duration,
    pub retry_rate_limits: bool,
    pub retry_server_errors: bool,
    pub retry_network_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
            retry_rate_limits: true,
            retry_server_errors: true,
            retry_network_errors: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, error: &LlmError) -> bool {
        match error.kind {
            LlmErrorKind::RateLimited => self.retry_rate_limits,
            LlmErrorKind::ServerError => self.retry_server_errors,
            LlmErrorKind::NetworkError => self.retry_network_errors,
            LlmErrorKind::ClientError | LlmErrorKind::ParseError => false,
        }
    }
}
