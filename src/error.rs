//! Unified error type for the proxy core.
//!
//! One enum covers credential loading, account selection, token refresh,
//! upstream calls, and stream decoding. The host maps these to HTTP
//! statuses via [`Error::status_code`]; dialect-specific error bodies are
//! the host's job.

use std::time::Duration;

/// Maximum number of upstream body bytes carried inside an error.
const BODY_EXCERPT_LIMIT: usize = 512;

/// Errors produced by the proxy core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No eligible account for the requested provider.
    #[error("no account available for provider {0}")]
    NoAccount(String),

    /// A credential file was rejected at load time.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// A refresh driver received a non-2xx response.
    #[error("token refresh failed ({status}): {body}")]
    RefreshFailed { status: u16, body: String },

    /// The provider returned a non-2xx response.
    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    /// Rate limited by the provider (429).
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        retry_after: Option<Duration>,
    },

    /// The inbound request was canceled.
    #[error("request canceled")]
    Canceled,

    /// Decompression or JSON parse failure on upstream data.
    #[error("decode error: {0}")]
    Decode(String),

    /// The provider does not implement the requested operation.
    #[error("operation not supported by provider {0}")]
    Unsupported(&'static str),

    /// Stream-level failure after the response headers were accepted.
    #[error("stream error: {0}")]
    Stream(String),

    /// Transport-level failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credential file I/O failure.
    #[error("storage error at {path}: {message}")]
    Storage { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an `Upstream` error, truncating the body excerpt.
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: truncate_body(body.into()),
        }
    }

    /// Build a `RefreshFailed` error, truncating the body excerpt.
    pub fn refresh_failed(status: u16, body: impl Into<String>) -> Self {
        Self::RefreshFailed {
            status,
            body: truncate_body(body.into()),
        }
    }

    /// Build a `Storage` error from a path and message.
    pub fn storage(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// The HTTP status the host should answer with, if this error maps to one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NoAccount(_) => Some(503),
            Self::InvalidCredential(_) => Some(401),
            Self::RefreshFailed { .. } => Some(401),
            Self::Upstream { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Decode(_) => Some(502),
            Self::Unsupported(_) => Some(501),
            _ => None,
        }
    }

    /// Whether the account that produced this error should enter cooldown.
    pub fn triggers_cooldown(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The retry-after duration if this is a rate limit error.
    pub fn retry_after_duration(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after,
                retry_after_secs,
            } => retry_after.or(Some(Duration::from_secs(*retry_after_secs))),
            _ => None,
        }
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > BODY_EXCERPT_LIMIT {
        let mut end = BODY_EXCERPT_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NoAccount("kiro".into()).status_code(), Some(503));
        assert_eq!(Error::upstream(403, "forbidden").status_code(), Some(403));
        assert_eq!(Error::Decode("bad gzip".into()).status_code(), Some(502));
        assert_eq!(Error::Unsupported("kiro").status_code(), Some(501));
        assert!(Error::Canceled.status_code().is_none());
    }

    #[test]
    fn test_cooldown_triggers() {
        assert!(Error::upstream(429, "").triggers_cooldown());
        assert!(Error::upstream(500, "").triggers_cooldown());
        assert!(Error::upstream(503, "").triggers_cooldown());
        assert!(!Error::upstream(403, "").triggers_cooldown());
        assert!(!Error::upstream(400, "").triggers_cooldown());
    }

    #[test]
    fn test_body_excerpt_truncated() {
        let long = "x".repeat(2048);
        match Error::upstream(500, long) {
            Error::Upstream { body, .. } => assert_eq!(body.len(), 512),
            _ => unreachable!(),
        }
    }
}
