// src/error.rs
// Standardized error types for the sync pipeline

use thiserror::Error;

/// Main error type for the memu-sync library
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("memory service error: {0}")]
    Provider(String),

    #[error("memorize timed out after {0}s")]
    Timeout(u64),

    #[error("unknown error: {0}")]
    Other(String),
}

/// Convenience type alias for Result using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Whether this error should arm the exponential rate-limit backoff.
    ///
    /// HTTP 429 and provider code 1302 are mapped to `RateLimited` by the
    /// client; anything else is classified by textual match on the message.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            SyncError::RateLimited(_) => true,
            other => {
                let text = other.to_string().to_lowercase();
                text.contains("rate limit") || text.contains("ratelimit")
            }
        }
    }
}

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_variant_is_rate_limit() {
        assert!(SyncError::RateLimited("HTTP 429".into()).is_rate_limit());
    }

    #[test]
    fn test_textual_rate_limit_detection() {
        assert!(SyncError::Provider("upstream said Rate Limit exceeded".into()).is_rate_limit());
        assert!(SyncError::Other("provider ratelimit tripped".into()).is_rate_limit());
        assert!(!SyncError::Provider("internal server error".into()).is_rate_limit());
    }

    #[test]
    fn test_timeout_is_not_rate_limit() {
        assert!(!SyncError::Timeout(600).is_rate_limit());
    }
}
