//! Error types for certificate management
//!
//! Lower components return typed errors upward; only the lifecycle engine
//! logs user-visible failures. Retry decisions are driven by the
//! [`Error::is_no_retry`] predicate and by challenge rotation in the engine.

use thiserror::Error;

/// Errors that can occur while obtaining, renewing, or serving certificates
#[derive(Debug, Error)]
pub enum Error {
    /// Storage key does not exist
    #[error("key does not exist: {0}")]
    NotExist(String),

    /// Transient failure (network timeout, 5xx from the CA, handshake blip)
    #[error("transient error: {0}")]
    Transient(String),

    /// The CA answered HTTP 429; retrying immediately would make it worse
    #[error("rate limited by CA: {0}")]
    RateLimited(String),

    /// The CA rejected a challenge; the engine may rotate to another one
    #[error("challenge validation failed: {0}")]
    Validation(String),

    /// Misconfiguration (insecure CA URL, missing terms agreement, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend failure other than absence
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation was cancelled
    #[error("operation cancelled")]
    Canceled,

    /// Corrupted stored resource or invariant breach
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for certificate management operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Returns true for the distinguishable "key absent" kind.
    ///
    /// Absence is part of normal operation and is never logged at error
    /// level by callers.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::NotExist(_))
    }

    /// Returns true if the retry engine must stop instead of backing off.
    ///
    /// Rate-limit responses are propagated up so higher layers may try much
    /// later; configuration errors cannot be fixed by waiting; cancellation
    /// unwinds immediately.
    pub fn is_no_retry(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Config(_) | Error::Canceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_exist_is_distinguishable() {
        assert!(Error::NotExist("certificates/x".into()).is_not_exist());
        assert!(!Error::Transient("timeout".into()).is_not_exist());
        assert!(!Error::Storage("disk full".into()).is_not_exist());
    }

    #[test]
    fn test_no_retry_classification() {
        assert!(Error::RateLimited("429".into()).is_no_retry());
        assert!(Error::Config("insecure CA URL".into()).is_no_retry());
        assert!(Error::Canceled.is_no_retry());

        assert!(!Error::Transient("connection reset".into()).is_no_retry());
        assert!(!Error::Validation("challenge failed".into()).is_no_retry());
        assert!(!Error::Internal("corrupted".into()).is_no_retry());
    }
}
