//! Error types for Quire
//!
//! This module defines the common error taxonomy used throughout the
//! store and sync layers.

use thiserror::Error;

/// Common result type for Quire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed low-level cause carried by [`Error::Store`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Common error type for Quire
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("key not found: {namespace}/{key}")]
    NotFound { namespace: String, key: String },

    #[error("{op} failed on {namespace}/{key}: {source}")]
    Store {
        op: &'static str,
        namespace: String,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    // Index errors
    #[error("index update failed after primary write (indexes: {}): {reason}", indexes.join(", "))]
    IndexConsistency { indexes: Vec<String>, reason: String },

    #[error("unknown index: {0}")]
    UnknownIndex(String),

    // Replication errors
    #[error("record {id} could not be converted: {reason}")]
    Conversion {
        id: String,
        payload: String,
        reason: String,
    },

    #[error("sync transport error: {0}")]
    SyncTransport(String),

    #[error("request timeout")]
    Timeout,

    #[error("sync cursor is corrupt: {0}")]
    CorruptCursor(String),

    // Layout errors
    #[error("storage version mismatch: found {found}, expected {expected}")]
    SchemaVersion { found: u32, expected: u32 },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Wrap a low-level error with the operation, namespace and key it hit
    pub fn store(
        op: &'static str,
        namespace: impl Into<String>,
        key: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Store {
            op,
            namespace: namespace.into(),
            key: key.into(),
            source: source.into(),
        }
    }

    /// Create a conversion error for a remote record
    pub fn conversion(
        id: impl Into<String>,
        payload: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            id: id.into(),
            payload: payload.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::SyncTransport(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the primary write is durable but one or more indexes lag behind
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::IndexConsistency { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Self::Serialization(e.to_string())
        } else {
            Self::Deserialization(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::SyncTransport("reset".into()).is_retryable());
        assert!(!Error::CorruptCursor("x".into()).is_retryable());
        assert!(!Error::SchemaVersion { found: 0, expected: 1 }.is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("topics", "a").is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_error_context_in_message() {
        let err = Error::store("put", "topics", "alpha", Error::internal("disk gone"));
        let msg = err.to_string();
        assert!(msg.contains("put"));
        assert!(msg.contains("topics/alpha"));
        assert!(msg.contains("disk gone"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_index_consistency_lists_indexes() {
        let err = Error::IndexConsistency {
            indexes: vec!["backrefs".into(), "terms".into()],
            reason: "commit failed".into(),
        };
        assert!(err.is_degraded());
        assert!(err.to_string().contains("backrefs, terms"));
    }
}
