//! Backend error types.
//!
//! A missing key is not an error for the key-value store (reads return `kv: None`). A missing
//! stream is [`StreamError::KeyNotFound`]. Callers in the coordination and consumption loops retry
//! transient failures on their normal cadence and never treat them as fatal.

use thiserror::Error;

/// Errors returned by a [`crate::KeyValueStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyValueStoreError {
    #[error("compare-and-swap failed for key '{key}'")]
    CompareAndSwapFailed {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("operation failed: {reason}")]
    Failed { reason: String },
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl KeyValueStoreError {
    /// True for failures that may succeed if the same operation is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KeyValueStoreError::Failed { .. } | KeyValueStoreError::Timeout { .. } | KeyValueStoreError::Unavailable { .. }
        )
    }
}

/// Errors returned by a [`crate::StreamClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The stream key does not exist yet. Not a failure for consumers: they back off and retry.
    #[error("stream '{key}' does not exist")]
    KeyNotFound { key: String },
    #[error("invalid stream key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("stream operation failed: {reason}")]
    Failed { reason: String },
    #[error("stream operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("stream backend unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StreamError {
    /// True for failures that may succeed if the same operation is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Failed { .. } | StreamError::Timeout { .. } | StreamError::Unavailable { .. }
        )
    }
}
