//! Error types for coordination primitives.

use snafu::Snafu;
use streamgroup_core::KeyValueStoreError;
use streamgroup_core::StreamError;

/// Errors from coordination primitives.
///
/// Losing a lease or a CAS race is not an error: those outcomes are reported through return
/// values (`Ok(false)` / `Ok(None)`). What remains here are backend failures and bad data.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// Data in storage is corrupted or unparseable.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    CorruptedData {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// Underlying key-value store error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: KeyValueStoreError,
    },

    /// Underlying stream backend error.
    #[snafu(display("stream error: {source}"))]
    Stream {
        /// The underlying error.
        source: StreamError,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// The group definition is unusable (empty subscriber id, no channels, ...).
    #[snafu(display("invalid consumer group: {reason}"))]
    InvalidGroup {
        /// Why the group was rejected.
        reason: String,
    },
}

impl CoordinationError {
    /// True for backend failures that are expected to clear on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinationError::Storage { source } => source.is_transient(),
            CoordinationError::Stream { source } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<KeyValueStoreError> for CoordinationError {
    fn from(source: KeyValueStoreError) -> Self {
        CoordinationError::Storage { source }
    }
}

impl From<StreamError> for CoordinationError {
    fn from(source: StreamError) -> Self {
        CoordinationError::Stream { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}
