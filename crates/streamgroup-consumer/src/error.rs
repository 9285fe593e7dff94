//! Error types for the consumer facade.
//!
//! Uses snafu for structured error handling with context.

use std::path::PathBuf;

use snafu::Snafu;
use streamgroup_coordination::CoordinationError;

/// Errors returned by [`crate::MessageConsumer`] and [`crate::ConsumerConfig`].
///
/// Transient backend failures during consumption never surface here; the background loops log
/// them and retry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConsumerError {
    /// The subscribe call was rejected before anything was started.
    #[snafu(display("invalid subscription: {reason}"))]
    InvalidSubscription {
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration failed validation.
    #[snafu(display("invalid consumer configuration: {message}"))]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },

    /// The consumer was already closed.
    #[snafu(display("consumer '{consumer_id}' is closed"))]
    Closed {
        /// Id of the closed consumer.
        consumer_id: String,
    },

    /// Error from the coordination layer.
    #[snafu(display("coordination error: {source}"))]
    Coordination {
        /// The underlying error.
        source: CoordinationError,
    },

    /// The configuration file could not be read.
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadConfigFile {
        /// Path that was read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The configuration is not valid TOML for [`crate::ConsumerConfig`].
    #[snafu(display("failed to parse config from {origin}: {source}"))]
    ParseConfig {
        /// File path, or `<string>` for inline input.
        origin: String,
        /// The underlying error.
        source: toml::de::Error,
    },
}

impl From<CoordinationError> for ConsumerError {
    fn from(source: CoordinationError) -> Self {
        ConsumerError::Coordination { source }
    }
}
