//! Error types for the closing core

use crate::operation::OperationStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type for closing core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure and internal errors.
///
/// Outcomes a caller is expected to act on (duplicate, contention, invalid
/// input) are not errors here; they travel as [`crate::OperationError`]
/// inside a [`crate::SubmitOutcome`].
#[derive(Error, Debug)]
pub enum Error {
    /// Backing store error
    #[error("Store error: {0}")]
    Store(String),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Closing record persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Illegal state machine transition
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: OperationStatus,
        /// Requested status
        to: OperationStatus,
    },

    /// Operation not found in the active registry or history
    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
