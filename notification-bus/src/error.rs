//! Error types for notification bus

use thiserror::Error;

/// Notification bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Delivery rejected by the monitoring endpoint
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
