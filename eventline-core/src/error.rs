//! Error types for eventline-core

use thiserror::Error;

/// Main error type for the eventline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Local persistence failed (queue or identity record)
    #[error("storage error: {0}")]
    Storage(String),

    /// Event name or properties rejected before enqueue
    #[error("invalid event: {0}")]
    Validation(String),

    /// Delivery pipeline could not be set up or driven
    #[error("delivery error: {0}")]
    Delivery(String),
}

/// Result type alias for eventline-core
pub type Result<T> = std::result::Result<T, Error>;
