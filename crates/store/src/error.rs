//! Error types for trik storage

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Async connection error
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write would push the trik past its storage quota
    #[error("Storage quota exceeded: current={used}, adding={adding}, max={max}")]
    QuotaExceeded { used: u64, adding: u64, max: u64 },

    /// Database corruption or schema mismatch
    #[error("Database error: {0}")]
    Database(String),
}

impl Error {
    /// Create a database error with a message
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a quota exceeded error
    pub fn quota_exceeded(used: u64, adding: u64, max: u64) -> Self {
        Self::QuotaExceeded { used, adding, max }
    }
}
