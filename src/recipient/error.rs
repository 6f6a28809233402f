//! Error types for the recipient store and reconciliation.

use thiserror::Error;

/// Error type for recipient operations.
#[derive(Error, Debug)]
pub enum RecipientError {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error from `SQLite`.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Recipient not found.
    #[error("Recipient not found: {0}")]
    NotFound(i64),

    /// Stored data could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for recipient operations.
pub type Result<T> = std::result::Result<T, RecipientError>;
