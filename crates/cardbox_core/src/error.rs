//! Error types for the collection layer.

use thiserror::Error;

/// Result type for collection operations.
pub type CollectionResult<T> = Result<T, CollectionError>;

/// Errors that can occur in the collection layer.
#[derive(Error, Debug)]
pub enum CollectionError {
    /// Database error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a metadata column or payload.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A database file failed its integrity check.
    #[error("corrupt collection: {0}")]
    Corrupt(String),

    /// A media filename was rejected.
    #[error("invalid media filename: {0:?}")]
    InvalidFilename(String),
}
