//! Error types for the sync server.

use cardbox_core::CollectionError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Authentication failed or no session matched the supplied keys.
    #[error("forbidden")]
    Forbidden,

    /// The client version is known to be too old to sync correctly.
    #[error("client too old; an upgrade is required")]
    ObsoleteClient,

    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A media upload was rejected before extraction.
    #[error("malformed media upload: {0}")]
    MalformedUpload(String),

    /// A full-sync upload failed its integrity check.
    #[error("corrupt collection upload: {0}")]
    CorruptUpload(String),

    /// A job crashed inside its collection worker.
    #[error("worker failed while running {operation}")]
    WorkerFailed {
        /// The operation the failing job was running.
        operation: String,
    },

    /// The collection worker went away before answering.
    #[error("collection worker unavailable")]
    WorkerGone,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Collection layer error.
    #[error(transparent)]
    Collection(#[from] CollectionError),

    /// Session or auth database error.
    #[error("session store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// JSON encoding/decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Zip archive error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::Forbidden
                | ServerError::ObsoleteClient
                | ServerError::InvalidRequest(_)
                | ServerError::MalformedUpload(_)
                | ServerError::CorruptUpload(_)
                | ServerError::Json(_)
                | ServerError::Zip(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// The HTTP status the transport should answer with. Detail beyond
    /// the status stays in the server log.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::Forbidden => 403,
            ServerError::ObsoleteClient => 501,
            ServerError::InvalidRequest(_)
            | ServerError::MalformedUpload(_)
            | ServerError::CorruptUpload(_)
            | ServerError::Json(_)
            | ServerError::Zip(_) => 400,
            _ => 500,
        }
    }
}
