//! Durable store and container codec error types

use thiserror::Error;

/// Errors raised by a durable file store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested file does not exist
    #[error("File not found: {0}")]
    NotFound(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key escapes the store root or is otherwise unusable
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors raised while encoding or decoding a zip container
#[derive(Error, Debug)]
pub enum CodecError {
    /// Zip format error
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// I/O while writing or reading the entry
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON payload could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Container does not hold exactly one entry
    #[error("Expected exactly one entry, found {0}")]
    EntryCount(usize),
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
