//! Ingestion pipeline error types

use crate::model::PartitionKey;
use crate::store::{CodecError, StoreError};
use thiserror::Error;

/// Errors surfaced to producers and raised on the partition tasks
#[derive(Error, Debug)]
pub enum IngestError {
    /// The consumer task of a partition is gone
    #[error("Queue reader for partition {0} is closed")]
    ReaderClosed(PartitionKey),

    /// Shutdown was requested; no new records are accepted
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    /// Timestamp cannot be placed on the UTC calendar
    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    /// Durable store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Data file encoding failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Codec(CodecError::Json(e))
    }
}

/// Result type alias for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;
