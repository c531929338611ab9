//! Aggregation error types

use crate::store::{CodecError, StoreError};
use thiserror::Error;

/// Errors that abort an aggregation run for an hour
#[derive(Error, Debug)]
pub enum AggregateError {
    /// The hour directory could not be listed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An index container could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Calendar fields do not name a real UTC hour
    #[error("Invalid hour: {0}")]
    InvalidHour(String),
}

/// Result type alias for aggregation operations
pub type AggregateResult<T> = Result<T, AggregateError>;
