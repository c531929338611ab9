//! Hourly Index Aggregation
//!
//! Consolidates the per-file record indexes of one hour directory into one
//! `DirectoryIndex` per (data-file prefix, index name), stored next to the
//! data files. Per-file indexes come from the cache when the ingestion
//! pipeline published them, otherwise they are rebuilt by streaming the raw
//! data file.

pub mod error;
pub mod hourly;

pub use error::{AggregateError, AggregateResult};
pub use hourly::{AggregationReport, HourlyIndexAggregator};

/// Runtime settings for the hourly aggregator
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// First component of every hour directory key
    pub root_prefix: String,
    /// Prefix of hourly directory index file names
    pub hourly_index_marker: String,
    /// Hours this close to now are still being written and are skipped
    pub recent_exclusion: chrono::Duration,
    /// Lifetime of record indexes written back to the cache
    pub index_cache_ttl: Option<std::time::Duration>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            root_prefix: "events".to_string(),
            hourly_index_marker: "hourly_".to_string(),
            recent_exclusion: chrono::Duration::hours(2),
            index_cache_ttl: Some(std::time::Duration::from_secs(3 * 24 * 60 * 60)),
        }
    }
}
