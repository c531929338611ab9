//! Ingestion Pipeline
//!
//! Write path: Record → Mapper → per-partition Queue Reader → Stream Holder
//! → zip data file in the durable store.
//!
//! - **mapper**: validation and routing by (tenant, device)
//! - **queue_reader**: bounded queue plus one consumer task per partition
//! - **stream_holder**: one open data file per time bucket, with its indexes
//! - **error**: error types
//!
//! Flushes are at-most-once-effort: a failed upload is logged and the
//! bucket's records are lost, never retried.

pub mod error;
pub mod mapper;
pub mod queue_reader;
pub mod stream_holder;

pub use error::{IngestError, IngestResult};
pub use mapper::{PipelineStats, RecordQueueMapper};
pub use queue_reader::QueueReader;
pub use stream_holder::{CommitOutcome, StreamHolder};

use crate::cache::DistributedCache;
use crate::model::naming::MILLIS_PER_MINUTE;
use crate::model::{Record, RecordKind};
use crate::registry::IndexRegistry;
use crate::store::DurableStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Runtime settings for the ingestion pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// First component of every hour directory key
    pub root_prefix: String,
    /// Bucket width; divides 60
    pub minutes_per_file: u32,
    /// Buckets idle this long are flushed
    pub idle_timeout: Duration,
    /// Records buffered per partition
    pub queue_capacity: usize,
    /// Lifetime of staged records, `None` to skip staging
    pub staging_ttl: Option<Duration>,
    /// Lifetime of cached record indexes and directory listings, `None` to
    /// keep them until evicted
    pub index_cache_ttl: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root_prefix: "events".to_string(),
            minutes_per_file: 15,
            idle_timeout: Duration::from_secs(60),
            queue_capacity: 5000,
            staging_ttl: Some(Duration::from_secs(2 * 60 * 60)),
            index_cache_ttl: Some(Duration::from_secs(3 * 24 * 60 * 60)),
        }
    }
}

impl PipelineConfig {
    pub fn bucket_duration_ms(&self) -> i64 {
        i64::from(self.minutes_per_file.max(1)) * MILLIS_PER_MINUTE
    }
}

/// One mapper per record kind, so a mixed stream can be fed in directly
pub struct IngestPipeline {
    mappers: BTreeMap<RecordKind, RecordQueueMapper>,
}

impl IngestPipeline {
    /// Build a mapper for every record kind the registry has indexes for
    pub fn new(
        registry: Arc<IndexRegistry>,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn DistributedCache>,
        config: PipelineConfig,
    ) -> Self {
        let mappers = registry
            .all_file_name_prefixes()
            .filter_map(RecordKind::from_file_name_prefix)
            .map(|kind| {
                let mapper = RecordQueueMapper::new(
                    kind,
                    Arc::clone(&registry),
                    Arc::clone(&store),
                    Arc::clone(&cache),
                    config.clone(),
                );
                (kind, mapper)
            })
            .collect();
        Self { mappers }
    }

    /// Route a record to the mapper of its kind; `Ok(false)` if dropped
    pub async fn add_model(&self, record: Record) -> IngestResult<bool> {
        match self.mappers.get(&record.kind()) {
            Some(mapper) => mapper.add_model(record).await,
            None => {
                tracing::warn!(kind = %record.kind(), "No mapper registered for record kind");
                Ok(false)
            }
        }
    }

    pub async fn shutdown(&self) {
        for mapper in self.mappers.values() {
            mapper.shutdown().await;
        }
    }

    pub async fn is_shutdown_completed(&self) -> bool {
        for mapper in self.mappers.values() {
            if !mapper.is_shutdown_completed().await {
                return false;
            }
        }
        true
    }

    /// Poll until every mapper has drained or `timeout` elapses
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        for mapper in self.mappers.values() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !mapper.wait_for_shutdown(remaining).await {
                return false;
            }
        }
        true
    }

    /// Gauges summed over every mapper
    pub async fn stats(&self) -> PipelineStats {
        let mut total = PipelineStats::default();
        for mapper in self.mappers.values() {
            total += mapper.stats().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::model::Severity;
    use crate::store::MemoryStore;

    #[test]
    fn test_bucket_duration() {
        let config = PipelineConfig {
            minutes_per_file: 10,
            ..PipelineConfig::default()
        };
        assert_eq!(config.bucket_duration_ms(), 600_000);
    }

    #[tokio::test]
    async fn test_mixed_stream_is_split_by_kind() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(
            Arc::new(IndexRegistry::from_record_kinds()),
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::new(InMemoryCache::new()),
            PipelineConfig::default(),
        );

        let ts = 1_700_000_000_000;
        pipeline.add_model(Record::sensor(1, 1, ts, "temp", 1.0)).await.unwrap();
        pipeline
            .add_model(Record::event(1, 1, ts, "door_open", Severity::Info))
            .await
            .unwrap();
        pipeline.add_model(Record::location(1, 1, ts, 1.0, 2.0)).await.unwrap();

        pipeline.shutdown().await;
        assert!(pipeline.wait_for_shutdown(Duration::from_secs(5)).await);
        assert!(pipeline.is_shutdown_completed().await);

        let names: Vec<String> = store
            .keys()
            .iter()
            .map(|key| crate::model::naming::base_name(key).to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "ev_1_1_2023_11_14_22_00.jsonl.zip",
                "loc_1_1_2023_11_14_22_00.jsonl.zip",
                "se_1_1_2023_11_14_22_00.jsonl.zip",
            ]
        );
        assert_eq!(pipeline.stats().await.files_committed, 3);
    }
}
