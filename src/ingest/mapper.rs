//! Record-to-Queue Mapper
//!
//! Entry point of the ingestion pipeline for one record kind. Validates
//! incoming records and routes each to the queue reader of its partition,
//! starting readers lazily. Reader lookup is double-checked: a shared read
//! lock for the common case, then the write lock with a recheck so that
//! exactly one reader is ever started per partition.

use crate::cache::DistributedCache;
use crate::ingest::error::{IngestError, IngestResult};
use crate::ingest::queue_reader::QueueReader;
use crate::ingest::PipelineConfig;
use crate::model::{HourPath, PartitionKey, Record, RecordKind};
use crate::registry::IndexRegistry;
use crate::store::DurableStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Pipeline gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records waiting across all queues
    pub queue_depth: usize,
    pub reader_count: usize,
    /// Readers whose consumer task has exited
    pub dead_reader_count: usize,
    /// Records rejected by validation
    pub dropped_records: u64,
    pub files_committed: u64,
    pub failed_commits: u64,
}

impl std::ops::AddAssign for PipelineStats {
    fn add_assign(&mut self, other: Self) {
        self.queue_depth += other.queue_depth;
        self.reader_count += other.reader_count;
        self.dead_reader_count += other.dead_reader_count;
        self.dropped_records += other.dropped_records;
        self.files_committed += other.files_committed;
        self.failed_commits += other.failed_commits;
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline Statistics:")?;
        writeln!(f, "  Readers:         {} ({} stopped)", self.reader_count, self.dead_reader_count)?;
        writeln!(f, "  Queue depth:     {}", self.queue_depth)?;
        writeln!(f, "  Dropped records: {}", self.dropped_records)?;
        writeln!(f, "  Files committed: {}", self.files_committed)?;
        write!(f, "  Failed commits:  {}", self.failed_commits)
    }
}

/// Routes records of one kind to per-partition queue readers
pub struct RecordQueueMapper {
    kind: RecordKind,
    registry: Arc<IndexRegistry>,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn DistributedCache>,
    config: PipelineConfig,
    readers: RwLock<HashMap<PartitionKey, Arc<QueueReader>>>,
    shutdown_requested: AtomicBool,
    dropped_records: AtomicU64,
}

impl RecordQueueMapper {
    pub fn new(
        kind: RecordKind,
        registry: Arc<IndexRegistry>,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn DistributedCache>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            kind,
            registry,
            store,
            cache,
            config,
            readers: RwLock::new(HashMap::new()),
            shutdown_requested: AtomicBool::new(false),
            dropped_records: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Route one record to its partition queue.
    ///
    /// Returns `Ok(false)` when the record was dropped by validation, and
    /// waits while the partition queue is full.
    pub async fn add_model(&self, record: Record) -> IngestResult<bool> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(IngestError::ShuttingDown);
        }

        let partition = match self.validate(&record) {
            Ok(partition) => partition,
            Err(reason) => {
                self.dropped_records.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    prefix = %self.kind.file_name_prefix(),
                    reason = %reason,
                    "Dropping invalid record"
                );
                return Ok(false);
            }
        };

        let reader = self.reader_for(partition).await?;
        reader.add_to_queue(record).await?;
        Ok(true)
    }

    fn validate(&self, record: &Record) -> Result<PartitionKey, String> {
        if let Some(field) = record.missing_field() {
            return Err(format!("missing {}", field));
        }
        if record.kind() != self.kind {
            return Err(format!(
                "record kind {} does not belong to prefix {}",
                record.kind(),
                self.kind.file_name_prefix()
            ));
        }
        let partition = record
            .partition_key()
            .ok_or_else(|| "missing partition key".to_string())?;
        let timestamp_ms = record.produced_timestamp_ms().unwrap_or_default();
        if HourPath::from_timestamp(partition.tenant_id, partition.device_id, timestamp_ms).is_none() {
            return Err(format!("timestamp {} out of range", timestamp_ms));
        }
        Ok(partition)
    }

    async fn reader_for(&self, partition: PartitionKey) -> IngestResult<Arc<QueueReader>> {
        {
            let readers = self.readers.read().await;
            if let Some(reader) = readers.get(&partition) {
                if reader.is_alive() {
                    return Ok(Arc::clone(reader));
                }
            }
        }

        let mut readers = self.writers_guard().await?;
        if let Some(reader) = readers.get(&partition) {
            if reader.is_alive() {
                return Ok(Arc::clone(reader));
            }
            tracing::warn!(partition = %partition, "Replacing stopped queue reader");
        }

        let reader = Arc::new(QueueReader::start(
            partition,
            self.kind.file_name_prefix(),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            self.config.clone(),
        ));
        readers.insert(partition, Arc::clone(&reader));

        tracing::info!(
            partition = %partition,
            prefix = %self.kind.file_name_prefix(),
            readers = readers.len(),
            "Created queue reader"
        );
        Ok(reader)
    }

    /// Write lock on the reader map, refused once shutdown has begun
    async fn writers_guard(
        &self,
    ) -> IngestResult<tokio::sync::RwLockWriteGuard<'_, HashMap<PartitionKey, Arc<QueueReader>>>>
    {
        let guard = self.readers.write().await;
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(IngestError::ShuttingDown);
        }
        Ok(guard)
    }

    /// Ask every reader to flush and stop. Returns without waiting.
    pub async fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let readers = self.readers.read().await;
        tracing::info!(
            prefix = %self.kind.file_name_prefix(),
            readers = readers.len(),
            "Shutting down queue readers"
        );
        for reader in readers.values() {
            reader.shutdown();
        }
    }

    /// Shutdown was requested and every reader has drained
    pub async fn is_shutdown_completed(&self) -> bool {
        if !self.shutdown_requested.load(Ordering::SeqCst) {
            return false;
        }
        self.readers
            .read()
            .await
            .values()
            .all(|reader| reader.is_shutdown_completed())
    }

    /// Poll until shutdown completes or `timeout` elapses
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_shutdown_completed().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stats(&self) -> PipelineStats {
        let readers = self.readers.read().await;
        let mut stats = PipelineStats {
            reader_count: readers.len(),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            ..PipelineStats::default()
        };
        for reader in readers.values() {
            stats.queue_depth += reader.queue_size();
            if !reader.is_alive() {
                stats.dead_reader_count += 1;
            }
            stats.files_committed += reader.counters().files_committed();
            stats.failed_commits += reader.counters().failed_commits();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::model::naming::MILLIS_PER_MINUTE;
    use crate::model::SensorReading;
    use crate::store::{scan_lines, MemoryStore};

    // 2023-11-14T22:13:20Z
    const TS: i64 = 1_700_000_000_000;

    fn mapper(store: &Arc<MemoryStore>) -> RecordQueueMapper {
        RecordQueueMapper::new(
            RecordKind::Sensor,
            Arc::new(IndexRegistry::from_record_kinds()),
            Arc::clone(store) as Arc<dyn DurableStore>,
            Arc::new(InMemoryCache::new()),
            PipelineConfig {
                minutes_per_file: 15,
                idle_timeout: Duration::from_secs(60),
                queue_capacity: 8,
                ..PipelineConfig::default()
            },
        )
    }

    async fn lines_of(store: &MemoryStore, key: &str) -> Vec<Record> {
        let data = store.read_bytes(key).await.unwrap();
        let mut records = Vec::new();
        scan_lines(&data, |_, line| records.push(Record::from_line(line).unwrap())).unwrap();
        records
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let mapper = mapper(&store);

        for i in 0..4 {
            let device = if i % 2 == 0 { 1 } else { 2 };
            assert!(mapper
                .add_model(Record::sensor(3, device, TS + i, "temp", i as f64))
                .await
                .unwrap());
        }
        assert_eq!(mapper.stats().await.reader_count, 2);

        mapper.shutdown().await;
        assert!(mapper.wait_for_shutdown(Duration::from_secs(5)).await);

        for device in [1i64, 2] {
            let key = format!("events/3/{}/2023/11/14/22/se_3_{}_2023_11_14_22_00.jsonl.zip", device, device);
            let records = lines_of(&store, &key).await;
            assert_eq!(records.len(), 2);
            assert!(records.iter().all(|r| r.device_id() == Some(device)));
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_loses_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mapper = mapper(&store);

        // Spread over three 15-minute buckets
        let offsets = [0, 5, 20, 25, 40];
        for (i, minute) in offsets.iter().enumerate() {
            let ts = TS - 13 * MILLIS_PER_MINUTE + minute * MILLIS_PER_MINUTE;
            mapper
                .add_model(Record::sensor(1, 1, ts, format!("s{}", i), 0.0))
                .await
                .unwrap();
        }
        mapper.shutdown().await;
        mapper.shutdown().await;
        assert!(mapper.wait_for_shutdown(Duration::from_secs(5)).await);

        let mut total = 0;
        for key in store.keys() {
            total += lines_of(&store, &key).await.len();
        }
        assert_eq!(total, offsets.len());
        assert_eq!(store.keys().len(), 3);

        let stats = mapper.stats().await;
        assert_eq!(stats.files_committed, 3);
        assert_eq!(stats.dead_reader_count, 1);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_invalid_records_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let mapper = mapper(&store);

        let no_device = Record::Sensor(SensorReading {
            tenant_id: Some(1),
            device_id: None,
            produced_timestamp_ms: Some(TS),
            sensor: "temp".to_string(),
            value: 1.0,
            unit: None,
        });
        assert!(!mapper.add_model(no_device).await.unwrap());

        let wrong_kind = Record::location(1, 1, TS, 0.0, 0.0);
        assert!(!mapper.add_model(wrong_kind).await.unwrap());

        let stats = mapper.stats().await;
        assert_eq!(stats.dropped_records, 2);
        assert_eq!(stats.reader_count, 0);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let mapper = mapper(&store);
        assert!(!mapper.is_shutdown_completed().await);

        mapper.shutdown().await;
        assert!(mapper.is_shutdown_completed().await);
        let err = mapper
            .add_model(Record::sensor(1, 1, TS, "temp", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_concurrent_producers_share_one_reader() {
        let store = Arc::new(MemoryStore::new());
        let mapper = Arc::new(mapper(&store));

        let mut tasks = Vec::new();
        for producer in 0..4 {
            let mapper = Arc::clone(&mapper);
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    let ts = TS + producer * 100 + i;
                    mapper
                        .add_model(Record::sensor(9, 9, ts, "temp", 0.0))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(mapper.stats().await.reader_count, 1);

        mapper.shutdown().await;
        assert!(mapper.wait_for_shutdown(Duration::from_secs(5)).await);
        let key = "events/9/9/2023/11/14/22/se_9_9_2023_11_14_22_00.jsonl.zip";
        assert_eq!(lines_of(&store, key).await.len(), 40);
    }

    #[test]
    fn test_stats_display() {
        let stats = PipelineStats {
            reader_count: 2,
            dead_reader_count: 1,
            ..PipelineStats::default()
        };
        assert!(stats.to_string().contains("Readers:         2 (1 stopped)"));
    }
}
