//! Queue Reader
//!
//! One bounded FIFO queue and one consumer task per partition. The consumer
//! owns that partition's stream holders, keyed by bucket start, and flushes a
//! holder once it has been idle for `idle_timeout`.
//!
//! A record for a bucket that was already flushed opens a new holder with
//! the next file generation, found from the directory listing the first
//! time the consumer sees the bucket, so flushed files are never replaced.
//!
//! The channel has room for `queue_capacity` records plus one reserved slot
//! for the poison pill. Record enqueue is gated by a semaphore of
//! `queue_capacity` permits, returned by the consumer on dequeue, so
//! producers wait when the queue is full while shutdown never does.

use crate::cache::{directory_listing_map_name, DistributedCache};
use crate::ingest::error::{IngestError, IngestResult};
use crate::ingest::stream_holder::{bucket_minute, CommitOutcome, StreamHolder};
use crate::ingest::PipelineConfig;
use crate::model::naming::MILLIS_PER_HOUR;
use crate::model::{time_bucket, HourPath, PartitionKey, Record};
use crate::registry::IndexRegistry;
use crate::store::DurableStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// Buckets older than this, relative to the newest one opened, are
/// forgotten; reopening one falls back to the directory listing.
const GENERATION_HORIZON_MS: i64 = 6 * MILLIS_PER_HOUR;

enum QueueItem {
    Record(Record),
    PoisonPill,
}

/// Gauges shared between a reader handle and its consumer task
#[derive(Debug, Default)]
pub struct ReaderCounters {
    depth: AtomicUsize,
    files_committed: AtomicU64,
    failed_commits: AtomicU64,
}

impl ReaderCounters {
    pub fn files_committed(&self) -> u64 {
        self.files_committed.load(Ordering::Relaxed)
    }

    pub fn failed_commits(&self) -> u64 {
        self.failed_commits.load(Ordering::Relaxed)
    }
}

/// Producer-side handle to one partition's queue
pub struct QueueReader {
    partition: PartitionKey,
    sender: mpsc::Sender<QueueItem>,
    permits: Arc<Semaphore>,
    counters: Arc<ReaderCounters>,
    shutdown_requested: AtomicBool,
    handle: JoinHandle<()>,
}

impl QueueReader {
    /// Create the queue and spawn its consumer task
    pub fn start(
        partition: PartitionKey,
        data_file_prefix: &str,
        registry: Arc<IndexRegistry>,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn DistributedCache>,
        config: PipelineConfig,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity + 1);
        let permits = Arc::new(Semaphore::new(capacity));
        let counters = Arc::new(ReaderCounters::default());

        let consumer = Consumer {
            partition,
            data_file_prefix: data_file_prefix.to_string(),
            registry,
            store,
            cache,
            config,
            holders: BTreeMap::new(),
            generations: BTreeMap::new(),
            permits: Arc::clone(&permits),
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(consumer.run(receiver));

        tracing::debug!(partition = %partition, prefix = %data_file_prefix, "Started queue reader");

        Self {
            partition,
            sender,
            permits,
            counters,
            shutdown_requested: AtomicBool::new(false),
            handle,
        }
    }

    /// Enqueue a record, waiting while the queue is full
    pub async fn add_to_queue(&self, record: Record) -> IngestResult<()> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(IngestError::ShuttingDown);
        }

        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IngestError::ReaderClosed(self.partition))?;
        // Returned by the consumer once the record is dequeued
        permit.forget();

        self.counters.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(QueueItem::Record(record)).await.is_err() {
            self.counters.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(IngestError::ReaderClosed(self.partition));
        }
        Ok(())
    }

    /// Ask the consumer to flush everything and stop. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        // The reserved slot is always free for the pill
        if self.sender.try_send(QueueItem::PoisonPill).is_err() {
            tracing::debug!(partition = %self.partition, "Queue reader already stopped");
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Records waiting in the queue
    pub fn queue_size(&self) -> usize {
        self.counters.depth.load(Ordering::SeqCst)
    }

    /// Shutdown was requested and the consumer has flushed and exited
    pub fn is_shutdown_completed(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst) && self.handle.is_finished()
    }

    pub fn partition(&self) -> PartitionKey {
        self.partition
    }

    pub fn counters(&self) -> &ReaderCounters {
        &self.counters
    }
}

/// State owned by the consumer task
struct Consumer {
    partition: PartitionKey,
    data_file_prefix: String,
    registry: Arc<IndexRegistry>,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn DistributedCache>,
    config: PipelineConfig,
    /// Open holders by bucket start
    holders: BTreeMap<i64, StreamHolder>,
    /// Next file generation of every bucket opened recently
    generations: BTreeMap<i64, u64>,
    permits: Arc<Semaphore>,
    counters: Arc<ReaderCounters>,
}

impl Consumer {
    async fn run(mut self, mut receiver: mpsc::Receiver<QueueItem>) {
        loop {
            match tokio::time::timeout(self.config.idle_timeout, receiver.recv()).await {
                Ok(Some(QueueItem::Record(record))) => {
                    self.dequeued();
                    self.handle_record(record).await;
                    self.flush_idle().await;
                }
                Ok(Some(QueueItem::PoisonPill)) => {
                    tracing::debug!(partition = %self.partition, "Poison pill received");
                    break;
                }
                Ok(None) => {
                    tracing::debug!(partition = %self.partition, "Queue closed");
                    break;
                }
                Err(_) => self.flush_idle().await,
            }
        }

        // Producers that raced the shutdown request may have queued more
        receiver.close();
        while let Ok(item) = receiver.try_recv() {
            if let QueueItem::Record(record) = item {
                self.dequeued();
                self.handle_record(record).await;
            }
        }

        self.flush_all().await;
        self.permits.close();

        tracing::debug!(
            partition = %self.partition,
            committed = self.counters.files_committed(),
            "Queue reader stopped"
        );
    }

    fn dequeued(&self) {
        self.counters.depth.fetch_sub(1, Ordering::SeqCst);
        self.permits.add_permits(1);
    }

    async fn handle_record(&mut self, record: Record) {
        let Some(timestamp_ms) = record.produced_timestamp_ms() else {
            tracing::warn!(partition = %self.partition, "Record without timestamp reached queue");
            return;
        };
        let bucket = time_bucket(timestamp_ms, self.config.bucket_duration_ms());

        if !self.holders.contains_key(&bucket) {
            let generation = match self.generations.get(&bucket) {
                Some(&next) => next,
                None => self.first_free_generation(bucket).await,
            };
            match StreamHolder::new(
                timestamp_ms,
                self.partition,
                &self.data_file_prefix,
                generation,
                &self.registry,
                &self.config,
            ) {
                Ok(holder) => {
                    if generation > 0 {
                        tracing::debug!(
                            partition = %self.partition,
                            file = %holder.file_name(),
                            "Reopened flushed bucket"
                        );
                    }
                    self.holders.insert(bucket, holder);
                    self.generations.insert(bucket, generation + 1);
                    self.forget_old_generations();
                }
                Err(e) => {
                    tracing::warn!(partition = %self.partition, error = %e, "Failed to open stream");
                    return;
                }
            }
        }

        if let Some(holder) = self.holders.get_mut(&bucket) {
            if let Err(e) = holder
                .write_model_to_stream(&record, self.cache.as_ref())
                .await
            {
                tracing::warn!(
                    partition = %self.partition,
                    file = %holder.file_name(),
                    error = %e,
                    "Failed to write record"
                );
            }
        }
    }

    /// Lowest generation no file of `bucket` uses yet, from the durable
    /// listing and the cached one. If the store cannot be listed the current
    /// time stands in, which cannot clash with an earlier file.
    async fn first_free_generation(&self, bucket: i64) -> u64 {
        let Some(hour) =
            HourPath::from_timestamp(self.partition.tenant_id, self.partition.device_id, bucket)
        else {
            return 0;
        };
        let minute = bucket_minute(&hour, bucket);
        let directory_key = hour.directory_key(&self.config.root_prefix);

        let mut names: Vec<String> = match self.store.list(&directory_key).await {
            Ok(listing) => listing.into_keys().collect(),
            Err(e) => {
                tracing::warn!(
                    partition = %self.partition,
                    dir = %directory_key,
                    error = %e,
                    "Cannot list hour directory, using a time-based file generation"
                );
                return chrono::Utc::now().timestamp_millis().max(1) as u64;
            }
        };
        match self.cache.entries(&directory_listing_map_name(&directory_key)).await {
            Ok(entries) => names.extend(entries.into_iter().map(|(name, _)| name)),
            Err(e) => {
                tracing::debug!(dir = %directory_key, error = %e, "Cached directory listing unavailable");
            }
        }

        names
            .iter()
            .filter_map(|name| hour.data_file_generation(&self.data_file_prefix, minute, name))
            .max()
            .map_or(0, |highest| highest + 1)
    }

    fn forget_old_generations(&mut self) {
        let Some(&newest) = self.generations.keys().next_back() else {
            return;
        };
        let horizon = newest.saturating_sub(GENERATION_HORIZON_MS);
        self.generations = self.generations.split_off(&horizon);
    }

    async fn flush_idle(&mut self) {
        let now = Instant::now();
        let idle: Vec<i64> = self
            .holders
            .iter()
            .filter(|(_, holder)| holder.is_idle(now, self.config.idle_timeout))
            .map(|(bucket, _)| *bucket)
            .collect();

        for bucket in idle {
            if let Some(holder) = self.holders.remove(&bucket) {
                self.commit(holder).await;
            }
        }
    }

    async fn flush_all(&mut self) {
        let holders = std::mem::take(&mut self.holders);
        for holder in holders.into_values() {
            self.commit(holder).await;
        }
    }

    async fn commit(&self, holder: StreamHolder) {
        let outcome = holder
            .commit_output_stream_to_file(self.store.as_ref(), self.cache.as_ref())
            .await;

        match outcome {
            CommitOutcome::Committed {
                directory_key,
                file_name,
                committed_at_ms,
                ..
            } => {
                self.counters.files_committed.fetch_add(1, Ordering::Relaxed);
                let map_name = directory_listing_map_name(&directory_key);
                if let Err(e) = self
                    .cache
                    .put(
                        &map_name,
                        &file_name,
                        committed_at_ms.to_string().into_bytes(),
                        self.config.index_cache_ttl,
                    )
                    .await
                {
                    tracing::warn!(map = %map_name, file = %file_name, error = %e, "Failed to append directory listing");
                }
            }
            CommitOutcome::Failed { .. } => {
                self.counters.failed_commits.fetch_add(1, Ordering::Relaxed);
            }
            CommitOutcome::Discarded => {}
        }
    }
}
