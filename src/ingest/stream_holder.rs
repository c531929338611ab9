//! Stream Holder
//!
//! Accumulates the records of one partition that fall into one time bucket:
//! the compressed data file being written plus one `RecordIndex` per index
//! registered for the data-file prefix. Owned by exactly one queue reader
//! task, so nothing here is locked.
//!
//! Commit is consuming: a holder is flushed at most once.

use crate::cache::{record_index_map_name, recent_map_name, DistributedCache};
use crate::ingest::error::{IngestError, IngestResult};
use crate::ingest::PipelineConfig;
use crate::model::naming::MILLIS_PER_MINUTE;
use crate::model::{time_bucket, HourPath, PartitionKey, Record, RecordIndex, ValueExtractor};
use crate::registry::IndexRegistry;
use crate::store::{DurableStore, ZipEntryWriter};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Result of flushing a holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was written; no file uploaded
    Discarded,
    /// Data file uploaded
    Committed {
        directory_key: String,
        file_name: String,
        lines: u64,
        /// Wall-clock commit time in epoch milliseconds
        committed_at_ms: i64,
    },
    /// Upload failed; the bucket's records are lost
    Failed { file_key: String, lines: u64 },
}

/// One open data file and its in-progress indexes
pub struct StreamHolder {
    partition: PartitionKey,
    data_file_prefix: String,
    bucket_start_ms: i64,
    generation: u64,
    directory_key: String,
    file_name: String,
    writer: ZipEntryWriter,
    extractors: Vec<(String, ValueExtractor)>,
    indexes: BTreeMap<String, RecordIndex>,
    line_count: u64,
    last_write: Instant,
    staging_map: String,
    staging_ttl: Option<Duration>,
    index_cache_ttl: Option<Duration>,
}

impl StreamHolder {
    /// Open the bucket containing `first_timestamp_ms`. `generation` tells
    /// apart the files of a bucket that was flushed and reopened.
    pub fn new(
        first_timestamp_ms: i64,
        partition: PartitionKey,
        data_file_prefix: &str,
        generation: u64,
        registry: &IndexRegistry,
        config: &PipelineConfig,
    ) -> IngestResult<Self> {
        let bucket_start_ms = time_bucket(first_timestamp_ms, config.bucket_duration_ms());
        let hour =
            HourPath::from_timestamp(partition.tenant_id, partition.device_id, bucket_start_ms)
                .ok_or(IngestError::InvalidTimestamp(first_timestamp_ms))?;
        let minute = bucket_minute(&hour, bucket_start_ms);

        let file_name = hour.data_file_name(data_file_prefix, minute, generation);
        let writer = ZipEntryWriter::create(&file_name)?;

        let extractors: Vec<(String, ValueExtractor)> = registry
            .extractors_for_prefix(data_file_prefix)
            .into_iter()
            .map(|(name, extractor)| (name.to_string(), extractor))
            .collect();
        let indexes = extractors
            .iter()
            .map(|(name, _)| (name.clone(), RecordIndex::new()))
            .collect();

        Ok(Self {
            partition,
            data_file_prefix: data_file_prefix.to_string(),
            bucket_start_ms,
            generation,
            directory_key: hour.directory_key(&config.root_prefix),
            file_name,
            writer,
            extractors,
            indexes,
            line_count: 0,
            last_write: Instant::now(),
            staging_map: recent_map_name(data_file_prefix, partition),
            staging_ttl: config.staging_ttl,
            index_cache_ttl: config.index_cache_ttl,
        })
    }

    /// Append one record as the next line and index it under that line
    /// number. The record is also staged in the cache so it is readable
    /// before the bucket is flushed.
    pub async fn write_model_to_stream(
        &mut self,
        record: &Record,
        cache: &dyn DistributedCache,
    ) -> IngestResult<()> {
        let line = record.to_line()?;
        self.writer.write_line(&line)?;

        let line_number = self.line_count;
        for (name, extractor) in &self.extractors {
            let index = self.indexes.entry(name.clone()).or_default();
            for value in extractor(record) {
                index.add(&value, line_number);
            }
        }
        self.line_count += 1;
        self.last_write = Instant::now();

        if let Some(ttl) = self.staging_ttl {
            let key = match self.generation {
                0 => format!("{}_{}", self.bucket_start_ms, line_number),
                n => format!("{}_{}_{}", self.bucket_start_ms, n, line_number),
            };
            if let Err(e) = cache
                .put(&self.staging_map, &key, line.into_bytes(), Some(ttl))
                .await
            {
                tracing::warn!(
                    partition = %self.partition,
                    map = %self.staging_map,
                    error = %e,
                    "Failed to stage record in cache"
                );
            }
        }

        Ok(())
    }

    /// Finish the data file, upload it and publish its record indexes.
    ///
    /// A holder with no lines is discarded. An upload failure is logged and
    /// reported as [`CommitOutcome::Failed`]; it is not retried.
    pub async fn commit_output_stream_to_file(
        self,
        store: &dyn DurableStore,
        cache: &dyn DistributedCache,
    ) -> CommitOutcome {
        let file_key = self.file_key();

        if self.line_count == 0 {
            tracing::debug!(file = %file_key, "Discarding empty stream");
            return CommitOutcome::Discarded;
        }

        let raw_bytes = self.writer.bytes_written();
        let bytes = match self.writer.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(file = %file_key, error = %e, "Failed to finish data file");
                return CommitOutcome::Failed {
                    file_key,
                    lines: self.line_count,
                };
            }
        };
        let size = bytes.len();

        if let Err(e) = store.upload(bytes, &file_key).await {
            tracing::error!(
                file = %file_key,
                lines = self.line_count,
                error = %e,
                "Failed to upload data file, records in this bucket are lost"
            );
            return CommitOutcome::Failed {
                file_key,
                lines: self.line_count,
            };
        }

        for (index_name, index) in &self.indexes {
            let map_name = record_index_map_name(&self.data_file_prefix, index_name);
            let result = match index.to_json() {
                Ok(json) => {
                    cache
                        .put(&map_name, &self.file_name, json, self.index_cache_ttl)
                        .await
                }
                Err(e) => {
                    tracing::warn!(index = %index_name, error = %e, "Failed to encode record index");
                    continue;
                }
            };
            if let Err(e) = result {
                tracing::warn!(
                    map = %map_name,
                    file = %self.file_name,
                    error = %e,
                    "Failed to cache record index"
                );
            }
        }

        tracing::info!(
            file = %file_key,
            lines = self.line_count,
            raw_bytes,
            bytes = size,
            "Committed data file"
        );

        CommitOutcome::Committed {
            directory_key: self.directory_key,
            file_name: self.file_name,
            lines: self.line_count,
            committed_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether nothing was written for at least `idle_timeout`
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_write) >= idle_timeout
    }

    pub fn bucket_start_ms(&self) -> i64 {
        self.bucket_start_ms
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Full store key of the data file
    pub fn file_key(&self) -> String {
        format!("{}{}", self.directory_key, self.file_name)
    }

    pub fn line_count(&self) -> u64 {
        self.line_count
    }

    /// In-progress index for `index_name`
    pub fn record_index(&self, index_name: &str) -> Option<&RecordIndex> {
        self.indexes.get(index_name)
    }
}

/// Minute of the hour at which the bucket starting at `bucket_start_ms` opens
pub fn bucket_minute(hour: &HourPath, bucket_start_ms: i64) -> u32 {
    ((bucket_start_ms - hour.start_ms()) / MILLIS_PER_MINUTE) as u32
}
