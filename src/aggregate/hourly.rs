//! Hourly Index Aggregator
//!
//! For one hour directory and one data-file prefix:
//!
//! 1. Load the existing directory index of every registered index name
//! 2. Find the data files the index does not cover, or covers with an entry
//!    older than the file
//! 3. Fill those entries from the cache, else rebuild them from the raw file
//! 4. Upload the directory indexes that changed
//!
//! No lock is taken: concurrent runs over the same hour race and the last
//! upload wins, which is harmless because both derive from the same files.

use crate::aggregate::error::{AggregateError, AggregateResult};
use crate::aggregate::AggregatorConfig;
use crate::cache::{directory_listing_map_name, record_index_map_name, DistributedCache};
use crate::model::naming::MILLIS_PER_HOUR;
use crate::model::{floor_hour, DirectoryIndex, HourPath, Record, RecordIndex, ValueExtractor};
use crate::registry::IndexRegistry;
use crate::store::{decode_json, encode_json, scan_lines, DurableStore};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of an aggregation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub hours: u64,
    /// Hours whose directory could not be listed
    pub failed_hours: u64,
    /// (hour, prefix) pairs processed
    pub prefixes: u64,
    pub indexes_written: u64,
    pub indexes_unchanged: u64,
    /// Per-file indexes taken from the cache
    pub cache_hits: u64,
    pub files_rebuilt: u64,
    /// Listed files that no longer exist
    pub missing_files: u64,
    pub malformed_lines: u64,
    pub upload_failures: u64,
}

impl std::ops::AddAssign for AggregationReport {
    fn add_assign(&mut self, other: Self) {
        self.hours += other.hours;
        self.failed_hours += other.failed_hours;
        self.prefixes += other.prefixes;
        self.indexes_written += other.indexes_written;
        self.indexes_unchanged += other.indexes_unchanged;
        self.cache_hits += other.cache_hits;
        self.files_rebuilt += other.files_rebuilt;
        self.missing_files += other.missing_files;
        self.malformed_lines += other.malformed_lines;
        self.upload_failures += other.upload_failures;
    }
}

impl fmt::Display for AggregationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Aggregation Report:")?;
        writeln!(f, "  Hours:             {} ({} failed)", self.hours, self.failed_hours)?;
        writeln!(f, "  Prefixes:          {}", self.prefixes)?;
        writeln!(
            f,
            "  Indexes written:   {} ({} unchanged)",
            self.indexes_written, self.indexes_unchanged
        )?;
        writeln!(f, "  Cache hits:        {}", self.cache_hits)?;
        writeln!(
            f,
            "  Files rebuilt:     {} ({} missing)",
            self.files_rebuilt, self.missing_files
        )?;
        writeln!(f, "  Malformed lines:   {}", self.malformed_lines)?;
        write!(f, "  Upload failures:   {}", self.upload_failures)
    }
}

/// A directory index being brought up to date
struct WorkingIndex {
    index_name: String,
    file_name: String,
    /// Last-modified time of the stored copy, if one was loaded
    lastmod: Option<i64>,
    index: DirectoryIndex,
    dirty: bool,
}

impl WorkingIndex {
    fn up_to_date(&self, data_file: &str, data_lastmod: i64) -> bool {
        match self.lastmod {
            Some(index_lastmod) => self.index.contains(data_file) && data_lastmod < index_lastmod,
            None => false,
        }
    }
}

/// Builds and maintains hourly directory indexes
pub struct HourlyIndexAggregator {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn DistributedCache>,
    registry: Arc<IndexRegistry>,
    config: AggregatorConfig,
    rebuilds: AtomicU64,
}

impl HourlyIndexAggregator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn DistributedCache>,
        registry: Arc<IndexRegistry>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            config,
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Raw data files re-read so far
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Index every hour from the one containing `from_ms` up to `to_ms`,
    /// never touching the hours still inside the recent-exclusion window.
    /// A `from_ms` outside the calendar range is an `InvalidHour` error.
    pub async fn build_hourly_index(
        &self,
        tenant_id: i32,
        device_id: i64,
        from_ms: i64,
        to_ms: i64,
    ) -> AggregateResult<AggregationReport> {
        if chrono::DateTime::<chrono::Utc>::from_timestamp_millis(from_ms).is_none() {
            return Err(AggregateError::InvalidHour(format!("timestamp {}", from_ms)));
        }
        let cutoff_ms = chrono::Utc::now()
            .timestamp_millis()
            .saturating_sub(self.config.recent_exclusion.num_milliseconds());
        let end_ms = to_ms.min(cutoff_ms);

        let mut report = AggregationReport::default();
        let mut hour_start = floor_hour(from_ms);
        while hour_start <= end_ms {
            let hour = HourPath::from_timestamp(tenant_id, device_id, hour_start)
                .ok_or_else(|| AggregateError::InvalidHour(format!("timestamp {}", hour_start)))?;

            match self.process_hour(&hour).await {
                Ok(hour_report) => report += hour_report,
                Err(e) => {
                    tracing::error!(hour = %hour, error = %e, "Failed to aggregate hour");
                    report.hours += 1;
                    report.failed_hours += 1;
                }
            }
            hour_start += MILLIS_PER_HOUR;
        }

        tracing::info!(
            tenant = tenant_id,
            device = device_id,
            hours = report.hours,
            written = report.indexes_written,
            rebuilt = report.files_rebuilt,
            "Hourly aggregation finished"
        );
        Ok(report)
    }

    /// Index one hour directory, addressed by calendar fields
    pub async fn build_hourly_index_for_single_hour(
        &self,
        tenant_id: i32,
        device_id: i64,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
    ) -> AggregateResult<AggregationReport> {
        let hour_path = HourPath::new(tenant_id, device_id, year, month, day, hour).ok_or_else(|| {
            AggregateError::InvalidHour(format!(
                "{:04}-{:02}-{:02}T{:02}",
                year, month, day, hour
            ))
        })?;
        self.process_hour(&hour_path).await
    }

    async fn process_hour(&self, hour: &HourPath) -> AggregateResult<AggregationReport> {
        let directory_key = hour.directory_key(&self.config.root_prefix);
        let listing = self.list_hour(&directory_key).await?;

        let prefixes: BTreeSet<&str> = listing
            .keys()
            .filter(|name| !name.starts_with(&self.config.hourly_index_marker))
            .filter_map(|name| self.registry.classify(name))
            .collect();

        let mut report = AggregationReport {
            hours: 1,
            ..AggregationReport::default()
        };
        for prefix in prefixes {
            report += self
                .build_hourly_indexes_for_single_file_name_prefix(hour, prefix, &listing)
                .await;
        }

        tracing::debug!(hour = %hour, files = listing.len(), "Aggregated hour");
        Ok(report)
    }

    /// Durable listing unioned with the files the pipeline announced in the
    /// cache; the later lastmod wins.
    async fn list_hour(&self, directory_key: &str) -> AggregateResult<HashMap<String, i64>> {
        let mut listing = self.store.list(directory_key).await?;

        let map_name = directory_listing_map_name(directory_key);
        match self.cache.entries(&map_name).await {
            Ok(entries) => {
                for (file_name, value) in entries {
                    let lastmod = std::str::from_utf8(&value)
                        .ok()
                        .and_then(|text| text.trim().parse::<i64>().ok());
                    let Some(lastmod) = lastmod else {
                        tracing::debug!(map = %map_name, file = %file_name, "Ignoring unparsable listing entry");
                        continue;
                    };
                    listing
                        .entry(file_name)
                        .and_modify(|current| *current = (*current).max(lastmod))
                        .or_insert(lastmod);
                }
            }
            Err(e) => {
                tracing::warn!(map = %map_name, error = %e, "Cached directory listing unavailable");
            }
        }

        Ok(listing)
    }

    /// Bring every directory index of `data_file_prefix` in one hour up to
    /// date. Failures are handled here and reflected in the report.
    pub async fn build_hourly_indexes_for_single_file_name_prefix(
        &self,
        hour: &HourPath,
        data_file_prefix: &str,
        listing: &HashMap<String, i64>,
    ) -> AggregationReport {
        let directory_key = hour.directory_key(&self.config.root_prefix);
        let mut report = AggregationReport {
            prefixes: 1,
            ..AggregationReport::default()
        };

        let data_files: BTreeMap<&str, i64> = listing
            .iter()
            .filter(|(name, _)| !name.starts_with(&self.config.hourly_index_marker))
            .filter(|(name, _)| self.registry.classify(name) == Some(data_file_prefix))
            .map(|(name, lastmod)| (name.as_str(), *lastmod))
            .collect();

        let mut working = Vec::new();
        for index_name in self.registry.indexes_for_prefix(data_file_prefix) {
            working.push(
                self.load_directory_index(hour, &directory_key, data_file_prefix, index_name, listing)
                    .await,
            );
        }

        // File name → index names that must be rebuilt from its content
        let mut rebuild: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (file_name, lastmod) in &data_files {
            for entry in working.iter_mut() {
                if entry.up_to_date(file_name, *lastmod) {
                    continue;
                }
                entry.dirty = true;

                match self.cached_record_index(data_file_prefix, &entry.index_name, file_name).await {
                    Some(index) => {
                        report.cache_hits += 1;
                        entry.index.put(*file_name, index);
                    }
                    None => rebuild
                        .entry(*file_name)
                        .or_default()
                        .push(entry.index_name.clone()),
                }
            }
        }

        for (file_name, index_names) in rebuild {
            let key = format!("{}{}", directory_key, file_name);
            let Some(rebuilt) = self
                .rebuild_file(&key, data_file_prefix, &index_names, &mut report)
                .await
            else {
                continue;
            };

            for (index_name, index) in rebuilt {
                self.cache_record_index(data_file_prefix, &index_name, file_name, &index)
                    .await;
                if let Some(entry) = working.iter_mut().find(|w| w.index_name == index_name) {
                    entry.index.put(file_name, index);
                }
            }
        }

        for entry in &working {
            if !entry.dirty {
                report.indexes_unchanged += 1;
                continue;
            }
            let key = format!("{}{}", directory_key, entry.file_name);
            let result = match encode_json(&entry.file_name, &entry.index) {
                Ok(bytes) => self.store.upload(bytes, &key).await.map_err(AggregateError::from),
                Err(e) => Err(AggregateError::from(e)),
            };
            match result {
                Ok(()) => {
                    report.indexes_written += 1;
                    tracing::debug!(file = %key, files = entry.index.files.len(), "Uploaded directory index");
                }
                Err(e) => {
                    report.upload_failures += 1;
                    tracing::warn!(file = %key, error = %e, "Failed to upload directory index");
                }
            }
        }

        report
    }

    async fn load_directory_index(
        &self,
        hour: &HourPath,
        directory_key: &str,
        data_file_prefix: &str,
        index_name: &str,
        listing: &HashMap<String, i64>,
    ) -> WorkingIndex {
        let file_name =
            hour.hourly_index_file_name(&self.config.hourly_index_marker, index_name, data_file_prefix);
        let mut working = WorkingIndex {
            index_name: index_name.to_string(),
            file_name,
            lastmod: None,
            index: DirectoryIndex::new(index_name, data_file_prefix),
            dirty: true,
        };

        let Some(&lastmod) = listing.get(&working.file_name) else {
            return working;
        };

        let key = format!("{}{}", directory_key, working.file_name);
        let loaded = match self.store.read_bytes(&key).await {
            Ok(bytes) => decode_json::<DirectoryIndex>(&bytes).map_err(AggregateError::from),
            Err(e) => Err(AggregateError::from(e)),
        };
        match loaded {
            Ok(index)
                if index.index_name == index_name && index.data_file_prefix == data_file_prefix =>
            {
                working.index = index;
                working.lastmod = Some(lastmod);
                working.dirty = false;
            }
            Ok(_) => {
                tracing::warn!(file = %key, "Directory index belongs to another index, rebuilding");
            }
            Err(e) => {
                tracing::warn!(file = %key, error = %e, "Unreadable directory index, rebuilding");
            }
        }
        working
    }

    async fn cached_record_index(
        &self,
        data_file_prefix: &str,
        index_name: &str,
        file_name: &str,
    ) -> Option<RecordIndex> {
        let map_name = record_index_map_name(data_file_prefix, index_name);
        match self.cache.get(&map_name, file_name).await {
            Ok(Some(bytes)) => {
                let index = RecordIndex::from_cached_json(&bytes);
                if index.is_none() {
                    tracing::debug!(map = %map_name, file = %file_name, "Invalid cached record index");
                }
                index
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(map = %map_name, error = %e, "Record index cache lookup failed");
                None
            }
        }
    }

    async fn cache_record_index(
        &self,
        data_file_prefix: &str,
        index_name: &str,
        file_name: &str,
        index: &RecordIndex,
    ) {
        let map_name = record_index_map_name(data_file_prefix, index_name);
        let result = match index.to_json() {
            Ok(json) => {
                self.cache
                    .put(&map_name, file_name, json, self.config.index_cache_ttl)
                    .await
            }
            Err(e) => {
                tracing::debug!(map = %map_name, error = %e, "Failed to encode record index");
                return;
            }
        };
        if let Err(e) = result {
            tracing::debug!(map = %map_name, file = %file_name, error = %e, "Failed to cache rebuilt record index");
        }
    }

    /// Stream one data file and rebuild the named indexes over it. `None`
    /// when the file is gone or cannot be read.
    async fn rebuild_file(
        &self,
        key: &str,
        data_file_prefix: &str,
        index_names: &[String],
        report: &mut AggregationReport,
    ) -> Option<BTreeMap<String, RecordIndex>> {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        let data = match self.store.read_bytes(key).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                tracing::debug!(file = %key, "Listed data file no longer exists");
                report.missing_files += 1;
                return None;
            }
            Err(e) => {
                tracing::warn!(file = %key, error = %e, "Failed to read data file");
                return None;
            }
        };

        let extractors: Vec<(&str, ValueExtractor)> = index_names
            .iter()
            .filter_map(|name| {
                self.registry
                    .value_extractor(data_file_prefix, name)
                    .map(|extractor| (name.as_str(), extractor))
            })
            .collect();
        let mut rebuilt: BTreeMap<String, RecordIndex> = index_names
            .iter()
            .map(|name| (name.clone(), RecordIndex::new()))
            .collect();
        let mut malformed = 0u64;

        let scanned = scan_lines(&data, |line_number, line| match Record::from_line(line) {
            Ok(record) => {
                for (name, extractor) in &extractors {
                    if let Some(index) = rebuilt.get_mut(*name) {
                        for value in extractor(&record) {
                            index.add(&value, line_number);
                        }
                    }
                }
            }
            Err(_) => malformed += 1,
        });

        let stats = match scanned {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(file = %key, error = %e, "Corrupt data file, skipping");
                return None;
            }
        };
        malformed += stats.invalid_utf8;

        if malformed > 0 {
            tracing::warn!(file = %key, malformed, lines = stats.lines, "Skipped malformed lines");
        }
        report.files_rebuilt += 1;
        report.malformed_lines += malformed;
        Some(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::ingest::{PipelineConfig, StreamHolder};
    use crate::model::{PartitionKey, Severity};
    use crate::store::{MemoryStore, ZipEntryWriter};

    // 2023-11-14T22:13:20Z
    const TS: i64 = 1_700_000_000_000;
    const DIR: &str = "events/7/42/2023/11/14/22/";
    const SENSOR_INDEX: &str = "hourly_sensor_se_7_42_2023_11_14_22.zip";

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<InMemoryCache>,
        aggregator: HourlyIndexAggregator,
    }

    fn fixture_with(registry: IndexRegistry) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let aggregator = HourlyIndexAggregator::new(
            Arc::clone(&store) as Arc<dyn DurableStore>,
            Arc::clone(&cache) as Arc<dyn DistributedCache>,
            Arc::new(registry),
            AggregatorConfig::default(),
        );
        Fixture {
            store,
            cache,
            aggregator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(IndexRegistry::from_record_kinds())
    }

    fn hour() -> HourPath {
        HourPath::from_timestamp(7, 42, TS).unwrap()
    }

    async fn put_data_file(store: &MemoryStore, prefix: &str, minute: u32, lines: &[String]) -> String {
        let name = hour().data_file_name(prefix, minute, 0);
        let mut writer = ZipEntryWriter::create(&name).unwrap();
        for line in lines {
            writer.write_line(line).unwrap();
        }
        store
            .upload(writer.finish().unwrap(), &format!("{}{}", DIR, name))
            .await
            .unwrap();
        name
    }

    fn sensor_lines(names: &[&str]) -> Vec<String> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Record::sensor(7, 42, TS + i as i64, *name, i as f64)
                    .to_line()
                    .unwrap()
            })
            .collect()
    }

    async fn load_index(store: &MemoryStore, file_name: &str) -> DirectoryIndex {
        let bytes = store.read_bytes(&format!("{}{}", DIR, file_name)).await.unwrap();
        decode_json(&bytes).unwrap()
    }

    async fn run(f: &Fixture) -> AggregationReport {
        f.aggregator
            .build_hourly_index_for_single_hour(7, 42, 2023, 11, 14, 22)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_index_matches_file_content() {
        let f = fixture();
        let a = put_data_file(&f.store, "se", 0, &sensor_lines(&["temp", "humidity", "temp"])).await;
        let b = put_data_file(&f.store, "se", 15, &sensor_lines(&["pressure"])).await;

        let report = run(&f).await;
        assert_eq!(report.files_rebuilt, 2);
        assert_eq!(report.indexes_written, 2);
        assert_eq!(f.aggregator.rebuild_count(), 2);

        let index = load_index(&f.store, SENSOR_INDEX).await;
        assert_eq!(index.files.len(), 2);
        assert_eq!(index.get(&a).unwrap().positions.get("temp"), &[0, 2]);
        assert_eq!(index.get(&a).unwrap().positions.get("humidity"), &[1]);
        assert_eq!(index.find("pressure"), vec![(b.as_str(), &[0u64][..])]);
        assert_eq!(index.count("temp"), 2);

        // Unit index exists but carries no values
        let unit = load_index(&f.store, "hourly_unit_se_7_42_2023_11_14_22.zip").await;
        assert!(unit.files.values().all(RecordIndex::is_empty));
    }

    #[tokio::test]
    async fn test_second_pass_rewrites_nothing() {
        let f = fixture();
        put_data_file(&f.store, "se", 0, &sensor_lines(&["temp", "humidity"])).await;
        put_data_file(&f.store, "se", 30, &sensor_lines(&["temp"])).await;

        run(&f).await;
        let key = format!("{}{}", DIR, SENSOR_INDEX);
        let first_bytes = f.store.read_bytes(&key).await.unwrap();
        assert_eq!(f.store.upload_count(&key), 1);

        let second = run(&f).await;
        assert_eq!(second.indexes_written, 0);
        assert_eq!(second.indexes_unchanged, 2);
        assert_eq!(f.store.upload_count(&key), 1);
        assert_eq!(f.aggregator.rebuild_count(), 2);

        // Rebuilding from scratch produces identical bytes
        f.store.remove(&key);
        run(&f).await;
        assert_eq!(f.store.read_bytes(&key).await.unwrap(), first_bytes);
    }

    #[tokio::test]
    async fn test_newer_file_is_added() {
        let f = fixture();
        let a = put_data_file(&f.store, "se", 0, &sensor_lines(&["temp"])).await;
        run(&f).await;

        let b = put_data_file(&f.store, "se", 45, &sensor_lines(&["humidity"])).await;
        let report = run(&f).await;
        assert_eq!(report.indexes_written, 2);
        // Only the new file is read
        assert_eq!(f.aggregator.rebuild_count(), 2);
        assert_eq!(f.store.read_count(&format!("{}{}", DIR, a)), 1);

        let index = load_index(&f.store, SENSOR_INDEX).await;
        assert!(index.contains(&a));
        assert!(index.contains(&b));
    }

    #[tokio::test]
    async fn test_rewritten_file_is_reindexed() {
        let f = fixture();
        // Nothing is written through, so the second pass has to read the file
        f.cache.set_available(false);
        let name = put_data_file(&f.store, "se", 0, &sensor_lines(&["temp"])).await;
        run(&f).await;
        assert_eq!(f.aggregator.rebuild_count(), 1);

        // Same name, content newer than the directory index
        put_data_file(&f.store, "se", 0, &sensor_lines(&["humidity", "pressure"])).await;
        let report = run(&f).await;
        assert_eq!(report.files_rebuilt, 1);
        assert_eq!(report.indexes_written, 2);
        assert_eq!(f.aggregator.rebuild_count(), 2);

        let index = load_index(&f.store, SENSOR_INDEX).await;
        let file = index.get(&name).unwrap();
        assert_eq!(file.counts.get("temp"), 0);
        assert_eq!(file.positions.get("pressure"), &[1]);
    }

    #[tokio::test]
    async fn test_invalid_cached_index_is_rebuilt() {
        let f = fixture();
        let name = put_data_file(&f.store, "se", 0, &sensor_lines(&["temp", "temp"])).await;
        f.cache
            .put(
                "record_index_se_sensor",
                &name,
                br#"{"counts":null,"positions":{}}"#.to_vec(),
                None,
            )
            .await
            .unwrap();
        f.cache
            .put("record_index_se_unit", &name, br#"{"counts":{}}"#.to_vec(), None)
            .await
            .unwrap();

        let report = run(&f).await;
        assert_eq!(report.cache_hits, 0);
        assert_eq!(report.files_rebuilt, 1);
        assert_eq!(f.aggregator.rebuild_count(), 1);

        let index = load_index(&f.store, SENSOR_INDEX).await;
        assert_eq!(index.get(&name).unwrap().positions.get("temp"), &[0, 1]);

        // The rebuilt index replaced the broken cache entry
        let cached = f.cache.get("record_index_se_sensor", &name).await.unwrap().unwrap();
        assert_eq!(RecordIndex::from_cached_json(&cached).unwrap().counts.get("temp"), 2);
    }

    #[tokio::test]
    async fn test_uses_cached_record_indexes() {
        let f = fixture();
        let registry = IndexRegistry::from_record_kinds();
        let config = PipelineConfig {
            minutes_per_file: 60,
            ..PipelineConfig::default()
        };
        let mut holder =
            StreamHolder::new(TS, PartitionKey::new(7, 42), "se", 0, &registry, &config).unwrap();
        for (i, name) in ["temp", "temp", "humidity"].iter().enumerate() {
            let record = Record::sensor(7, 42, TS + i as i64, *name, 0.0).unit("C");
            holder
                .write_model_to_stream(&record, f.cache.as_ref())
                .await
                .unwrap();
        }
        let data_key = holder.file_key();
        holder
            .commit_output_stream_to_file(f.store.as_ref(), f.cache.as_ref())
            .await;

        let report = run(&f).await;
        assert_eq!(f.aggregator.rebuild_count(), 0);
        assert_eq!(report.cache_hits, 2);
        assert_eq!(f.store.read_count(&data_key), 0);

        let index = load_index(&f.store, SENSOR_INDEX).await;
        assert_eq!(index.count("temp"), 2);
        let unit = load_index(&f.store, "hourly_unit_se_7_42_2023_11_14_22.zip").await;
        assert_eq!(unit.count("C"), 3);
    }

    #[tokio::test]
    async fn test_rebuilt_index_is_written_to_cache() {
        let f = fixture();
        let name = put_data_file(&f.store, "se", 0, &sensor_lines(&["temp"])).await;
        run(&f).await;

        let cached = f
            .cache
            .get("record_index_se_sensor", &name)
            .await
            .unwrap()
            .unwrap();
        let index = RecordIndex::from_cached_json(&cached).unwrap();
        assert_eq!(index.counts.get("temp"), 1);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let f = fixture();
        let mut lines = sensor_lines(&["temp"]);
        lines.push("{not json".to_string());
        lines.extend(sensor_lines(&["humidity"]));
        let name = put_data_file(&f.store, "se", 0, &lines).await;

        let report = run(&f).await;
        assert_eq!(report.malformed_lines, 1);

        let index = load_index(&f.store, SENSOR_INDEX).await;
        let file = index.get(&name).unwrap();
        assert_eq!(file.positions.get("temp"), &[0]);
        // Line numbers keep counting past the bad line
        assert_eq!(file.positions.get("humidity"), &[2]);
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let f = fixture();
        let present = put_data_file(&f.store, "se", 0, &sensor_lines(&["temp"])).await;
        let ghost = hour().data_file_name("se", 15, 0);
        f.cache
            .put(
                &directory_listing_map_name(DIR),
                &ghost,
                b"1700000000000".to_vec(),
                None,
            )
            .await
            .unwrap();

        let report = run(&f).await;
        assert_eq!(report.missing_files, 1);
        let index = load_index(&f.store, SENSOR_INDEX).await;
        assert!(index.contains(&present));
        assert!(!index.contains(&ghost));
    }

    #[tokio::test]
    async fn test_prefix_delimiter() {
        fn sensor_name(record: &Record) -> std::collections::BTreeSet<String> {
            match record {
                Record::Sensor(r) => std::iter::once(r.sensor.clone()).collect(),
                _ => Default::default(),
            }
        }
        let registry = IndexRegistry::builder()
            .index("se_1", "sensor", sensor_name)
            .index("se_10", "sensor", sensor_name)
            .build();
        let f = fixture_with(registry);
        let one = put_data_file(&f.store, "se_1", 0, &sensor_lines(&["a"])).await;
        let ten = put_data_file(&f.store, "se_10", 0, &sensor_lines(&["b"])).await;

        let report = run(&f).await;
        assert_eq!(report.prefixes, 2);

        let idx_one = load_index(&f.store, "hourly_sensor_se_1_7_42_2023_11_14_22.zip").await;
        let idx_ten = load_index(&f.store, "hourly_sensor_se_10_7_42_2023_11_14_22.zip").await;
        assert_eq!(idx_one.files.keys().collect::<Vec<_>>(), vec![&one]);
        assert_eq!(idx_ten.files.keys().collect::<Vec<_>>(), vec![&ten]);
    }

    #[tokio::test]
    async fn test_each_prefix_gets_its_own_indexes() {
        let f = fixture();
        put_data_file(&f.store, "se", 0, &sensor_lines(&["temp"])).await;
        let event = Record::event(7, 42, TS, "door_open", Severity::Critical)
            .tag("front")
            .to_line()
            .unwrap();
        put_data_file(&f.store, "ev", 0, &[event]).await;

        let report = run(&f).await;
        // se: sensor, unit; ev: event_type, severity, tag
        assert_eq!(report.indexes_written, 5);
        let severity = load_index(&f.store, "hourly_severity_ev_7_42_2023_11_14_22.zip").await;
        assert_eq!(severity.count("critical"), 1);
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported() {
        let f = fixture();
        put_data_file(&f.store, "se", 0, &sensor_lines(&["temp"])).await;
        f.store.set_fail_uploads(true);

        let report = run(&f).await;
        assert_eq!(report.upload_failures, 2);
        assert_eq!(report.indexes_written, 0);
        assert!(!f.store.contains(&format!("{}{}", DIR, SENSOR_INDEX)));
    }

    #[tokio::test]
    async fn test_recent_hours_are_excluded() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp_millis();
        let current = HourPath::from_timestamp(7, 42, now).unwrap();
        let old = HourPath::from_timestamp(7, 42, now - 5 * MILLIS_PER_HOUR).unwrap();
        for hour in [current, old] {
            let name = hour.data_file_name("se", 0, 0);
            let mut writer = ZipEntryWriter::create(&name).unwrap();
            writer.write_line(&sensor_lines(&["temp"])[0]).unwrap();
            f.store
                .upload(
                    writer.finish().unwrap(),
                    &format!("{}{}", hour.directory_key("events"), name),
                )
                .await
                .unwrap();
        }

        let report = f
            .aggregator
            .build_hourly_index(7, 42, now - 6 * MILLIS_PER_HOUR, now)
            .await
            .unwrap();
        assert!(report.hours >= 4);

        let old_index = format!(
            "{}{}",
            old.directory_key("events"),
            old.hourly_index_file_name("hourly_", "sensor", "se")
        );
        let current_index = format!(
            "{}{}",
            current.directory_key("events"),
            current.hourly_index_file_name("hourly_", "sensor", "se")
        );
        assert!(f.store.contains(&old_index));
        assert!(!f.store.contains(&current_index));
    }

    #[tokio::test]
    async fn test_out_of_range_start_is_rejected() {
        let f = fixture();
        let err = f
            .aggregator
            .build_hourly_index(7, 42, i64::MIN, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::InvalidHour(_)));
        assert_eq!(f.aggregator.rebuild_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_hour() {
        let f = fixture();
        let err = f
            .aggregator
            .build_hourly_index_for_single_hour(7, 42, 2023, 2, 30, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::InvalidHour(_)));
    }

    #[test]
    fn test_report_display() {
        let report = AggregationReport {
            hours: 3,
            failed_hours: 1,
            ..AggregationReport::default()
        };
        assert!(report.to_string().contains("Hours:             3 (1 failed)"));
    }
}
