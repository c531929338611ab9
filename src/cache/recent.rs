//! Read path for data still staged in the cache
//!
//! Records are staged per partition until their bucket is flushed. Reading a
//! time range therefore combines two sources: the staging maps (newest data)
//! and the durable store (everything already flushed). `merge_newer` joins
//! the two without duplicating records at the boundary timestamp.

use crate::cache::{CacheResult, DistributedCache};
use crate::model::{matches_prefix, Record};

/// Anything ordered by an epoch-millisecond timestamp
pub trait Timestamped {
    fn timestamp_ms(&self) -> i64;
}

impl Timestamped for Record {
    fn timestamp_ms(&self) -> i64 {
        self.produced_timestamp_ms().unwrap_or(i64::MIN)
    }
}

async fn load_records(
    cache: &dyn DistributedCache,
    map_name: &str,
    from_ms: i64,
    to_ms: i64,
) -> CacheResult<Vec<Record>> {
    let mut records = Vec::new();
    for (key, value) in cache.entries(map_name).await? {
        let record: Record = match serde_json::from_slice(&value) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(map = %map_name, key = %key, error = %e, "Skipping undecodable staged entry");
                continue;
            }
        };
        let ts = record.timestamp_ms();
        if ts >= from_ms && ts <= to_ms {
            records.push(record);
        }
    }
    Ok(records)
}

fn finish<T, F>(mut records: Vec<Record>, filter: F) -> Vec<T>
where
    F: FnMut(Record) -> Option<T>,
{
    records.sort_by_key(|r| r.timestamp_ms());
    records.into_iter().filter_map(filter).collect()
}

/// Staged records of one map with `from_ms <= ts <= to_ms`, in timestamp
/// order, passed through `filter` (return `None` to drop an entry).
pub async fn fetch_recent<T, F>(
    cache: &dyn DistributedCache,
    map_name: &str,
    from_ms: i64,
    to_ms: i64,
    filter: F,
) -> CacheResult<Vec<T>>
where
    F: FnMut(Record) -> Option<T>,
{
    let records = load_records(cache, map_name, from_ms, to_ms).await?;
    Ok(finish(records, filter))
}

/// Like [`fetch_recent`], across every map named `map_prefix` or
/// `map_prefix_...`.
pub async fn fetch_recent_by_prefix<T, F>(
    cache: &dyn DistributedCache,
    map_prefix: &str,
    from_ms: i64,
    to_ms: i64,
    filter: F,
) -> CacheResult<Vec<T>>
where
    F: FnMut(Record) -> Option<T>,
{
    let mut names: Vec<String> = cache
        .list_map_names()
        .await?
        .into_iter()
        .filter(|name| matches_prefix(name, map_prefix))
        .collect();
    names.sort();

    let mut records = Vec::new();
    for name in &names {
        records.extend(load_records(cache, name, from_ms, to_ms).await?);
    }
    Ok(finish(records, filter))
}

/// Append the entries of `source` that are newer than everything in
/// `destination`: timestamps strictly greater than its maximum, or equal to
/// it and not already present.
pub fn merge_newer<T>(destination: &mut Vec<T>, source: impl IntoIterator<Item = T>)
where
    T: Timestamped + PartialEq,
{
    let max = destination.iter().map(Timestamped::timestamp_ms).max();

    for item in source {
        let ts = item.timestamp_ms();
        let keep = match max {
            None => true,
            Some(max) if ts > max => true,
            Some(max) if ts == max => !destination.contains(&item),
            Some(_) => false,
        };
        if keep {
            destination.push(item);
        }
    }
}
