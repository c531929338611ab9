//! In-process durable store
//!
//! Last-modified times come from a strictly increasing clock (wall time, bumped
//! by one millisecond when two uploads land in the same millisecond), so
//! "written after" is always observable. Read and upload counters make cache
//! hits and skipped rewrites visible to callers.

use crate::store::error::{StoreError, StoreResult};
use crate::store::DurableStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    /// key → (bytes, lastmod ms)
    files: BTreeMap<String, (Vec<u8>, i64)>,
    clock: i64,
    reads: HashMap<String, u64>,
    uploads: HashMap<String, u64>,
    fail_uploads: bool,
}

/// Durable store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every subsequent upload fail with an I/O error
    pub fn set_fail_uploads(&self, fail: bool) {
        self.state().fail_uploads = fail;
    }

    /// Number of `read_bytes` calls made for `key`
    pub fn read_count(&self, key: &str) -> u64 {
        self.state().reads.get(key).copied().unwrap_or(0)
    }

    /// Number of successful uploads made for `key`
    pub fn upload_count(&self, key: &str) -> u64 {
        self.state().uploads.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().files.contains_key(key)
    }

    pub fn last_modified(&self, key: &str) -> Option<i64> {
        self.state().files.get(key).map(|(_, modified)| *modified)
    }

    /// Delete a file (simulates external removal)
    pub fn remove(&self, key: &str) -> bool {
        self.state().files.remove(key).is_some()
    }

    /// Every stored key, sorted
    pub fn keys(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn list(&self, directory_key: &str) -> StoreResult<HashMap<String, i64>> {
        let state = self.state();
        let listing = state
            .files
            .range(directory_key.to_string()..)
            .take_while(|(key, _)| key.starts_with(directory_key))
            .filter_map(|(key, (_, modified))| {
                let name = &key[directory_key.len()..];
                if name.is_empty() || name.contains('/') {
                    None
                } else {
                    Some((name.to_string(), *modified))
                }
            })
            .collect();
        Ok(listing)
    }

    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>> {
        let mut state = self.state();
        *state.reads.entry(key.to_string()).or_insert(0) += 1;
        state
            .files
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn upload(&self, bytes: Vec<u8>, key: &str) -> StoreResult<()> {
        let mut state = self.state();
        if state.fail_uploads {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "store unavailable",
            )));
        }

        let modified = Utc::now().timestamp_millis().max(state.clock + 1);
        state.clock = modified;
        state.files.insert(key.to_string(), (bytes, modified));
        *state.uploads.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_one_level() {
        let store = MemoryStore::new();
        store.upload(b"a".to_vec(), "d/a").await.unwrap();
        store.upload(b"b".to_vec(), "d/sub/b").await.unwrap();
        store.upload(b"c".to_vec(), "other/c").await.unwrap();

        let listing = store.list("d/").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing.contains_key("a"));
    }

    #[tokio::test]
    async fn test_lastmod_strictly_increases() {
        let store = MemoryStore::new();
        store.upload(b"1".to_vec(), "d/a").await.unwrap();
        store.upload(b"2".to_vec(), "d/b").await.unwrap();
        store.upload(b"3".to_vec(), "d/a").await.unwrap();

        let a = store.last_modified("d/a").unwrap();
        let b = store.last_modified("d/b").unwrap();
        assert!(a > b);
        assert_eq!(store.upload_count("d/a"), 2);
    }

    #[tokio::test]
    async fn test_counters_and_failures() {
        let store = MemoryStore::new();
        assert!(store.read_bytes("d/x").await.unwrap_err().is_not_found());
        assert_eq!(store.read_count("d/x"), 1);

        store.set_fail_uploads(true);
        assert!(store.upload(b"x".to_vec(), "d/x").await.is_err());
        assert!(!store.contains("d/x"));

        store.set_fail_uploads(false);
        store.upload(b"x".to_vec(), "d/x").await.unwrap();
        assert!(store.remove("d/x"));
        assert!(store.keys().is_empty());
    }
}
