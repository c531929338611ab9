//! In-process cache with TTL support
//!
//! Stands in for the cluster in single-node deployments and tests. Expired
//! entries are hidden immediately and dropped lazily on the next write to
//! their map; every `SWEEP_INTERVAL` writes all maps are swept, so maps
//! that are no longer written to do not pin memory.

use crate::cache::{CacheError, CacheResult, DistributedCache};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Writes between two full sweeps of expired entries
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// Map-of-maps cache held in process memory
#[derive(Debug)]
pub struct InMemoryCache {
    maps: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self {
            maps: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the cluster connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Disconnected("in-memory cache marked unavailable".to_string()))
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, CacheEntry>>> {
        match self.maps.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, CacheEntry>>> {
        match self.maps.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn sweep_expired(maps: &mut HashMap<String, HashMap<String, CacheEntry>>, now: Instant) {
    for map in maps.values_mut() {
        map.retain(|_, entry| entry.is_live(now));
    }
    maps.retain(|_, map| !map.is_empty());
}

#[async_trait]
impl DistributedCache for InMemoryCache {
    async fn get(&self, map_name: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .read()
            .get(map_name)
            .and_then(|map| map.get(key))
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put(
        &self,
        map_name: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut maps = self.write();
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            sweep_expired(&mut maps, now);
        }
        let map = maps.entry(map_name.to_string()).or_default();
        map.retain(|_, entry| entry.is_live(now));
        map.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn entries(&self, map_name: &str) -> CacheResult<Vec<(String, Vec<u8>)>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .read()
            .get(map_name)
            .map(|map| {
                map.iter()
                    .filter(|(_, entry)| entry.is_live(now))
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_map_names(&self) -> CacheResult<HashSet<String>> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .read()
            .iter()
            .filter(|(_, map)| map.values().any(|entry| entry.is_live(now)))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let cache = InMemoryCache::new();
        cache.put("m", "k", b"one".to_vec(), None).await.unwrap();
        cache.put("m", "k", b"two".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("m", "k").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(cache.get("m", "other").await.unwrap(), None);
        assert_eq!(cache.get("nope", "k").await.unwrap(), None);
        assert_eq!(cache.entries("m").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache
            .put("short", "k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        cache.put("long", "k", b"v".to_vec(), None).await.unwrap();
        assert!(cache.get("short", "k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get("short", "k").await.unwrap().is_none());
        assert!(cache.entries("short").await.unwrap().is_empty());
        let names = cache.list_map_names().await.unwrap();
        assert!(names.contains("long"));
        assert!(!names.contains("short"));
    }

    #[tokio::test]
    async fn test_abandoned_maps_are_swept() {
        let cache = InMemoryCache::new();
        cache
            .put("dir:old/", "f", b"1".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        for i in 0..SWEEP_INTERVAL {
            cache
                .put("dir:new/", &format!("f{}", i), b"1".to_vec(), Some(Duration::from_secs(60)))
                .await
                .unwrap();
        }
        let maps = cache.read();
        assert!(!maps.contains_key("dir:old/"));
        assert_eq!(maps.get("dir:new/").map(HashMap::len), Some(SWEEP_INTERVAL as usize));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let cache = InMemoryCache::new();
        cache.set_available(false);
        let err = cache.get("m", "k").await.unwrap_err();
        assert!(matches!(err, CacheError::Disconnected(_)));

        cache.set_available(true);
        assert!(cache.get("m", "k").await.is_ok());
    }
}
