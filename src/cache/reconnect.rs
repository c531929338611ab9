//! Reconnecting cache client
//!
//! Wraps a connection supplier. When an operation fails with
//! `CacheError::Disconnected`, a fresh connection is obtained from the
//! supplier, swapped in under a mutex, and the operation is retried once.
//! Callers only ever see the [`DistributedCache`] trait.

use crate::cache::{CacheError, CacheResult, DistributedCache};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Produces a new live connection to the cache cluster
pub type CacheConnector = Arc<dyn Fn() -> CacheResult<Arc<dyn DistributedCache>> + Send + Sync>;

/// Cache client that transparently replaces a lost connection
pub struct ReconnectingCache {
    connector: CacheConnector,
    current: Mutex<Arc<dyn DistributedCache>>,
    reconnects: AtomicU64,
}

impl ReconnectingCache {
    /// Connect eagerly using `connector`
    pub fn connect(connector: CacheConnector) -> CacheResult<Self> {
        let initial = connector()?;
        Ok(Self {
            connector,
            current: Mutex::new(initial),
            reconnects: AtomicU64::new(0),
        })
    }

    /// Number of times the connection has been replaced
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn connection(&self) -> CacheResult<Arc<dyn DistributedCache>> {
        self.current
            .lock()
            .map(|guard| Arc::clone(&guard))
            .map_err(|e| CacheError::Backend(format!("connection lock poisoned: {}", e)))
    }

    /// Replace `stale` unless another caller already did
    fn reconnect(&self, stale: &Arc<dyn DistributedCache>) -> CacheResult<Arc<dyn DistributedCache>> {
        let mut current = self
            .current
            .lock()
            .map_err(|e| CacheError::Backend(format!("connection lock poisoned: {}", e)))?;

        if !Arc::ptr_eq(&current, stale) {
            return Ok(Arc::clone(&current));
        }

        let fresh = (self.connector)()?;
        *current = Arc::clone(&fresh);
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Cache connection lost, reconnected");
        Ok(fresh)
    }
}

#[async_trait]
impl DistributedCache for ReconnectingCache {
    async fn get(&self, map_name: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let conn = self.connection()?;
        match conn.get(map_name, key).await {
            Err(CacheError::Disconnected(_)) => self.reconnect(&conn)?.get(map_name, key).await,
            other => other,
        }
    }

    async fn put(
        &self,
        map_name: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let conn = self.connection()?;
        match conn.put(map_name, key, value.clone(), ttl).await {
            Err(CacheError::Disconnected(_)) => {
                self.reconnect(&conn)?.put(map_name, key, value, ttl).await
            }
            other => other,
        }
    }

    async fn entries(&self, map_name: &str) -> CacheResult<Vec<(String, Vec<u8>)>> {
        let conn = self.connection()?;
        match conn.entries(map_name).await {
            Err(CacheError::Disconnected(_)) => self.reconnect(&conn)?.entries(map_name).await,
            other => other,
        }
    }

    async fn list_map_names(&self) -> CacheResult<HashSet<String>> {
        let conn = self.connection()?;
        match conn.list_map_names().await {
            Err(CacheError::Disconnected(_)) => self.reconnect(&conn)?.list_map_names().await,
            other => other,
        }
    }
}
