//! Distributed Cache
//!
//! Clustered key → value map service, used three ways:
//!
//! - **staging**: records not yet flushed to the durable store
//!   (`recent_<prefix>_<tenant>_<device>`, short TTL)
//! - **record indexes**: per-file indexes computed at commit time
//!   (`record_index_<prefix>_<index>`, keyed by data file name)
//! - **directory listings**: file names appended per hour directory
//!   (`dir:<hour directory key>`, value = lastmod ms)
//!
//! Only per-key last-write-wins puts are performed; no read-modify-write
//! transactions are attempted against the cache.

pub mod memory;
pub mod reconnect;
pub mod recent;

pub use memory::InMemoryCache;
pub use reconnect::{CacheConnector, ReconnectingCache};
pub use recent::{fetch_recent, fetch_recent_by_prefix, merge_newer, Timestamped};

use crate::model::PartitionKey;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a cache backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The connection to the cluster was lost
    #[error("Cache disconnected: {0}")]
    Disconnected(String),

    /// Any other backend failure
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Keyed map access to the cache cluster
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, map_name: &str, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Overwrite `key`; entries with a TTL disappear once it elapses
    async fn put(
        &self,
        map_name: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    /// Every live entry of a map (empty if the map does not exist)
    async fn entries(&self, map_name: &str) -> CacheResult<Vec<(String, Vec<u8>)>>;

    /// Names of every map holding at least one live entry
    async fn list_map_names(&self) -> CacheResult<HashSet<String>>;
}

/// Prefix shared by every staging map of one data-file prefix
pub fn recent_map_prefix(data_file_prefix: &str) -> String {
    format!("recent_{}", data_file_prefix)
}

/// Staging map for one partition
pub fn recent_map_name(data_file_prefix: &str, partition: PartitionKey) -> String {
    format!(
        "{}_{}_{}",
        recent_map_prefix(data_file_prefix),
        partition.tenant_id,
        partition.device_id
    )
}

/// Map holding precomputed record indexes for one (prefix, index) pair
pub fn record_index_map_name(data_file_prefix: &str, index_name: &str) -> String {
    format!("record_index_{}_{}", data_file_prefix, index_name)
}

/// Map listing the files appended to one hour directory
pub fn directory_listing_map_name(directory_key: &str) -> String {
    format!("dir:{}", directory_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_names() {
        let partition = PartitionKey::new(7, 42);
        assert_eq!(recent_map_name("se", partition), "recent_se_7_42");
        assert!(crate::model::matches_prefix(
            &recent_map_name("se", partition),
            &recent_map_prefix("se")
        ));
        assert_eq!(record_index_map_name("se", "sensor"), "record_index_se_sensor");
        assert_eq!(
            directory_listing_map_name("events/7/42/2023/11/14/22/"),
            "dir:events/7/42/2023/11/14/22/"
        );
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::Disconnected("member left".to_string());
        assert_eq!(err.to_string(), "Cache disconnected: member left");
    }
}
