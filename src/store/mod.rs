//! Durable File Store
//!
//! Hierarchical file namespace holding the committed data files and the
//! hourly directory indexes:
//!
//! - **compression**: single-entry zip containers
//! - **local**: store rooted in a local directory
//! - **memory**: in-process store for tests and dry runs
//! - **error**: error types
//!
//! # Layout
//!
//! ```text
//! events/7/42/2023/11/14/22/
//!   se_7_42_2023_11_14_22_00.jsonl.zip      ← data file (one per bucket)
//!   se_7_42_2023_11_14_22_15.jsonl.zip
//!   hourly_sensor_se_7_42_2023_11_14_22.zip ← directory index
//! ```

pub mod compression;
pub mod error;
pub mod local;
pub mod memory;

pub use compression::{
    compress_single_entry, decode_json, decompress_single_entry, encode_json, scan_lines,
    LineScanStats, ZipEntryWriter,
};
pub use error::{CodecError, CodecResult, StoreError, StoreResult};
pub use local::LocalFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::collections::HashMap;

/// File-like durable storage
///
/// Keys are `/`-separated paths. Directory keys end with `/`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// File names directly under `directory_key`, with their last-modified
    /// time in epoch milliseconds. A missing directory lists as empty.
    async fn list(&self, directory_key: &str) -> StoreResult<HashMap<String, i64>>;

    /// Full contents of a file; `StoreError::NotFound` if absent
    async fn read_bytes(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Create or overwrite a file
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> StoreResult<()>;
}
