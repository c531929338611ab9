//! # Strata
//!
//! Hierarchical, time-partitioned event store. Device records are grouped
//! by tenant, device and time bucket into compressed JSON-lines files, and
//! each hour directory gets consolidated secondary indexes.
//!
//! ## Features
//!
//! - **Partitioned ingestion**: one queue and one consumer task per device
//! - **Bucketed files**: one zip data file per device and time bucket
//! - **Record indexes**: value → line numbers, computed while writing
//! - **Hourly aggregation**: per-hour directory indexes, rebuilt only where stale
//! - **Cache staging**: unflushed records stay readable from the cache
//!
//! ## Modules
//!
//! - [`model`]: record kinds, index structures, naming conventions
//! - [`registry`]: data-file prefix → index extractors
//! - [`store`]: durable file store and the zip container codec
//! - [`cache`]: distributed cache trait, in-memory backend, read path
//! - [`ingest`]: mapper, queue readers and stream holders
//! - [`aggregate`]: hourly directory index aggregator
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use strata::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(IndexRegistry::from_record_kinds());
//!     let store: Arc<dyn DurableStore> = Arc::new(LocalFileStore::new("strata_data"));
//!     let cache: Arc<dyn DistributedCache> = Arc::new(InMemoryCache::new());
//!
//!     // Ingest sensor readings
//!     let mapper = RecordQueueMapper::new(
//!         RecordKind::Sensor,
//!         Arc::clone(&registry),
//!         Arc::clone(&store),
//!         Arc::clone(&cache),
//!         PipelineConfig::default(),
//!     );
//!     mapper.add_model(Record::sensor(7, 42, 1_700_000_000_000, "temp", 21.5)).await?;
//!
//!     // Flush everything
//!     mapper.shutdown().await;
//!     mapper.wait_for_shutdown(Duration::from_secs(30)).await;
//!
//!     // Build the hourly indexes
//!     let aggregator =
//!         HourlyIndexAggregator::new(store, cache, registry, AggregatorConfig::default());
//!     let report = aggregator
//!         .build_hourly_index_for_single_hour(7, 42, 2023, 11, 14, 22)
//!         .await?;
//!     println!("{}", report);
//!
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod ingest;
pub mod model;
pub mod registry;
pub mod store;

// Re-export top-level types for convenience
pub use model::{
    DirectoryIndex, HourPath, PartitionKey, Record, RecordIndex, RecordKind, Severity,
};

pub use registry::{IndexRegistry, IndexRegistryBuilder};

pub use store::{
    CodecError, CodecResult, DurableStore, LocalFileStore, MemoryStore, StoreError, StoreResult,
};

pub use cache::{
    CacheError, CacheResult, DistributedCache, InMemoryCache, ReconnectingCache,
};

pub use ingest::{
    CommitOutcome, IngestError, IngestPipeline, IngestResult, PipelineConfig, PipelineStats,
    RecordQueueMapper, StreamHolder,
};

pub use aggregate::{
    AggregateError, AggregateResult, AggregationReport, AggregatorConfig, HourlyIndexAggregator,
};

pub use config::{Config, ConfigError, LoggingConfig};
