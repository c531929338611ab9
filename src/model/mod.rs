//! Strata data model
//!
//! - **record**: the closed set of record kinds and their index extractors
//! - **index**: per-file and per-hour secondary index structures
//! - **naming**: time buckets and the file naming conventions

pub mod index;
pub mod naming;
pub mod record;

pub use index::{DirectoryIndex, RecordIndex, RecordIndexCounts, RecordIndexPositions};
pub use naming::{floor_hour, matches_prefix, time_bucket, HourPath};
pub use record::{
    DeviceEvent, LocationFix, PartitionKey, Record, RecordKind, SensorReading, Severity,
    ValueExtractor,
};
