//! Secondary index structures
//!
//! - `RecordIndexCounts`: value → number of lines carrying it
//! - `RecordIndexPositions`: value → ordered line numbers carrying it
//! - `RecordIndex`: both maps for one index name, scoped to one data file
//! - `DirectoryIndex`: data file name → `RecordIndex`, scoped to one hour
//!
//! All maps are ordered so that serialization is deterministic: rebuilding an
//! index from the same file content yields the same bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value → occurrence count
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordIndexCounts(pub BTreeMap<String, u64>);

/// Value → ordered list of line numbers (0-based)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordIndexPositions(pub BTreeMap<String, Vec<u64>>);

impl RecordIndexCounts {
    pub fn get(&self, value: &str) -> u64 {
        self.0.get(value).copied().unwrap_or(0)
    }

    /// Sum of all counts
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl RecordIndexPositions {
    pub fn get(&self, value: &str) -> &[u64] {
        self.0.get(value).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Counts and positions for one index name over one data file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIndex {
    pub counts: RecordIndexCounts,
    pub positions: RecordIndexPositions,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `line` carries `value`
    pub fn add(&mut self, value: &str, line: u64) {
        *self.counts.0.entry(value.to_string()).or_insert(0) += 1;
        self.positions
            .0
            .entry(value.to_string())
            .or_default()
            .push(line);
    }

    pub fn is_empty(&self) -> bool {
        self.counts.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a cached blob; `None` when it is not a structurally valid index
    pub fn from_cached_json(bytes: &[u8]) -> Option<Self> {
        let cached: CachedRecordIndex = serde_json::from_slice(bytes).ok()?;
        cached.into_valid()
    }
}

/// Cached form of a record index, where either half may be missing
#[derive(Debug, Deserialize)]
struct CachedRecordIndex {
    #[serde(default)]
    counts: Option<RecordIndexCounts>,
    #[serde(default)]
    positions: Option<RecordIndexPositions>,
}

impl CachedRecordIndex {
    fn into_valid(self) -> Option<RecordIndex> {
        Some(RecordIndex {
            counts: self.counts?,
            positions: self.positions?,
        })
    }
}

/// Consolidated index over every data file of one prefix in one hour directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryIndex {
    pub index_name: String,
    pub data_file_prefix: String,
    /// Data file name → index over that file
    pub files: BTreeMap<String, RecordIndex>,
}

impl DirectoryIndex {
    pub fn new(index_name: impl Into<String>, data_file_prefix: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            data_file_prefix: data_file_prefix.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.files.contains_key(file_name)
    }

    /// Insert or replace the entry for a file
    pub fn put(&mut self, file_name: impl Into<String>, index: RecordIndex) {
        self.files.insert(file_name.into(), index);
    }

    pub fn get(&self, file_name: &str) -> Option<&RecordIndex> {
        self.files.get(file_name)
    }

    /// Files (and line numbers) carrying `value`
    pub fn find(&self, value: &str) -> Vec<(&str, &[u64])> {
        self.files
            .iter()
            .filter_map(|(file, index)| {
                let lines = index.positions.get(value);
                if lines.is_empty() {
                    None
                } else {
                    Some((file.as_str(), lines))
                }
            })
            .collect()
    }

    /// Total count of `value` across all files
    pub fn count(&self, value: &str) -> u64 {
        self.files.values().map(|index| index.counts.get(value)).sum()
    }
}
