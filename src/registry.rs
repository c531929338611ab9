//! Index Registry
//!
//! Declarative mapping from data-file-name prefix to the indexes kept for
//! files of that prefix, each with its value extractor. Built once at startup
//! and shared read-only (`Arc<IndexRegistry>`) by the ingestion pipeline and
//! the hourly aggregator.

use crate::model::{RecordKind, ValueExtractor};
use std::collections::BTreeMap;
use std::fmt;

/// Immutable prefix → {index name → extractor} table
#[derive(Clone, Default)]
pub struct IndexRegistry {
    prefixes: BTreeMap<String, BTreeMap<String, ValueExtractor>>,
}

impl IndexRegistry {
    /// Registry covering every built-in record kind
    pub fn from_record_kinds() -> Self {
        let mut builder = Self::builder();
        for kind in RecordKind::all() {
            builder = builder.record_kind(*kind);
        }
        builder.build()
    }

    pub fn builder() -> IndexRegistryBuilder {
        IndexRegistryBuilder::default()
    }

    /// Every known data-file-name prefix
    pub fn all_file_name_prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.keys().map(String::as_str)
    }

    /// Index names registered for `prefix` (empty for unknown prefixes)
    pub fn indexes_for_prefix(&self, prefix: &str) -> Vec<&str> {
        self.prefixes
            .get(prefix)
            .map(|indexes| indexes.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn value_extractor(&self, prefix: &str, index_name: &str) -> Option<ValueExtractor> {
        self.prefixes.get(prefix)?.get(index_name).copied()
    }

    /// (index name, extractor) pairs for `prefix`
    pub fn extractors_for_prefix(&self, prefix: &str) -> Vec<(&str, ValueExtractor)> {
        self.prefixes
            .get(prefix)
            .map(|indexes| {
                indexes
                    .iter()
                    .map(|(name, extractor)| (name.as_str(), *extractor))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The unique registered prefix `file_name` belongs to, if any
    pub fn classify(&self, file_name: &str) -> Option<&str> {
        // Longest match wins so that `se_1` and `se` can coexist
        self.all_file_name_prefixes()
            .filter(|prefix| crate::model::matches_prefix(file_name, prefix))
            .max_by_key(|prefix| prefix.len())
    }
}

impl fmt::Debug for IndexRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (prefix, indexes) in &self.prefixes {
            map.entry(prefix, &indexes.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

/// Builder for [`IndexRegistry`]
#[derive(Default)]
pub struct IndexRegistryBuilder {
    prefixes: BTreeMap<String, BTreeMap<String, ValueExtractor>>,
}

impl IndexRegistryBuilder {
    /// Register every index of a record kind under its file prefix
    pub fn record_kind(mut self, kind: RecordKind) -> Self {
        let indexes = self
            .prefixes
            .entry(kind.file_name_prefix().to_string())
            .or_default();
        for (name, extractor) in kind.index_extractors() {
            indexes.insert(name.to_string(), *extractor);
        }
        self
    }

    /// Register a single index under an arbitrary prefix
    pub fn index(
        mut self,
        prefix: impl Into<String>,
        index_name: impl Into<String>,
        extractor: ValueExtractor,
    ) -> Self {
        self.prefixes
            .entry(prefix.into())
            .or_default()
            .insert(index_name.into(), extractor);
        self
    }

    pub fn build(self) -> IndexRegistry {
        IndexRegistry {
            prefixes: self.prefixes,
        }
    }
}
