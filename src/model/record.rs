//! Record types flowing through the ingestion pipeline
//!
//! Records are a closed set of tagged variants. Each variant maps to one
//! data-file-name prefix and carries its own index extractor table, so the
//! registry resolves everything once at startup.
//!
//! Wire format is one JSON object per line:
//!
//! ```text
//! {"type":"sensor","tenant_id":7,"device_id":42,"produced_timestamp_ms":1700000000000,"sensor":"temp","value":21.5,"unit":"C"}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Extracts zero or more index values from a record
pub type ValueExtractor = fn(&Record) -> BTreeSet<String>;

/// A timestamped event produced by a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Sensor(SensorReading),
    Event(DeviceEvent),
    Location(LocationFix),
}

/// A single sensor measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    #[serde(default)]
    pub tenant_id: Option<i32>,
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub produced_timestamp_ms: Option<i64>,
    pub sensor: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// A discrete device event (alarm, state change, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    #[serde(default)]
    pub tenant_id: Option<i32>,
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub produced_timestamp_ms: Option<i64>,
    pub event_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A position report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationFix {
    #[serde(default)]
    pub tenant_id: Option<i32>,
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub produced_timestamp_ms: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geohash: Option<String>,
}

/// Event severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// The kind of a record, one per data-file-name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Sensor,
    Event,
    Location,
}

impl RecordKind {
    /// All record kinds, for registry construction
    pub fn all() -> &'static [RecordKind] {
        &[RecordKind::Sensor, RecordKind::Event, RecordKind::Location]
    }

    /// Data-file-name prefix used for files holding this kind
    pub fn file_name_prefix(&self) -> &'static str {
        match self {
            RecordKind::Sensor => "se",
            RecordKind::Event => "ev",
            RecordKind::Location => "loc",
        }
    }

    /// Look up the kind whose files start with `prefix`
    pub fn from_file_name_prefix(prefix: &str) -> Option<RecordKind> {
        RecordKind::all()
            .iter()
            .copied()
            .find(|kind| kind.file_name_prefix() == prefix)
    }

    /// Index definitions for this kind: (index name, extractor)
    pub fn index_extractors(&self) -> &'static [(&'static str, ValueExtractor)] {
        match self {
            RecordKind::Sensor => &[("sensor", extract_sensor), ("unit", extract_unit)],
            RecordKind::Event => &[
                ("event_type", extract_event_type),
                ("severity", extract_severity),
                ("tag", extract_tags),
            ],
            RecordKind::Location => &[("geohash", extract_geohash)],
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name_prefix())
    }
}

/// Tenant + device pair used to shard ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub tenant_id: i32,
    pub device_id: i64,
}

impl PartitionKey {
    pub fn new(tenant_id: i32, device_id: i64) -> Self {
        Self {
            tenant_id,
            device_id,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.device_id)
    }
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Sensor(_) => RecordKind::Sensor,
            Record::Event(_) => RecordKind::Event,
            Record::Location(_) => RecordKind::Location,
        }
    }

    pub fn tenant_id(&self) -> Option<i32> {
        match self {
            Record::Sensor(r) => r.tenant_id,
            Record::Event(r) => r.tenant_id,
            Record::Location(r) => r.tenant_id,
        }
    }

    pub fn device_id(&self) -> Option<i64> {
        match self {
            Record::Sensor(r) => r.device_id,
            Record::Event(r) => r.device_id,
            Record::Location(r) => r.device_id,
        }
    }

    pub fn produced_timestamp_ms(&self) -> Option<i64> {
        match self {
            Record::Sensor(r) => r.produced_timestamp_ms,
            Record::Event(r) => r.produced_timestamp_ms,
            Record::Location(r) => r.produced_timestamp_ms,
        }
    }

    /// Partition key, if both tenant and device are present
    pub fn partition_key(&self) -> Option<PartitionKey> {
        Some(PartitionKey::new(self.tenant_id()?, self.device_id()?))
    }

    /// Name of the first missing routing field, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.tenant_id().is_none() {
            Some("tenant_id")
        } else if self.device_id().is_none() {
            Some("device_id")
        } else if self.produced_timestamp_ms().is_none() {
            Some("produced_timestamp_ms")
        } else {
            None
        }
    }

    /// Serialize as a single JSON line (no trailing newline)
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one JSON line
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Builder: a sensor reading with all routing fields set
    pub fn sensor(
        tenant_id: i32,
        device_id: i64,
        timestamp_ms: i64,
        sensor: impl Into<String>,
        value: f64,
    ) -> Self {
        Record::Sensor(SensorReading {
            tenant_id: Some(tenant_id),
            device_id: Some(device_id),
            produced_timestamp_ms: Some(timestamp_ms),
            sensor: sensor.into(),
            value,
            unit: None,
        })
    }

    /// Builder: a device event with all routing fields set
    pub fn event(
        tenant_id: i32,
        device_id: i64,
        timestamp_ms: i64,
        event_type: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Record::Event(DeviceEvent {
            tenant_id: Some(tenant_id),
            device_id: Some(device_id),
            produced_timestamp_ms: Some(timestamp_ms),
            event_type: event_type.into(),
            severity,
            tags: Vec::new(),
        })
    }

    /// Builder: a location fix with all routing fields set
    pub fn location(
        tenant_id: i32,
        device_id: i64,
        timestamp_ms: i64,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Record::Location(LocationFix {
            tenant_id: Some(tenant_id),
            device_id: Some(device_id),
            produced_timestamp_ms: Some(timestamp_ms),
            latitude,
            longitude,
            geohash: None,
        })
    }

    /// Builder method: set the unit of a sensor reading
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        if let Record::Sensor(ref mut r) = self {
            r.unit = Some(unit.into());
        }
        self
    }

    /// Builder method: add a tag to a device event
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        if let Record::Event(ref mut r) = self {
            r.tags.push(tag.into());
        }
        self
    }

    /// Builder method: set the geohash of a location fix
    pub fn geohash(mut self, geohash: impl Into<String>) -> Self {
        if let Record::Location(ref mut r) = self {
            r.geohash = Some(geohash.into());
        }
        self
    }
}

fn single(value: &str) -> BTreeSet<String> {
    std::iter::once(value.to_string()).collect()
}

fn extract_sensor(record: &Record) -> BTreeSet<String> {
    match record {
        Record::Sensor(r) => single(&r.sensor),
        _ => BTreeSet::new(),
    }
}

fn extract_unit(record: &Record) -> BTreeSet<String> {
    match record {
        Record::Sensor(SensorReading { unit: Some(u), .. }) => single(u),
        _ => BTreeSet::new(),
    }
}

fn extract_event_type(record: &Record) -> BTreeSet<String> {
    match record {
        Record::Event(r) => single(&r.event_type),
        _ => BTreeSet::new(),
    }
}

fn extract_severity(record: &Record) -> BTreeSet<String> {
    match record {
        Record::Event(r) => single(&r.severity.to_string()),
        _ => BTreeSet::new(),
    }
}

fn extract_tags(record: &Record) -> BTreeSet<String> {
    match record {
        Record::Event(r) => r.tags.iter().cloned().collect(),
        _ => BTreeSet::new(),
    }
}

fn extract_geohash(record: &Record) -> BTreeSet<String> {
    match record {
        Record::Location(LocationFix {
            geohash: Some(g), ..
        }) => single(g),
        _ => BTreeSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format() {
        let record = Record::sensor(7, 42, 1_700_000_000_000, "temp", 21.5).unit("C");
        let line = record.to_line().unwrap();
        assert!(line.starts_with(r#"{"type":"sensor","tenant_id":7"#));
        assert!(!line.contains('\n'));

        let parsed = Record::from_line(&line).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_missing_fields() {
        let line = r#"{"type":"sensor","tenant_id":7,"sensor":"temp","value":1.0}"#;
        let record = Record::from_line(line).unwrap();
        assert_eq!(record.missing_field(), Some("device_id"));
        assert!(record.partition_key().is_none());

        let complete = Record::sensor(7, 42, 0, "temp", 1.0);
        assert_eq!(complete.missing_field(), None);
        assert_eq!(complete.partition_key(), Some(PartitionKey::new(7, 42)));
    }

    #[test]
    fn test_extractors() {
        let event = Record::event(1, 2, 3, "door_open", Severity::Warning)
            .tag("front")
            .tag("front")
            .tag("garage");

        let extractors = RecordKind::Event.index_extractors();
        let tags = extractors.iter().find(|(name, _)| *name == "tag").unwrap().1;
        let values: Vec<String> = tags(&event).into_iter().collect();
        assert_eq!(values, vec!["front".to_string(), "garage".to_string()]);

        let severity = extractors
            .iter()
            .find(|(name, _)| *name == "severity")
            .unwrap()
            .1;
        assert!(severity(&event).contains("warning"));

        // Unit is optional
        let reading = Record::sensor(1, 2, 3, "temp", 1.0);
        assert!(extract_unit(&reading).is_empty());
    }

    #[test]
    fn test_kind_prefixes() {
        for kind in RecordKind::all() {
            assert_eq!(
                RecordKind::from_file_name_prefix(kind.file_name_prefix()),
                Some(*kind)
            );
        }
        assert_eq!(RecordKind::from_file_name_prefix("s"), None);
    }
}
