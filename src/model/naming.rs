//! File naming conventions
//!
//! ```text
//! hour directory   <root>/<tenant>/<device>/<yyyy>/<mm>/<dd>/<hh>/
//! suffix token     _<tenant>_<device>_<yyyy>_<mm>_<dd>_<hh>
//! data file        <prefix><suffix>_<MM>.jsonl.zip        (MM = bucket start minute)
//! reopened bucket  <prefix><suffix>_<MM>_<generation>.jsonl.zip
//! hourly index     <marker><index>_<prefix><suffix>.zip
//! ```
//!
//! A zip container always holds exactly one entry named as the file minus
//! its `.zip` extension.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::fmt;

/// Extension of every compressed container
pub const ZIP_EXTENSION: &str = ".zip";

/// Extension of the single entry inside a data file container
pub const DATA_ENTRY_EXTENSION: &str = ".jsonl";

pub const MILLIS_PER_MINUTE: i64 = 60_000;
pub const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;

/// Start of the time bucket containing `timestamp_ms`. Saturates at
/// `i64::MIN` for buckets that would start before it.
pub fn time_bucket(timestamp_ms: i64, bucket_duration_ms: i64) -> i64 {
    timestamp_ms.saturating_sub(timestamp_ms.rem_euclid(bucket_duration_ms))
}

/// Start of the UTC hour containing `timestamp_ms`
pub fn floor_hour(timestamp_ms: i64) -> i64 {
    time_bucket(timestamp_ms, MILLIS_PER_HOUR)
}

/// Name of the single entry stored inside a container file
pub fn entry_name(file_name: &str) -> &str {
    file_name.strip_suffix(ZIP_EXTENSION).unwrap_or(file_name)
}

/// Last path component of a store key
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Whether `file_name` belongs to `prefix`, honouring the `_` delimiter so
/// that `se_1` matches `se_1_...` but neither `se_10_...` nor `se_1x`.
pub fn matches_prefix(file_name: &str, prefix: &str) -> bool {
    match file_name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('_'),
        None => false,
    }
}

/// One UTC hour of one device's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HourPath {
    pub tenant_id: i32,
    pub device_id: i64,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl HourPath {
    /// Validate calendar fields; `None` for impossible dates
    pub fn new(
        tenant_id: i32,
        device_id: i64,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single()?;
        Some(Self {
            tenant_id,
            device_id,
            year,
            month,
            day,
            hour,
        })
    }

    /// Hour containing `timestamp_ms`
    pub fn from_timestamp(tenant_id: i32, device_id: i64, timestamp_ms: i64) -> Option<Self> {
        let dt = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?;
        Some(Self {
            tenant_id,
            device_id,
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        })
    }

    /// Start of this hour in epoch milliseconds
    pub fn start_ms(&self) -> i64 {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, self.hour, 0, 0)
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_default()
    }

    /// `<root>/<tenant>/<device>/<yyyy>/<mm>/<dd>/<hh>/`
    pub fn directory_key(&self, root_prefix: &str) -> String {
        format!(
            "{}/{}/{}/{:04}/{:02}/{:02}/{:02}/",
            root_prefix, self.tenant_id, self.device_id, self.year, self.month, self.day, self.hour
        )
    }

    /// `_<tenant>_<device>_<yyyy>_<mm>_<dd>_<hh>`
    pub fn suffix_token(&self) -> String {
        format!(
            "_{}_{}_{:04}_{:02}_{:02}_{:02}",
            self.tenant_id, self.device_id, self.year, self.month, self.day, self.hour
        )
    }

    /// Data file name for the bucket starting at `bucket_minute` of this
    /// hour. Generation 0 is the first file of the bucket; a bucket reopened
    /// after a flush gets the next generation so no file is overwritten.
    pub fn data_file_name(
        &self,
        data_file_prefix: &str,
        bucket_minute: u32,
        generation: u64,
    ) -> String {
        let stem = self.data_file_stem(data_file_prefix, bucket_minute);
        match generation {
            0 => format!("{}{}{}", stem, DATA_ENTRY_EXTENSION, ZIP_EXTENSION),
            n => format!("{}_{}{}{}", stem, n, DATA_ENTRY_EXTENSION, ZIP_EXTENSION),
        }
    }

    /// Generation of `file_name` if it is a data file of this bucket
    pub fn data_file_generation(
        &self,
        data_file_prefix: &str,
        bucket_minute: u32,
        file_name: &str,
    ) -> Option<u64> {
        let stem = self.data_file_stem(data_file_prefix, bucket_minute);
        let rest = file_name
            .strip_prefix(stem.as_str())?
            .strip_suffix(ZIP_EXTENSION)?
            .strip_suffix(DATA_ENTRY_EXTENSION)?;
        match rest {
            "" => Some(0),
            _ => rest
                .strip_prefix('_')
                .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))?
                .parse()
                .ok(),
        }
    }

    fn data_file_stem(&self, data_file_prefix: &str, bucket_minute: u32) -> String {
        format!("{}{}_{:02}", data_file_prefix, self.suffix_token(), bucket_minute)
    }

    fn hourly_index_marker(marker: &str, index_name: &str, data_file_prefix: &str) -> String {
        format!("{}{}_{}", marker, index_name, data_file_prefix)
    }

    /// `<marker><index>_<prefix><suffix>.zip`
    pub fn hourly_index_file_name(
        &self,
        marker: &str,
        index_name: &str,
        data_file_prefix: &str,
    ) -> String {
        format!(
            "{}{}{}",
            Self::hourly_index_marker(marker, index_name, data_file_prefix),
            self.suffix_token(),
            ZIP_EXTENSION
        )
    }
}

impl fmt::Display for HourPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {:04}-{:02}-{:02}T{:02}",
            self.tenant_id, self.device_id, self.year, self.month, self.day, self.hour
        )
    }
}
