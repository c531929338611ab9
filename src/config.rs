//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::aggregate::AggregatorConfig;
use crate::ingest::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub aggregator: AggregatorSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Durable store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// First component of every hour-directory key
    #[serde(default = "default_root_prefix")]
    pub root_prefix: String,

    /// Prefix of hourly directory index file names
    #[serde(default = "default_hourly_index_marker")]
    pub hourly_index_marker: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("strata").to_string_lossy().to_string())
        .unwrap_or_else(|| "./strata_data".to_string())
}

fn default_root_prefix() -> String {
    "events".to_string()
}

fn default_hourly_index_marker() -> String {
    "hourly_".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            root_prefix: default_root_prefix(),
            hourly_index_marker: default_hourly_index_marker(),
        }
    }
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Width of a time bucket; must divide 60
    #[serde(default = "default_minutes_per_file")]
    pub minutes_per_file: u32,

    /// Buckets idle this long are flushed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Per-partition queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Lifetime of staged records in the cache (0 disables staging)
    #[serde(default = "default_staging_ttl")]
    pub staging_ttl_secs: u64,

    /// Lifetime of cached record indexes and directory listings (0 = no expiry)
    #[serde(default = "default_index_cache_ttl")]
    pub index_cache_ttl_secs: u64,
}

fn default_minutes_per_file() -> u32 {
    15
}

fn default_idle_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_queue_capacity() -> usize {
    5000
}

fn default_staging_ttl() -> u64 {
    2 * 60 * 60 // 2 hours
}

fn default_index_cache_ttl() -> u64 {
    3 * 24 * 60 * 60 // 3 days
}

fn ttl(secs: u64) -> Option<Duration> {
    match secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            minutes_per_file: default_minutes_per_file(),
            idle_timeout_ms: default_idle_timeout(),
            queue_capacity: default_queue_capacity(),
            staging_ttl_secs: default_staging_ttl(),
            index_cache_ttl_secs: default_index_cache_ttl(),
        }
    }
}

/// Hourly aggregator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSettings {
    /// Hours before now that are still considered in flight
    #[serde(default = "default_recent_exclusion_hours")]
    pub recent_exclusion_hours: u32,
}

fn default_recent_exclusion_hours() -> u32 {
    2
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            recent_exclusion_hours: default_recent_exclusion_hours(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Result<Self, ConfigError> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("strata").join("config.toml")),
            Some(PathBuf::from("/etc/strata/config.toml")),
            Some(PathBuf::from("./strata.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply `STRATA_*` overrides looked up through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup("STRATA_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Some(root) = lookup("STRATA_ROOT_PREFIX") {
            self.storage.root_prefix = root;
        }

        if let Some(minutes) = lookup("STRATA_MINUTES_PER_FILE") {
            if let Ok(m) = minutes.parse() {
                self.pipeline.minutes_per_file = m;
            }
        }
        if let Some(timeout) = lookup("STRATA_IDLE_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.pipeline.idle_timeout_ms = t;
            }
        }
        if let Some(capacity) = lookup("STRATA_QUEUE_CAPACITY") {
            if let Ok(c) = capacity.parse() {
                self.pipeline.queue_capacity = c;
            }
        }
        if let Some(secs) = lookup("STRATA_INDEX_CACHE_TTL_SECS") {
            if let Ok(s) = secs.parse() {
                self.pipeline.index_cache_ttl_secs = s;
            }
        }

        if let Some(level) = lookup("STRATA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("STRATA_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let minutes = self.pipeline.minutes_per_file;
        if minutes == 0 || 60 % minutes != 0 {
            return Err(ConfigError::Invalid(format!(
                "pipeline.minutes_per_file must divide 60, got {}",
                minutes
            )));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be positive".to_string(),
            ));
        }
        if self.pipeline.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.idle_timeout_ms must be positive".to_string(),
            ));
        }
        if self.storage.root_prefix.is_empty() || self.storage.root_prefix.contains("..") {
            return Err(ConfigError::Invalid(format!(
                "storage.root_prefix is not a usable key prefix: {:?}",
                self.storage.root_prefix
            )));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Data directory with a leading `~/` expanded
    pub fn data_dir(&self) -> PathBuf {
        match self.storage.data_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.storage.data_dir)),
            None => PathBuf::from(&self.storage.data_dir),
        }
    }

    /// Runtime settings for the ingestion pipeline
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            root_prefix: self.storage.root_prefix.clone(),
            minutes_per_file: self.pipeline.minutes_per_file,
            idle_timeout: Duration::from_millis(self.pipeline.idle_timeout_ms),
            queue_capacity: self.pipeline.queue_capacity,
            staging_ttl: ttl(self.pipeline.staging_ttl_secs),
            index_cache_ttl: ttl(self.pipeline.index_cache_ttl_secs),
        }
    }

    /// Runtime settings for the hourly aggregator
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            root_prefix: self.storage.root_prefix.clone(),
            hourly_index_marker: self.storage.hourly_index_marker.clone(),
            recent_exclusion: chrono::Duration::hours(i64::from(
                self.aggregator.recent_exclusion_hours,
            )),
            index_cache_ttl: ttl(self.pipeline.index_cache_ttl_secs),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Strata Configuration
#
# Environment variables override these settings:
# - STRATA_DATA_DIR
# - STRATA_ROOT_PREFIX
# - STRATA_MINUTES_PER_FILE
# - STRATA_IDLE_TIMEOUT_MS
# - STRATA_QUEUE_CAPACITY
# - STRATA_INDEX_CACHE_TTL_SECS
# - STRATA_LOG_LEVEL
# - STRATA_LOG_FORMAT

[storage]
# Directory holding the durable file store
data_dir = "~/.local/share/strata"

# First component of every hour directory: <root>/<tenant>/<device>/<yyyy>/<mm>/<dd>/<hh>/
root_prefix = "events"

# Prefix of hourly directory index files
hourly_index_marker = "hourly_"

[pipeline]
# Minutes covered by one data file (must divide 60)
minutes_per_file = 15

# Flush a bucket after this long without writes (ms)
idle_timeout_ms = 60000

# Records buffered per device before producers are throttled
queue_capacity = 5000

# How long unflushed records stay readable from the cache (seconds, 0 = off)
staging_ttl_secs = 7200

# How long cached record indexes and directory listings live (seconds, 0 = no expiry)
index_cache_ttl_secs = 259200

[aggregator]
# Hours before now that are still being written and are never indexed
recent_exclusion_hours = 2

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pipeline.minutes_per_file, 15);
        assert_eq!(config.storage.root_prefix, "events");
        assert_eq!(config.aggregator.recent_exclusion_hours, 2);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "[pipeline]\nminutes_per_file = 60\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.minutes_per_file, 60);
        assert_eq!(config.pipeline.queue_capacity, 5000);
        assert_eq!(config.logging.level, "info");

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.bucket_duration_ms(), 60 * 60 * 1000);
        assert_eq!(pipeline.staging_ttl, Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_rejects_bucket_width_not_dividing_hour() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "[pipeline]\nminutes_per_file = 7\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "[pipeline\n").unwrap();

        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }

    #[test]
    fn test_env_overrides_are_validated() {
        let vars = |minutes: &'static str| {
            move |name: &str| match name {
                "STRATA_MINUTES_PER_FILE" => Some(minutes.to_string()),
                "STRATA_INDEX_CACHE_TTL_SECS" => Some("60".to_string()),
                _ => None,
            }
        };

        let err = Config::from_vars(vars("7")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = Config::from_vars(vars("10")).unwrap();
        assert_eq!(config.pipeline.minutes_per_file, 10);
        assert_eq!(
            config.pipeline_config().index_cache_ttl,
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            config.aggregator_config().index_cache_ttl,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_staging_can_be_disabled() {
        let mut config = Config::default();
        config.pipeline.staging_ttl_secs = 0;
        assert_eq!(config.pipeline_config().staging_ttl, None);
        assert_eq!(
            config.aggregator_config().recent_exclusion,
            chrono::Duration::hours(2)
        );
    }
}
