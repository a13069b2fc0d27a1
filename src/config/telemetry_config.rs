//! Telemetry Configuration - every bound, timeout and interval as TOML values
//!
//! Each struct implements `Default` with values from `defaults.rs`, so an
//! absent or empty config file yields the standard policy.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use crate::buffer::BufferLimits;
use crate::types::StreamType;

/// Environment variable pointing at a config file.
pub const CONFIG_ENV_VAR: &str = "TELEMETRY_SYNC_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "telemetry_sync.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with `TelemetryConfig::load()` which searches:
/// 1. `$TELEMETRY_SYNC_CONFIG` env var
/// 2. `./telemetry_sync.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Per-stream buffer bounds
    #[serde(default)]
    pub streams: StreamsConfig,

    /// Availability probe caching
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Flush batching, timeouts and scheduling
    #[serde(default)]
    pub sync: SyncConfig,

    /// Local blob store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote sink endpoint
    #[serde(default)]
    pub sink: SinkConfig,
}

impl TelemetryConfig {
    /// Load configuration using the standard search order:
    /// 1. `$TELEMETRY_SYNC_CONFIG` environment variable
    /// 2. `./telemetry_sync.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded telemetry config from {CONFIG_ENV_VAR}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV_VAR}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV_VAR} points to non-existent file, falling back");
            }
        }

        // 2. Check ./telemetry_sync.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded telemetry config from ./{LOCAL_CONFIG_FILE}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG_FILE}, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No {LOCAL_CONFIG_FILE} found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        // Unknown keys are warnings only
        for w in super::validation::validate_unknown_keys(&contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Bounds configured for `stream`
    pub const fn stream(&self, stream: StreamType) -> &StreamConfig {
        match stream {
            StreamType::Metric => &self.streams.metrics,
            StreamType::Alert => &self.streams.alerts,
            StreamType::Report => &self.streams.reports,
        }
    }

    /// Validate all values. Collects every problem before failing.
    ///
    /// - Counts and byte bounds must be > 0
    /// - `max_entry_bytes` must not exceed `max_total_bytes`
    /// - A full buffer must fit under the store's blob ceiling
    /// - A batch must be able to hold the largest allowed entry
    /// - Purge fraction must be in (0, 1]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        for stream in StreamType::ALL {
            let s = self.stream(stream);
            let name = stream.as_str();
            if s.max_count == 0 {
                errors.push(format!("streams.{name}.max_count must be > 0"));
            }
            if s.max_total_bytes == 0 {
                errors.push(format!("streams.{name}.max_total_bytes must be > 0"));
            }
            if s.max_entry_bytes == 0 {
                errors.push(format!("streams.{name}.max_entry_bytes must be > 0"));
            }
            if s.max_entry_bytes > s.max_total_bytes {
                errors.push(format!(
                    "streams.{name}.max_entry_bytes ({}) must be <= max_total_bytes ({})",
                    s.max_entry_bytes, s.max_total_bytes
                ));
            }
            // Array brackets plus one separator per entry
            let worst_blob = s.max_total_bytes.saturating_add(s.max_count).saturating_add(1);
            if worst_blob > self.storage.max_blob_bytes {
                errors.push(format!(
                    "streams.{name}: a full buffer ({worst_blob} bytes) exceeds storage.max_blob_bytes ({})",
                    self.storage.max_blob_bytes
                ));
            }
            if s.max_entry_bytes.saturating_add(2) > self.sync.batch_max_bytes {
                errors.push(format!(
                    "sync.batch_max_bytes ({}) cannot hold one streams.{name} entry ({} bytes)",
                    self.sync.batch_max_bytes, s.max_entry_bytes
                ));
            }
        }

        if self.probe.timeout_ms == 0 {
            errors.push("probe.timeout_ms must be > 0".to_string());
        }

        let sync = &self.sync;
        if sync.batch_max_entries == 0 {
            errors.push("sync.batch_max_entries must be > 0".to_string());
        }
        if sync.timeout_secs == 0 {
            errors.push("sync.timeout_secs must be > 0".to_string());
        }
        if sync.interval_secs == 0 {
            errors.push("sync.interval_secs must be > 0".to_string());
        }
        if !sync.purge_fraction.is_finite() || sync.purge_fraction <= 0.0 || sync.purge_fraction > 1.0 {
            errors.push(format!(
                "sync.purge_fraction must be in (0, 1], got {}",
                sync.purge_fraction
            ));
        }

        if self.storage.max_blob_bytes == 0 {
            errors.push("storage.max_blob_bytes must be > 0".to_string());
        }

        if let Some(url) = &self.sink.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("sink.url must be an http(s) URL, got '{url}'"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Streams
// ============================================================================

/// Bounds for one stream's offline buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    /// Maximum buffered entries.
    pub max_count: usize,

    /// Maximum Σ serialized entry bytes.
    pub max_total_bytes: usize,

    /// Entries larger than this are rejected before buffering.
    pub max_entry_bytes: usize,

    /// Retention window in seconds; 0 disables time-based retention.
    pub retention_secs: u64,
}

impl StreamConfig {
    pub const fn metrics_default() -> Self {
        Self {
            max_count: defaults::METRICS_MAX_COUNT,
            max_total_bytes: defaults::METRICS_MAX_TOTAL_BYTES,
            max_entry_bytes: defaults::METRICS_MAX_ENTRY_BYTES,
            retention_secs: defaults::METRICS_RETENTION_SECS,
        }
    }

    pub const fn alerts_default() -> Self {
        Self {
            max_count: defaults::ALERTS_MAX_COUNT,
            max_total_bytes: defaults::ALERTS_MAX_TOTAL_BYTES,
            max_entry_bytes: defaults::ALERTS_MAX_ENTRY_BYTES,
            retention_secs: 0,
        }
    }

    pub const fn reports_default() -> Self {
        Self {
            max_count: defaults::REPORTS_MAX_COUNT,
            max_total_bytes: defaults::REPORTS_MAX_TOTAL_BYTES,
            max_entry_bytes: defaults::REPORTS_MAX_ENTRY_BYTES,
            retention_secs: 0,
        }
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        if self.retention_secs == 0 {
            return None;
        }
        i64::try_from(self.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn limits(&self) -> BufferLimits {
        BufferLimits {
            max_count: self.max_count,
            max_total_bytes: self.max_total_bytes,
            max_entry_bytes: self.max_entry_bytes,
            retention: self.retention(),
        }
    }
}

/// Partial stream table as written by the user. Unset fields fall back to
/// the defaults of the stream the table belongs to.
#[derive(Debug, Default, Deserialize)]
struct StreamOverrides {
    max_count: Option<usize>,
    max_total_bytes: Option<usize>,
    max_entry_bytes: Option<usize>,
    retention_secs: Option<u64>,
}

impl StreamOverrides {
    fn apply(self, base: StreamConfig) -> StreamConfig {
        StreamConfig {
            max_count: self.max_count.unwrap_or(base.max_count),
            max_total_bytes: self.max_total_bytes.unwrap_or(base.max_total_bytes),
            max_entry_bytes: self.max_entry_bytes.unwrap_or(base.max_entry_bytes),
            retention_secs: self.retention_secs.unwrap_or(base.retention_secs),
        }
    }
}

/// Bounds for all three streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamsConfig {
    pub metrics: StreamConfig,
    pub alerts: StreamConfig,
    pub reports: StreamConfig,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            metrics: StreamConfig::metrics_default(),
            alerts: StreamConfig::alerts_default(),
            reports: StreamConfig::reports_default(),
        }
    }
}

impl<'de> Deserialize<'de> for StreamsConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            metrics: StreamOverrides,
            #[serde(default)]
            alerts: StreamOverrides,
            #[serde(default)]
            reports: StreamOverrides,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(Self {
            metrics: raw.metrics.apply(StreamConfig::metrics_default()),
            alerts: raw.alerts.apply(StreamConfig::alerts_default()),
            reports: raw.reports.apply(StreamConfig::reports_default()),
        })
    }
}

// ============================================================================
// Probe Config
// ============================================================================

/// Availability probe caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// How long a probe result is trusted (seconds). 0 probes every time.
    #[serde(default = "default_probe_ttl")]
    pub ttl_secs: u64,

    /// Maximum time a probe may take (milliseconds).
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_probe_ttl() -> u64 { defaults::PROBE_TTL_SECS }
fn default_probe_timeout() -> u64 { defaults::PROBE_TIMEOUT_MS }

impl ProbeConfig {
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_probe_ttl(),
            timeout_ms: default_probe_timeout(),
        }
    }
}

// ============================================================================
// Sync Config
// ============================================================================

/// Flush batching, timeouts and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum entries per bulk insert.
    #[serde(default = "default_batch_max_entries")]
    pub batch_max_entries: usize,

    /// Maximum encoded bytes per bulk insert.
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Timeout for each bulk insert and each direct write (seconds).
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,

    /// Fraction of a stream's buffer dropped on a storage-capacity error.
    #[serde(default = "default_purge_fraction")]
    pub purge_fraction: f64,

    /// Flush timer period (seconds).
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Random extra delay per flush tick (seconds).
    #[serde(default = "default_sync_jitter")]
    pub jitter_secs: u64,
}

fn default_batch_max_entries() -> usize { defaults::SYNC_BATCH_MAX_ENTRIES }
fn default_batch_max_bytes() -> usize { defaults::SYNC_BATCH_MAX_BYTES }
fn default_sync_timeout() -> u64 { defaults::SYNC_TIMEOUT_SECS }
fn default_purge_fraction() -> f64 { defaults::SYNC_PURGE_FRACTION }
fn default_sync_interval() -> u64 { defaults::SYNC_INTERVAL_SECS }
fn default_sync_jitter() -> u64 { defaults::SYNC_JITTER_SECS }

impl SyncConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn jitter(&self) -> Duration {
        Duration::from_secs(self.jitter_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_max_entries: default_batch_max_entries(),
            batch_max_bytes: default_batch_max_bytes(),
            timeout_secs: default_sync_timeout(),
            purge_fraction: default_purge_fraction(),
            interval_secs: default_sync_interval(),
            jitter_secs: default_sync_jitter(),
        }
    }
}

// ============================================================================
// Storage Config
// ============================================================================

/// Local blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory.
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Per-key blob ceiling (bytes). Writes above it are refused.
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,
}

fn default_storage_path() -> String {
    defaults::STORAGE_PATH.to_string()
}
fn default_max_blob_bytes() -> usize { defaults::STORAGE_MAX_BLOB_BYTES }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_blob_bytes: default_max_blob_bytes(),
        }
    }
}

// ============================================================================
// Sink Config
// ============================================================================

/// Remote sink endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Base URL, e.g. `https://telemetry.example.com/v1`. Unset = offline only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Anonymous (publishable) key sent with inserts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = TelemetryConfig::default();
        assert!(config.validate().is_ok(), "Default config must always validate");
    }

    #[test]
    fn test_empty_toml_produces_defaults() {
        let config: TelemetryConfig = toml::from_str("").expect("empty TOML should parse");
        assert_eq!(config.streams.metrics.max_count, 100);
        assert_eq!(config.streams.metrics.max_total_bytes, 200 * 1024);
        assert_eq!(config.streams.metrics.retention_secs, 86_400);
        assert_eq!(config.streams.alerts.max_count, 50);
        assert_eq!(config.streams.alerts.retention(), None);
        assert_eq!(config.streams.reports.max_total_bytes, 250 * 1024);
        assert_eq!(config.sync.purge_fraction, 0.5);
    }

    #[test]
    fn test_partial_stream_override_keeps_stream_defaults() {
        let toml_str = r#"
[streams.metrics]
max_count = 10

[streams.reports]
retention_secs = 3600
"#;
        let config: TelemetryConfig = toml::from_str(toml_str).expect("partial TOML should parse");
        // Overridden values
        assert_eq!(config.streams.metrics.max_count, 10);
        assert_eq!(config.streams.reports.retention_secs, 3600);
        // Non-overridden values retain their own stream's defaults
        assert_eq!(config.streams.metrics.retention_secs, 86_400);
        assert_eq!(config.streams.metrics.max_total_bytes, 200 * 1024);
        assert_eq!(config.streams.reports.max_count, 50);
        assert_eq!(config.streams.alerts, StreamConfig::alerts_default());
    }

    #[test]
    fn test_limits_conversion() {
        let limits = StreamConfig::metrics_default().limits();
        assert_eq!(limits.max_count, 100);
        assert_eq!(limits.retention, Some(chrono::Duration::hours(24)));
        assert_eq!(StreamConfig::reports_default().limits().retention, None);
    }

    #[test]
    fn test_validation_catches_entry_larger_than_buffer() {
        let mut config = TelemetryConfig::default();
        config.streams.alerts.max_entry_bytes = config.streams.alerts.max_total_bytes + 1;
        let result = config.validate();
        assert!(result.is_err());
        if let Err(ConfigError::Validation(errors)) = result {
            assert!(errors.iter().any(|e| e.contains("streams.alerts.max_entry_bytes")));
        }
    }

    #[test]
    fn test_validation_catches_buffer_over_blob_ceiling() {
        let mut config = TelemetryConfig::default();
        config.storage.max_blob_bytes = 100 * 1024;
        let result = config.validate();
        assert!(result.is_err(), "200 KB metrics buffer cannot fit a 100 KB blob");
    }

    #[test]
    fn test_validation_catches_bad_purge_fraction() {
        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            let mut config = TelemetryConfig::default();
            config.sync.purge_fraction = bad;
            assert!(config.validate().is_err(), "purge_fraction {bad} should fail");
        }
        let mut config = TelemetryConfig::default();
        config.sync.purge_fraction = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_counts() {
        let mut config = TelemetryConfig::default();
        config.streams.reports.max_count = 0;
        config.sync.batch_max_entries = 0;
        if let Err(ConfigError::Validation(errors)) = config.validate() {
            assert_eq!(errors.len(), 2, "{errors:?}");
        } else {
            panic!("expected validation errors");
        }
    }

    #[test]
    fn test_validation_catches_bad_sink_url() {
        let mut config = TelemetryConfig::default();
        config.sink.url = Some("ftp://sink".to_string());
        assert!(config.validate().is_err());
        config.sink.url = Some("https://sink.example/v1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_roundtrip_toml() {
        let original = TelemetryConfig::default();
        let toml_str = original.to_toml().expect("serialization should work");
        let roundtripped: TelemetryConfig =
            toml::from_str(&toml_str).expect("deserialization should work");
        assert_eq!(original.streams, roundtripped.streams);
        assert_eq!(original.probe.ttl_secs, roundtripped.probe.ttl_secs);
    }

    #[test]
    fn test_all_sections_serialize() {
        let toml_str = TelemetryConfig::default().to_toml().expect("serialization should work");
        assert!(toml_str.contains("[streams.metrics]"), "Missing [streams.metrics] section");
        assert!(toml_str.contains("[streams.reports]"), "Missing [streams.reports] section");
        assert!(toml_str.contains("[probe]"), "Missing [probe] section");
        assert!(toml_str.contains("[sync]"), "Missing [sync] section");
        assert!(toml_str.contains("[storage]"), "Missing [storage] section");
        assert!(toml_str.contains("purge_fraction"), "Missing purge_fraction field");
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("telemetry_sync.toml");
        std::fs::write(&path, "[sync]\npurge_fraction = 2.0\n").unwrap();
        assert!(matches!(
            TelemetryConfig::load_from_file(&path),
            Err(ConfigError::Validation(_))
        ));

        std::fs::write(&path, "[sync\n").unwrap();
        assert!(matches!(
            TelemetryConfig::load_from_file(&path),
            Err(ConfigError::Parse(_, _))
        ));
    }
}
