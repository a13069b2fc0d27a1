//! System-wide default constants.
//!
//! Every tunable in `TelemetryConfig` defaults to a value from this module.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Streams
// ============================================================================

/// Metrics buffer: maximum buffered entries.
pub const METRICS_MAX_COUNT: usize = 100;

/// Metrics buffer: maximum Σ entry bytes (200 KB).
pub const METRICS_MAX_TOTAL_BYTES: usize = 200 * 1024;

/// Metrics buffer: maximum single entry size (32 KB).
pub const METRICS_MAX_ENTRY_BYTES: usize = 32 * 1024;

/// Metrics retention window (seconds). 86 400 = 24 hours.
pub const METRICS_RETENTION_SECS: u64 = 86_400;

/// Alerts buffer: maximum buffered entries.
pub const ALERTS_MAX_COUNT: usize = 50;

/// Alerts buffer: maximum Σ entry bytes (150 KB).
pub const ALERTS_MAX_TOTAL_BYTES: usize = 150 * 1024;

/// Alerts buffer: maximum single entry size (32 KB).
pub const ALERTS_MAX_ENTRY_BYTES: usize = 32 * 1024;

/// Reports buffer: maximum buffered entries.
pub const REPORTS_MAX_COUNT: usize = 50;

/// Reports buffer: maximum Σ entry bytes (250 KB).
pub const REPORTS_MAX_TOTAL_BYTES: usize = 250 * 1024;

/// Reports buffer: maximum single entry size (64 KB).
pub const REPORTS_MAX_ENTRY_BYTES: usize = 64 * 1024;

/// Crash report stack traces are truncated to this many bytes before buffering.
pub const REPORT_MAX_STACK_BYTES: usize = 16 * 1024;

// ============================================================================
// Availability Probe
// ============================================================================

/// How long a probe result is trusted (seconds).
pub const PROBE_TTL_SECS: u64 = 60;

/// Maximum time a single probe may take (milliseconds).
pub const PROBE_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// Sync
// ============================================================================

/// Maximum entries per bulk insert.
pub const SYNC_BATCH_MAX_ENTRIES: usize = 50;

/// Maximum encoded size of one bulk insert (bytes). 256 KB.
pub const SYNC_BATCH_MAX_BYTES: usize = 256 * 1024;

/// Timeout for one bulk insert or direct write (seconds).
pub const SYNC_TIMEOUT_SECS: u64 = 15;

/// Fraction of a stream's buffer dropped by an emergency oversize purge.
pub const SYNC_PURGE_FRACTION: f64 = 0.5;

/// How often the flush timer fires (seconds).
pub const SYNC_INTERVAL_SECS: u64 = 300;

/// Random jitter added to each flush tick (seconds).
pub const SYNC_JITTER_SECS: u64 = 30;

// ============================================================================
// Storage
// ============================================================================

/// Default sled directory for offline telemetry.
pub const STORAGE_PATH: &str = "./data/telemetry";

/// Per-key blob ceiling enforced by the local store (bytes). 1 MiB.
pub const STORAGE_MAX_BLOB_BYTES: usize = crate::storage::DEFAULT_MAX_BLOB_BYTES;
