//! Core telemetry types shared by the buffer, sink and sync layers
//!
//! - **StreamType**: the three telemetry streams (metrics, alerts, reports)
//! - **SinkResource**: the two remote resources the streams flush into
//! - **TelemetryEntry**: one buffered record, immutable once created
//! - **FlushResult**: per-call outcome of a flush
//! - Payload records produced by the host: `PerformanceMetric`,
//!   `PerformanceAlert`, `CrashReport`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::buffer::size;

// ============================================================================
// Streams and Resources
// ============================================================================

/// A telemetry stream. Each stream has its own buffer, bounds and flush lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Metric,
    Alert,
    Report,
}

impl StreamType {
    pub const ALL: [Self; 3] = [Self::Metric, Self::Alert, Self::Report];

    /// Stable key of this stream's blob in the local store
    pub const fn storage_key(self) -> &'static str {
        match self {
            Self::Metric => "performance_metrics_offline",
            Self::Alert => "performance_alerts_offline",
            Self::Report => "crash_reports_offline",
        }
    }

    /// Remote resource this stream flushes into.
    ///
    /// Metrics and alerts share the performance resource, and therefore
    /// share one availability probe.
    pub const fn resource(self) -> SinkResource {
        match self {
            Self::Metric | Self::Alert => SinkResource::PerformanceMetrics,
            Self::Report => SinkResource::CrashReports,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metrics",
            Self::Alert => "alerts",
            Self::Report => "reports",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "metric" | "metrics" => Ok(Self::Metric),
            "alert" | "alerts" => Ok(Self::Alert),
            "report" | "reports" | "crash" | "crashes" => Ok(Self::Report),
            other => Err(format!(
                "unknown stream '{other}' (expected metrics, alerts or reports)"
            )),
        }
    }
}

/// Remote sink resource (table) a batch is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkResource {
    PerformanceMetrics,
    CrashReports,
}

impl SinkResource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerformanceMetrics => "performance_metrics",
            Self::CrashReports => "crash_reports",
        }
    }
}

impl std::fmt::Display for SinkResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Telemetry Entry
// ============================================================================

/// A single buffered telemetry record.
///
/// `size_bytes` is the exact length of this entry's compact JSON encoding,
/// computed once at creation by [`size::entry_size`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    /// UUID v4, unique per entry
    pub id: String,
    pub stream: StreamType,
    /// Opaque serialized event
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub size_bytes: usize,
}

impl TelemetryEntry {
    /// Create an entry stamped with the current time
    pub fn new(stream: StreamType, payload: serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::with_timestamp(stream, payload, Utc::now())
    }

    /// Create an entry with an explicit creation time
    pub fn with_timestamp(
        stream: StreamType,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let mut entry = Self {
            id: uuid::Uuid::new_v4().to_string(),
            stream,
            payload,
            created_at,
            size_bytes: 0,
        };
        entry.size_bytes = size::entry_size(&entry)?;
        Ok(entry)
    }

    /// Age of the entry relative to `now` (negative ages clamp to zero)
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.created_at).max(chrono::Duration::zero())
    }
}

// ============================================================================
// Flush Result
// ============================================================================

/// Outcome of one flush call. Transient, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Entries placed into at least one insert attempt
    pub attempted: usize,
    /// Entries the sink confirmed and that were removed from the buffer
    pub succeeded: usize,
    /// Entries whose final insert attempt failed (still buffered)
    pub failed: usize,
    /// An emergency oversize purge ran during this flush
    pub purged_for_oversize: bool,
    /// Nothing was attempted: stream not ready or sink unavailable
    pub skipped: bool,
}

impl FlushResult {
    pub const fn skipped() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            failed: 0,
            purged_for_oversize: false,
            skipped: true,
        }
    }

    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && !self.purged_for_oversize
    }
}

impl std::fmt::Display for FlushResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return write!(f, "skipped");
        }
        write!(
            f,
            "attempted={} succeeded={} failed={}",
            self.attempted, self.succeeded, self.failed
        )?;
        if self.purged_for_oversize {
            write!(f, " (purged for oversize)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// A performance measurement (screen load time, API latency, render cost)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub name: String,
    pub value: f64,
    /// Unit label ("ms", "bytes", "fps")
    pub unit: String,
    /// Screen or operation the measurement belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl PerformanceMetric {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            context: None,
            tags: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A performance threshold breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    /// Metric name that breached
    pub metric: String,
    pub threshold: f64,
    pub observed: f64,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// A crash or handled-error report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// True for crashes, false for handled errors
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    /// Present only once the user has signed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl CrashReport {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack: None,
            fatal,
            app_version: None,
            user_id: None,
            context: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}
