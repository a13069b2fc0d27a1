//! Stream adapters
//!
//! The engine is generic; an adapter supplies what differs per stream:
//! the event type, how it becomes a JSON payload, and which sink resource
//! it lands in.

use serde::Serialize;

use crate::config::defaults::REPORT_MAX_STACK_BYTES;
use crate::sink::{ErrorClass, SinkError};
use crate::types::{CrashReport, PerformanceAlert, PerformanceMetric, SinkResource, StreamType};

/// Event could not be turned into a payload. The event is dropped.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid event: {0}")]
    Invalid(String),
}

/// Per-stream capabilities of the generic collector
pub trait StreamAdapter: Send + Sync + 'static {
    type Event: Serialize + Send + 'static;

    fn stream(&self) -> StreamType;

    fn serialize(&self, event: &Self::Event) -> Result<serde_json::Value, SerializationError>;

    fn classify_error(&self, error: &SinkError) -> ErrorClass {
        error.class()
    }

    fn resource(&self) -> SinkResource {
        self.stream().resource()
    }
}

/// Performance metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsAdapter;

impl StreamAdapter for MetricsAdapter {
    type Event = PerformanceMetric;

    fn stream(&self) -> StreamType {
        StreamType::Metric
    }

    fn serialize(&self, event: &PerformanceMetric) -> Result<serde_json::Value, SerializationError> {
        // serde_json would silently write NaN as null
        if !event.value.is_finite() {
            return Err(SerializationError::Invalid(format!(
                "metric '{}' has non-finite value",
                event.name
            )));
        }
        if event.name.trim().is_empty() {
            return Err(SerializationError::Invalid("metric name is empty".to_string()));
        }
        Ok(serde_json::to_value(event)?)
    }
}

/// Performance alerts (threshold breaches)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertsAdapter;

impl StreamAdapter for AlertsAdapter {
    type Event = PerformanceAlert;

    fn stream(&self) -> StreamType {
        StreamType::Alert
    }

    fn serialize(&self, event: &PerformanceAlert) -> Result<serde_json::Value, SerializationError> {
        if !event.observed.is_finite() || !event.threshold.is_finite() {
            return Err(SerializationError::Invalid(format!(
                "alert on '{}' has non-finite values",
                event.metric
            )));
        }
        Ok(serde_json::to_value(event)?)
    }
}

/// Crash and error reports. Stacks are truncated so one report fits under
/// the per-entry ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ReportsAdapter {
    max_stack_bytes: usize,
}

impl ReportsAdapter {
    pub const fn new(max_stack_bytes: usize) -> Self {
        Self { max_stack_bytes }
    }
}

impl Default for ReportsAdapter {
    fn default() -> Self {
        Self::new(REPORT_MAX_STACK_BYTES)
    }
}

const TRUNCATION_MARKER: &str = "\n[truncated]";

impl StreamAdapter for ReportsAdapter {
    type Event = CrashReport;

    fn stream(&self) -> StreamType {
        StreamType::Report
    }

    fn serialize(&self, event: &CrashReport) -> Result<serde_json::Value, SerializationError> {
        let mut value = serde_json::to_value(event)?;
        if let Some(stack) = event.stack.as_deref() {
            if stack.len() > self.max_stack_bytes {
                let trimmed = truncate_stack(stack, self.max_stack_bytes);
                value["stack"] = serde_json::Value::String(trimmed);
            }
        }
        Ok(value)
    }
}

/// Keep the top of the stack (the frames nearest the fault), cut on a char
/// boundary, and mark the cut.
fn truncate_stack(stack: &str, max_bytes: usize) -> String {
    let budget = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    let mut end = budget.min(stack.len());
    while end > 0 && !stack.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&stack[..end]);
    out.push_str(TRUNCATION_MARKER);
    out
}
