//! Remote telemetry sink
//!
//! The sink exposes two resources (performance metrics, crash reports) with
//! asymmetric access: inserts and probes work for an anonymous caller so
//! telemetry flows before login, reads require credentials.
//!
//! - `HttpSink`: reqwest client for the hosted sink
//! - `MemorySink`: scriptable in-process sink for tests and offline runs

mod http;
mod memory;

pub use http::HttpSink;
pub use memory::{FailureMode, MemorySink};

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{SinkResource, TelemetryEntry};

/// Sink errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),
    #[error("sink request timed out after {0:?}")]
    Timeout(Duration),
    #[error("sink denied access: {0}")]
    PermissionDenied(String),
    #[error("payload too large for sink: {0}")]
    PayloadTooLarge(String),
    #[error("sink returned status {0}")]
    Status(u16),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Recovery class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unreachable or timed out: keep buffered, retry on next flush
    TransientNetwork,
    /// Row/blob/bulk insert too large: emergency purge and one retry
    StorageCapacity,
    /// Auth or policy rejection: mark sink unavailable until the probe TTL lapses
    Permission,
    /// Malformed event: drop it
    Serialization,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::TransientNetwork => write!(f, "transient_network"),
            ErrorClass::StorageCapacity => write!(f, "storage_capacity"),
            ErrorClass::Permission => write!(f, "permission"),
            ErrorClass::Serialization => write!(f, "serialization"),
        }
    }
}

impl SinkError {
    /// Default classification. Stream adapters may refine it.
    pub const fn class(&self) -> ErrorClass {
        match self {
            SinkError::Unreachable(_) | SinkError::Timeout(_) | SinkError::Status(_) => {
                ErrorClass::TransientNetwork
            }
            SinkError::PermissionDenied(_) => ErrorClass::Permission,
            SinkError::PayloadTooLarge(_) => ErrorClass::StorageCapacity,
            SinkError::Serialization(_) => ErrorClass::Serialization,
        }
    }
}

/// Result of a bulk insert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Ids the sink durably accepted. Only these may leave the buffer.
    pub accepted: Vec<String>,
}

impl InsertOutcome {
    pub fn all(entries: &[TelemetryEntry]) -> Self {
        Self {
            accepted: entries.iter().map(|e| e.id.clone()).collect(),
        }
    }
}

/// Credentials of a signed-in user, required for reads only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub bearer_token: String,
}

/// Trait for remote telemetry sinks
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Bulk insert. Must work without credentials.
    async fn insert(
        &self,
        resource: SinkResource,
        entries: &[TelemetryEntry],
    ) -> Result<InsertOutcome, SinkError>;

    /// Lightweight writability check against `resource`. Must work without
    /// credentials.
    async fn probe(&self, resource: SinkResource) -> Result<(), SinkError>;

    /// Read the most recent records. Requires credentials.
    async fn read_recent(
        &self,
        resource: SinkResource,
        limit: usize,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<TelemetryEntry>, SinkError>;

    /// Sink name for logging
    fn name(&self) -> &'static str;
}

/// Bulk insert bounded by `timeout`; an elapsed timer is a transient failure.
pub async fn insert_with_timeout(
    sink: &dyn TelemetrySink,
    resource: SinkResource,
    entries: &[TelemetryEntry],
    timeout: Duration,
) -> Result<InsertOutcome, SinkError> {
    match tokio::time::timeout(timeout, sink.insert(resource, entries)).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout(timeout)),
    }
}

/// Probe bounded by `timeout`
pub async fn probe_with_timeout(
    sink: &dyn TelemetrySink,
    resource: SinkResource,
    timeout: Duration,
) -> Result<(), SinkError> {
    match tokio::time::timeout(timeout, sink.probe(resource)).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout(timeout)),
    }
}
