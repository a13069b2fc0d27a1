//! telemetry-sync: offline-first telemetry buffering and sink synchronization
//!
//! Client-side engine shared by a performance collector (metrics, alerts)
//! and a crash-report collector. Events go straight to the remote sink when
//! it is reachable and into a bounded, persisted buffer when it is not; the
//! buffer is drained later in batches.
//!
//! ## Architecture
//!
//! - **Size estimation** (`buffer::size`): exact serialized byte sizes
//! - **Bounded buffer** (`buffer`): count/byte/retention-capped queue per stream
//! - **Availability probe** (`probe`): TTL-cached writability check per sink resource
//! - **Collector** (`collector`): record path, initialization, flush timer
//! - **Sync manager** (`sync`): single-flight batched flush with oversize recovery
//! - **Hub** (`hub`): the three streams wired from `TelemetryConfig`
//!
//! Storage (`BlobStore`) and the remote sink (`TelemetrySink`) are traits;
//! sled and reqwest implementations are included along with in-memory ones.

pub mod buffer;
pub mod collector;
pub mod config;
pub mod hub;
pub mod probe;
pub mod sink;
pub mod storage;
pub mod sync;
pub mod types;

pub use buffer::{BoundedBuffer, BufferError, BufferLimits, BufferStats};
pub use collector::{
    AlertsAdapter, Collector, CollectorStats, InitHandle, MetricsAdapter, RecordOutcome,
    ReportsAdapter, SerializationError, StreamAdapter,
};
pub use config::{ConfigError, TelemetryConfig};
pub use hub::{HubInitHandle, TelemetryHub};
pub use probe::{AvailabilityProbe, AvailabilitySnapshot};
pub use sink::{
    Credentials, ErrorClass, FailureMode, HttpSink, InsertOutcome, MemorySink, SinkError,
    TelemetrySink,
};
pub use storage::{BlobStore, MemoryStore, SledStore, StoreError};
pub use sync::{StreamState, SyncManager, SyncSettings};
pub use types::{
    AlertSeverity, CrashReport, FlushResult, PerformanceAlert, PerformanceMetric, SinkResource,
    StreamType, TelemetryEntry,
};
