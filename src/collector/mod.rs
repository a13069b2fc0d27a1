//! Collector — per-stream entry point for telemetry events
//!
//! One generic collector, instantiated once per stream type through a
//! `StreamAdapter`. Nothing here ever fails towards the host application:
//! a lost metric is preferable to a blocked screen.
//!
//! ## Record path
//!
//! ```text
//! record(event)
//!   ├─ serialize (error → drop + log)
//!   ├─ probe says available → direct insert (timeout)
//!   │     ├─ ok → done
//!   │     └─ error or unconfirmed → permission: mark offline / other: re-probe
//!   └─ buffer (bounds re-checked, rejection counted)
//! ```

pub mod adapter;
mod scheduler;

pub use adapter::{AlertsAdapter, MetricsAdapter, ReportsAdapter, SerializationError, StreamAdapter};

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::{BoundedBuffer, BufferStats};
use crate::probe::AvailabilityProbe;
use crate::sink::{insert_with_timeout, ErrorClass, TelemetrySink};
use crate::sync::{StreamState, StreamStateMachine, SyncManager, SyncSettings};
use crate::types::{FlushResult, StreamType, TelemetryEntry};

/// What happened to one recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Written straight to the sink
    SentDirect,
    /// Stored in the offline buffer
    Buffered,
    /// Refused by the buffer (larger than the per-entry limit)
    Rejected,
    /// Not serializable, or the collector was never initialized
    Dropped,
}

/// Lifetime counters for one stream
#[derive(Debug, Default)]
pub struct StreamStats {
    recorded: AtomicU64,
    sent_direct: AtomicU64,
    buffered: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl StreamStats {
    fn count(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::SentDirect => &self.sent_direct,
            RecordOutcome::Buffered => &self.buffered,
            RecordOutcome::Rejected => &self.rejected,
            RecordOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Diagnostics snapshot for one stream
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub stream: StreamType,
    pub state: StreamState,
    pub recorded: u64,
    pub sent_direct: u64,
    pub buffered: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub oversize_purges: u64,
    pub buffer: BufferStats,
}

/// Handle to the background initialization task.
///
/// Awaiting it is optional; dropping it does not cancel initialization.
#[derive(Debug)]
pub struct InitHandle {
    task: Option<JoinHandle<StreamState>>,
    state: StreamState,
}

impl InitHandle {
    /// True once the background probe (and any startup flush) has finished
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for initialization and return the resulting stream state
    pub async fn wait(self) -> StreamState {
        match self.task {
            Some(task) => match task.await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "Initialization task failed");
                    self.state
                }
            },
            None => self.state,
        }
    }
}

/// Per-stream collector. Cheap to clone; clones share all state.
pub struct Collector<A: StreamAdapter> {
    inner: Arc<CollectorInner<A>>,
}

impl<A: StreamAdapter> Clone for Collector<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CollectorInner<A: StreamAdapter> {
    adapter: Arc<A>,
    buffer: Arc<BoundedBuffer>,
    sink: Arc<dyn TelemetrySink>,
    probe: Arc<AvailabilityProbe>,
    state: Arc<StreamStateMachine>,
    sync: SyncManager<A>,
    stats: StreamStats,
    write_timeout: Duration,
    /// Runtime captured by `initialize`, used by `record` from non-runtime threads
    runtime: OnceLock<Handle>,
}

impl<A: StreamAdapter> Collector<A> {
    pub fn new(
        adapter: A,
        buffer: BoundedBuffer,
        sink: Arc<dyn TelemetrySink>,
        probe: Arc<AvailabilityProbe>,
        settings: SyncSettings,
    ) -> Self {
        let adapter = Arc::new(adapter);
        let buffer = Arc::new(buffer);
        let state = Arc::new(StreamStateMachine::new(adapter.stream()));
        let sync = SyncManager::new(
            Arc::clone(&adapter),
            Arc::clone(&buffer),
            Arc::clone(&sink),
            Arc::clone(&probe),
            Arc::clone(&state),
            settings,
        );
        Self {
            inner: Arc::new(CollectorInner {
                adapter,
                buffer,
                sink,
                probe,
                state,
                sync,
                stats: StreamStats::default(),
                write_timeout: settings.timeout,
                runtime: OnceLock::new(),
            }),
        }
    }

    /// Start the collector. Returns immediately.
    ///
    /// The availability probe runs on a background task. If the sink turns
    /// out to be reachable and entries are waiting from a previous session,
    /// the same task flushes them. Must be called inside a tokio runtime.
    pub fn initialize(&self) -> InitHandle {
        let stream = self.stream();
        if !self.inner.state.begin_initialize() {
            debug!(stream = %stream, "Collector already initialized");
            return InitHandle {
                task: None,
                state: self.inner.state.current(),
            };
        }

        let _ = self.inner.runtime.set(Handle::current());
        let this = self.clone();
        let task = tokio::spawn(async move {
            let available = this.inner.probe.is_available().await;
            this.inner.state.set_available(available);
            let pending = this.inner.buffer.len();
            info!(stream = %stream, available, pending, "Collector initialized");

            if available && pending > 0 {
                let result = this.flush().await;
                info!(stream = %stream, %result, "Startup reconciliation flush");
            }
            this.inner.state.current()
        });

        InitHandle {
            task: Some(task),
            state: StreamState::Initializing,
        }
    }

    /// Record an event without waiting. Never fails.
    ///
    /// Serialization happens on the caller's thread so the event is not
    /// retained; delivery happens in the background, on the current runtime
    /// or else the one `initialize` ran on.
    pub fn record(&self, event: A::Event) {
        let Some(entry) = self.prepare(&event) else {
            return;
        };
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.get().cloned());
        let Some(runtime) = runtime else {
            warn!(stream = %self.stream(), "No tokio runtime to deliver on, event dropped");
            self.inner.stats.count(RecordOutcome::Dropped);
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            this.deliver(entry).await;
        });
    }

    /// Record an event and wait for the outcome
    pub async fn record_now(&self, event: A::Event) -> RecordOutcome {
        match self.prepare(&event) {
            Some(entry) => self.deliver(entry).await,
            None => RecordOutcome::Dropped,
        }
    }

    fn prepare(&self, event: &A::Event) -> Option<TelemetryEntry> {
        let stream = self.stream();
        self.inner.stats.recorded.fetch_add(1, Ordering::Relaxed);

        if !self.inner.state.current().is_initialized() {
            warn!(stream = %stream, "Event recorded before initialize(), dropped");
            self.inner.stats.count(RecordOutcome::Dropped);
            return None;
        }

        let entry = self
            .inner
            .adapter
            .serialize(event)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                TelemetryEntry::new(stream, payload).map_err(|e| e.to_string())
            });
        match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(stream = %stream, error = %e, class = %ErrorClass::Serialization, "Event dropped");
                self.inner.stats.count(RecordOutcome::Dropped);
                None
            }
        }
    }

    async fn deliver(&self, entry: TelemetryEntry) -> RecordOutcome {
        let outcome = self.try_direct(entry).await;
        self.inner.stats.count(outcome);
        outcome
    }

    async fn try_direct(&self, entry: TelemetryEntry) -> RecordOutcome {
        let inner = &self.inner;
        let stream = self.stream();

        let available = inner.probe.is_available().await;
        inner.state.set_available(available);
        if !available {
            return self.buffer_entry(entry);
        }

        let sent = insert_with_timeout(
            inner.sink.as_ref(),
            inner.adapter.resource(),
            std::slice::from_ref(&entry),
            inner.write_timeout,
        )
        .await;

        match sent {
            Ok(outcome) if outcome.accepted.iter().any(|id| *id == entry.id) => {
                return RecordOutcome::SentDirect;
            }
            Ok(_) => {
                debug!(stream = %stream, "Direct insert not confirmed, re-probing");
                self.reprobe().await;
            }
            Err(e) => match inner.adapter.classify_error(&e) {
                ErrorClass::Permission => {
                    warn!(stream = %stream, error = %e, "Direct insert denied, marking sink offline");
                    inner.probe.mark_unavailable().await;
                    inner.state.set_available(false);
                }
                class => {
                    debug!(stream = %stream, error = %e, %class, "Direct insert failed, re-probing");
                    self.reprobe().await;
                }
            },
        }
        self.buffer_entry(entry)
    }

    async fn reprobe(&self) {
        let available = self.inner.probe.force_reprobe().await;
        self.inner.state.set_available(available);
    }

    fn buffer_entry(&self, entry: TelemetryEntry) -> RecordOutcome {
        if self.inner.buffer.add(entry) {
            RecordOutcome::Buffered
        } else {
            RecordOutcome::Rejected
        }
    }

    /// Drain the offline buffer. Single-flight; never fails.
    pub async fn flush(&self) -> FlushResult {
        self.inner.sync.flush().await
    }

    /// Drop buffered entries older than the stream's retention window
    pub fn sweep_retention(&self) -> usize {
        self.inner.buffer.sweep_retention(Utc::now())
    }

    pub fn stream(&self) -> StreamType {
        self.inner.adapter.stream()
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.current()
    }

    pub fn buffer(&self) -> &BoundedBuffer {
        &self.inner.buffer
    }

    pub fn probe(&self) -> &AvailabilityProbe {
        &self.inner.probe
    }

    pub fn stats(&self) -> CollectorStats {
        let s = &self.inner.stats;
        CollectorStats {
            stream: self.stream(),
            state: self.state(),
            recorded: s.recorded.load(Ordering::Relaxed),
            sent_direct: s.sent_direct.load(Ordering::Relaxed),
            buffered: s.buffered.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            flushed: self.inner.sync.flushed_total(),
            oversize_purges: self.inner.sync.purges_total(),
            buffer: self.inner.buffer.stats(),
        }
    }
}
