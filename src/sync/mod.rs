//! Sync Manager — drains one stream's offline buffer into the sink
//!
//! Flushes are single-flight per stream: a caller that arrives while a flush
//! is running awaits that flush and gets its result. The flush itself runs on
//! its own task, so it finishes (or times out) even if every caller stops
//! waiting.
//!
//! ## Algorithm
//!
//! 1. Retention sweep, then a forced re-probe. Unavailable → skipped.
//! 2. Snapshot the buffer, cut it into batches bounded by entry count and
//!    encoded bytes.
//! 3. Bulk insert each batch under a timeout; remove exactly the accepted ids.
//! 4. Storage-capacity error: purge the oldest `purge_fraction` of the buffer,
//!    retry the surviving part of the batch once. One purge per flush.
//! 5. Any other error stops the flush with the buffer untouched. Permission
//!    errors also mark the sink unavailable until the probe TTL lapses.

pub mod state;

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::buffer::BoundedBuffer;
use crate::collector::StreamAdapter;
use crate::config::SyncConfig;
use crate::probe::AvailabilityProbe;
use crate::sink::{insert_with_timeout, ErrorClass, InsertOutcome, SinkError, TelemetrySink};
use crate::types::{FlushResult, TelemetryEntry};

pub use state::{IllegalTransition, StreamState, StreamStateMachine};

/// Batching and recovery policy for flushes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSettings {
    pub batch_max_entries: usize,
    pub batch_max_bytes: usize,
    /// Per-request timeout for bulk and direct inserts
    pub timeout: Duration,
    pub purge_fraction: f64,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_max_entries: config.batch_max_entries.max(1),
            batch_max_bytes: config.batch_max_bytes,
            timeout: config.timeout(),
            purge_fraction: config.purge_fraction,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

type Flight = Shared<BoxFuture<'static, FlushResult>>;

/// Single-flight flusher for one stream
pub struct SyncManager<A: StreamAdapter> {
    inner: Arc<FlushInner<A>>,
}

impl<A: StreamAdapter> Clone for SyncManager<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct FlushInner<A: StreamAdapter> {
    adapter: Arc<A>,
    buffer: Arc<BoundedBuffer>,
    sink: Arc<dyn TelemetrySink>,
    probe: Arc<AvailabilityProbe>,
    state: Arc<StreamStateMachine>,
    settings: SyncSettings,
    in_flight: Mutex<Option<Flight>>,
    flushed_total: AtomicU64,
    purges_total: AtomicU64,
}

impl<A: StreamAdapter> SyncManager<A> {
    pub fn new(
        adapter: Arc<A>,
        buffer: Arc<BoundedBuffer>,
        sink: Arc<dyn TelemetrySink>,
        probe: Arc<AvailabilityProbe>,
        state: Arc<StreamStateMachine>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                adapter,
                buffer,
                sink,
                probe,
                state,
                settings,
                in_flight: Mutex::new(None),
                flushed_total: AtomicU64::new(0),
                purges_total: AtomicU64::new(0),
            }),
        }
    }

    /// Drain the buffer. Joins the in-flight flush if there is one.
    ///
    /// Never fails: errors are logged and reflected in the result.
    pub async fn flush(&self) -> FlushResult {
        match self.join_or_start() {
            Some(flight) => flight.await,
            None => FlushResult::skipped(),
        }
    }

    fn join_or_start(&self) -> Option<Flight> {
        let mut slot = self.inner.lock_flight();
        if let Some(flight) = slot.as_ref() {
            debug!(stream = %self.inner.buffer.stream(), "Joining in-flight flush");
            return Some(flight.clone());
        }
        if !self.inner.state.try_begin_flush() {
            debug!(
                stream = %self.inner.buffer.stream(),
                state = %self.inner.state.current(),
                "Flush skipped, stream not ready"
            );
            return None;
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let (result, available) = match AssertUnwindSafe(inner.run()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(stream = %inner.buffer.stream(), "Flush task panicked");
                    (FlushResult::default(), false)
                }
            };
            inner.state.end_flush(available);
            *inner.lock_flight() = None;
            result
        });

        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Flush task did not complete");
                    FlushResult::default()
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(flight.clone());
        Some(flight)
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.lock_flight().is_some()
    }

    /// Entries removed from the buffer by confirmed flushes, lifetime
    pub fn flushed_total(&self) -> u64 {
        self.inner.flushed_total.load(Ordering::Relaxed)
    }

    /// Emergency oversize purges, lifetime
    pub fn purges_total(&self) -> u64 {
        self.inner.purges_total.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }
}

impl<A: StreamAdapter> FlushInner<A> {
    fn lock_flight(&self) -> MutexGuard<'_, Option<Flight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One flush pass. Returns the result and the availability to record.
    async fn run(&self) -> (FlushResult, bool) {
        let stream = self.buffer.stream();
        self.buffer.sweep_retention(Utc::now());

        if !self.probe.force_reprobe().await {
            debug!(stream = %stream, "Sink unavailable, flush skipped");
            return (FlushResult::skipped(), false);
        }

        let pending = self.buffer.snapshot();
        if pending.is_empty() {
            return (FlushResult::default(), true);
        }

        let batches = partition(
            pending,
            self.settings.batch_max_entries,
            self.settings.batch_max_bytes,
        );
        let batch_count = batches.len();
        let mut result = FlushResult::default();
        let mut available = true;

        for batch in batches {
            // Entries may have been purged since the snapshot
            let batch = if result.purged_for_oversize {
                self.buffer.still_buffered(&batch)
            } else {
                batch
            };
            if batch.is_empty() {
                continue;
            }
            result.attempted += batch.len();

            let err = match self.send(&batch).await {
                Ok(outcome) => {
                    self.apply(&batch, outcome, &mut result);
                    continue;
                }
                Err(e) => e,
            };

            match self.adapter.classify_error(&err) {
                ErrorClass::StorageCapacity if !result.purged_for_oversize => {
                    result.purged_for_oversize = true;
                    self.purges_total.fetch_add(1, Ordering::Relaxed);
                    let purged = self.buffer.purge_oldest(self.settings.purge_fraction);
                    let retry = self.buffer.still_buffered(&batch);
                    warn!(
                        stream = %stream,
                        error = %err,
                        purged,
                        retry_entries = retry.len(),
                        remaining = self.buffer.len(),
                        "Sink rejected batch as too large, purged oldest entries"
                    );
                    if retry.is_empty() {
                        continue;
                    }
                    match self.send(&retry).await {
                        Ok(outcome) => self.apply(&retry, outcome, &mut result),
                        Err(e) => {
                            warn!(stream = %stream, error = %e, "Retry after purge failed, aborting flush");
                            result.failed += retry.len();
                            if self.adapter.classify_error(&e) == ErrorClass::Permission {
                                self.probe.mark_unavailable().await;
                                available = false;
                            }
                            break;
                        }
                    }
                }
                ErrorClass::Permission => {
                    warn!(stream = %stream, error = %err, "Sink denied insert, backing off until next probe");
                    self.probe.mark_unavailable().await;
                    available = false;
                    result.failed += batch.len();
                    break;
                }
                class => {
                    warn!(stream = %stream, error = %err, %class, "Flush batch failed, entries kept for next flush");
                    result.failed += batch.len();
                    break;
                }
            }
        }

        self.flushed_total
            .fetch_add(result.succeeded as u64, Ordering::Relaxed);
        info!(
            stream = %stream,
            batches = batch_count,
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            purged_for_oversize = result.purged_for_oversize,
            remaining = self.buffer.len(),
            "Flush complete"
        );
        (result, available)
    }

    async fn send(&self, batch: &[TelemetryEntry]) -> Result<InsertOutcome, SinkError> {
        insert_with_timeout(
            self.sink.as_ref(),
            self.adapter.resource(),
            batch,
            self.settings.timeout,
        )
        .await
    }

    /// Remove the confirmed part of `batch` from the buffer
    fn apply(&self, batch: &[TelemetryEntry], outcome: InsertOutcome, result: &mut FlushResult) {
        // The sink may echo ids more than once or list ids it was never sent
        let accepted: HashSet<&str> = outcome.accepted.iter().map(String::as_str).collect();
        let confirmed: Vec<String> = batch
            .iter()
            .filter(|e| accepted.contains(e.id.as_str()))
            .map(|e| e.id.clone())
            .collect();
        let removed = self.buffer.remove_flushed(&confirmed);
        result.succeeded += removed;
        let unconfirmed = batch.len() - confirmed.len();
        if unconfirmed > 0 {
            debug!(stream = %self.buffer.stream(), unconfirmed, "Sink did not confirm every entry");
            result.failed += unconfirmed;
        }
    }
}

/// Cut `entries` into batches of at most `max_entries` entries whose JSON
/// array encoding stays within `max_bytes`. An entry that alone exceeds
/// `max_bytes` travels in a batch of its own.
pub(crate) fn partition(
    entries: Vec<TelemetryEntry>,
    max_entries: usize,
    max_bytes: usize,
) -> Vec<Vec<TelemetryEntry>> {
    let max_entries = max_entries.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<TelemetryEntry> = Vec::new();
    let mut current_bytes = 2; // []

    for entry in entries {
        let separator = usize::from(!current.is_empty());
        let full = current.len() >= max_entries
            || current_bytes + separator + entry.size_bytes > max_bytes;
        if !current.is_empty() && full {
            batches.push(std::mem::take(&mut current));
            current_bytes = 2;
        }
        current_bytes += usize::from(!current.is_empty()) + entry.size_bytes;
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
