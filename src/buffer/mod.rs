//! Bounded Buffer — size- and count-capped offline queue for one stream
//!
//! Holds telemetry that could not be written to the sink directly. Entries
//! are kept oldest-first and persisted as a single JSON array blob under the
//! stream's storage key.
//!
//! ## Bounds
//!
//! After every operation `len ≤ max_count` and `Σ size_bytes ≤ max_total_bytes`.
//! Entries larger than `max_entry_bytes` are rejected before insertion.
//! When a bound is exceeded the oldest entries are evicted first: the newest
//! telemetry is the most actionable.
//!
//! ## Persistence
//!
//! Each mutation builds the next state, writes the full blob once, then
//! swaps it in. If the store refuses the blob as too large, the oldest
//! `purge_fraction` of the candidate state is dropped and the write is
//! retried once.

pub mod size;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::storage::{BlobStore, StoreError};
use crate::types::{StreamType, TelemetryEntry};

/// Bounds for one stream's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_count: usize,
    pub max_total_bytes: usize,
    pub max_entry_bytes: usize,
    /// Entries older than this are swept; `None` disables time retention
    pub retention: Option<chrono::Duration>,
}

/// Buffer errors surfaced to maintenance callers (the collectors swallow them)
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Point-in-time view of a buffer
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub stream: StreamType,
    pub count: usize,
    pub total_bytes: usize,
    pub blob_bytes: usize,
    pub evicted_total: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Offline buffer for one telemetry stream
pub struct BoundedBuffer {
    stream: StreamType,
    limits: BufferLimits,
    purge_fraction: f64,
    store: Arc<dyn BlobStore>,
    entries: Mutex<VecDeque<TelemetryEntry>>,
    evicted: AtomicU64,
}

impl BoundedBuffer {
    /// Open the buffer for `stream`, restoring any persisted entries.
    ///
    /// A corrupt blob is discarded. Restored entries are re-validated
    /// against the current limits, which may be tighter than the ones they
    /// were written under.
    pub fn open(
        stream: StreamType,
        limits: BufferLimits,
        purge_fraction: f64,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let buffer = Self {
            stream,
            limits,
            purge_fraction,
            store,
            entries: Mutex::new(VecDeque::new()),
            evicted: AtomicU64::new(0),
        };
        buffer.restore();
        buffer
    }

    fn restore(&self) {
        let key = self.stream.storage_key();
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(stream = %self.stream, "No offline telemetry to restore");
                return;
            }
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "Could not read offline telemetry, starting empty");
                return;
            }
        };

        let loaded: Vec<TelemetryEntry> = match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                error!(stream = %self.stream, error = %e, size_bytes = raw.len(), "Corrupted offline telemetry, discarding");
                if let Err(e) = self.store.remove(key) {
                    warn!(stream = %self.stream, error = %e, "Failed to remove corrupted blob");
                }
                return;
            }
        };

        let loaded_count = loaded.len();
        let mut next = VecDeque::with_capacity(loaded_count);
        for mut entry in loaded {
            if entry.stream != self.stream {
                continue;
            }
            // Stored sizes are not trusted
            match size::entry_size(&entry) {
                Ok(s) if s <= self.limits.max_entry_bytes => {
                    entry.size_bytes = s;
                    next.push_back(entry);
                }
                _ => {}
            }
        }
        let evicted = enforce_bounds(&mut next, &self.limits);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);

        let changed = next.len() != loaded_count;
        let mut guard = self.lock();
        if changed {
            info!(
                stream = %self.stream,
                loaded = loaded_count,
                kept = next.len(),
                "Offline telemetry trimmed to current limits"
            );
            self.commit(&mut guard, next, "restore");
        } else {
            info!(stream = %self.stream, pending = next.len(), "Offline telemetry restored");
            *guard = next;
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TelemetryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `next` and swap it in. Exactly one write on the happy path.
    fn commit(
        &self,
        guard: &mut MutexGuard<'_, VecDeque<TelemetryEntry>>,
        mut next: VecDeque<TelemetryEntry>,
        op: &'static str,
    ) {
        match self.persist(&next) {
            Ok(()) => {}
            Err(BufferError::Store(e)) if e.is_capacity() => {
                let purged = purge_front(&mut next, self.purge_fraction);
                warn!(
                    stream = %self.stream,
                    op,
                    error = %e,
                    purged,
                    remaining = next.len(),
                    "Offline blob over store limit, purged oldest entries"
                );
                if let Err(e) = self.persist(&next) {
                    error!(stream = %self.stream, op, error = %e, "Offline blob still rejected after purge");
                }
            }
            Err(e) => {
                warn!(stream = %self.stream, op, error = %e, "Failed to persist offline telemetry");
            }
        }
        **guard = next;
    }

    fn persist(&self, entries: &VecDeque<TelemetryEntry>) -> Result<(), BufferError> {
        let blob = serde_json::to_vec(entries)?;
        self.store.put(self.stream.storage_key(), &blob)?;
        Ok(())
    }

    /// Add an entry, evicting the oldest entries until bounds hold.
    ///
    /// Returns `false` if the entry was rejected (too large or wrong stream).
    pub fn add(&self, entry: TelemetryEntry) -> bool {
        if entry.stream != self.stream {
            warn!(stream = %self.stream, entry_stream = %entry.stream, "Entry for another stream rejected");
            return false;
        }
        if entry.size_bytes > self.limits.max_entry_bytes {
            debug!(
                stream = %self.stream,
                size_bytes = entry.size_bytes,
                max_entry_bytes = self.limits.max_entry_bytes,
                "Entry exceeds per-entry limit, rejected"
            );
            return false;
        }

        let mut guard = self.lock();
        let mut next = guard.clone();
        next.push_back(entry);
        let evicted = enforce_bounds(&mut next, &self.limits);
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(stream = %self.stream, evicted, "Evicted oldest entries to stay within bounds");
        }
        self.commit(&mut guard, next, "add");
        true
    }

    /// Remove entries the sink confirmed. Returns the number removed.
    pub fn remove_flushed(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let mut guard = self.lock();
        let mut next = guard.clone();
        next.retain(|e| !ids.contains(e.id.as_str()));
        let removed = guard.len() - next.len();
        if removed > 0 {
            self.commit(&mut guard, next, "remove_flushed");
        }
        removed
    }

    /// Remove entries older than the retention window. Returns the number removed.
    pub fn sweep_retention(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.limits.retention else {
            return 0;
        };
        let cutoff = now - retention;

        let mut guard = self.lock();
        let mut next = guard.clone();
        next.retain(|e| e.created_at >= cutoff);
        let removed = guard.len() - next.len();
        if removed > 0 {
            info!(stream = %self.stream, removed, "Retention sweep removed expired entries");
            self.commit(&mut guard, next, "sweep_retention");
        }
        removed
    }

    /// Emergency purge: drop the oldest `fraction` of entries (at least one).
    pub fn purge_oldest(&self, fraction: f64) -> usize {
        let mut guard = self.lock();
        if guard.is_empty() {
            return 0;
        }
        let mut next = guard.clone();
        let purged = purge_front(&mut next, fraction);
        self.commit(&mut guard, next, "purge_oldest");
        purged
    }

    /// Drop every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let removed = guard.len();
        self.commit(&mut guard, VecDeque::new(), "clear");
        removed
    }

    /// Ordered copy of the buffered entries (oldest first)
    pub fn snapshot(&self) -> Vec<TelemetryEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Entries from `batch` that are still buffered, in buffer order
    pub fn still_buffered(&self, batch: &[TelemetryEntry]) -> Vec<TelemetryEntry> {
        let wanted: HashSet<&str> = batch.iter().map(|e| e.id.as_str()).collect();
        self.lock()
            .iter()
            .filter(|e| wanted.contains(e.id.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Σ size_bytes of buffered entries
    pub fn total_bytes(&self) -> usize {
        size::total_entry_bytes(self.lock().iter())
    }

    pub const fn stream(&self) -> StreamType {
        self.stream
    }

    pub const fn limits(&self) -> &BufferLimits {
        &self.limits
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        let guard = self.lock();
        BufferStats {
            stream: self.stream,
            count: guard.len(),
            total_bytes: size::total_entry_bytes(guard.iter()),
            blob_bytes: size::buffer_size(guard.iter()),
            evicted_total: self.evicted_total(),
            oldest: guard.front().map(|e| e.created_at),
            newest: guard.back().map(|e| e.created_at),
        }
    }
}

/// Evict oldest entries until both bounds hold. Returns the number evicted.
fn enforce_bounds(entries: &mut VecDeque<TelemetryEntry>, limits: &BufferLimits) -> usize {
    let mut total = size::total_entry_bytes(entries.iter());
    let mut evicted = 0;
    while entries.len() > limits.max_count || total > limits.max_total_bytes {
        match entries.pop_front() {
            Some(e) => {
                total -= e.size_bytes;
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}

/// Drop `ceil(len × fraction)` oldest entries, at least one when non-empty.
fn purge_front(entries: &mut VecDeque<TelemetryEntry>, fraction: f64) -> usize {
    if entries.is_empty() {
        return 0;
    }
    let len = entries.len();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let n = ((len as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
    let n = n.clamp(1, len);
    entries.drain(..n);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn limits(max_count: usize, max_total_bytes: usize) -> BufferLimits {
        BufferLimits {
            max_count,
            max_total_bytes,
            max_entry_bytes: 4 * 1024,
            retention: None,
        }
    }

    fn metric(i: usize) -> TelemetryEntry {
        TelemetryEntry::new(
            StreamType::Metric,
            serde_json::json!({ "name": "screen_load", "value": i }),
        )
        .unwrap()
    }

    fn open(limits: BufferLimits, store: Arc<MemoryStore>) -> BoundedBuffer {
        BoundedBuffer::open(StreamType::Metric, limits, 0.5, store)
    }

    #[test]
    fn test_count_bound_keeps_newest() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(100, usize::MAX), store);

        let mut ids = Vec::new();
        for i in 0..150 {
            let e = metric(i);
            ids.push(e.id.clone());
            assert!(buffer.add(e));
        }

        let snap = buffer.snapshot();
        assert_eq!(snap.len(), 100);
        let kept: Vec<_> = snap.iter().map(|e| e.id.clone()).collect();
        assert_eq!(kept, ids[50..].to_vec());
        assert_eq!(buffer.evicted_total(), 50);
    }

    #[test]
    fn test_oversize_entry_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut l = limits(10, 100_000);
        l.max_entry_bytes = 200;
        let buffer = open(l, store.clone());

        assert!(buffer.add(metric(1)));
        let big = TelemetryEntry::new(
            StreamType::Metric,
            serde_json::json!({ "stack": "x".repeat(500) }),
        )
        .unwrap();
        assert!(!buffer.add(big));
        assert_eq!(buffer.len(), 1);
        assert_eq!(store.write_count(), 1, "rejected entry must not be written");
    }

    #[test]
    fn test_wrong_stream_rejected() {
        let buffer = open(limits(10, 100_000), Arc::new(MemoryStore::new()));
        let alert = TelemetryEntry::new(StreamType::Alert, serde_json::json!({})).unwrap();
        assert!(!buffer.add(alert));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_bounds_hold_after_every_operation() {
        let store = Arc::new(MemoryStore::new());
        let l = limits(20, 3_000);
        let buffer = open(l, store);

        for i in 0..200 {
            let payload = serde_json::json!({ "pad": "y".repeat((i * 37) % 400) });
            let e = TelemetryEntry::new(StreamType::Metric, payload).unwrap();
            buffer.add(e);
            if i % 7 == 0 {
                let snap = buffer.snapshot();
                let ids: Vec<String> = snap.iter().take(2).map(|e| e.id.clone()).collect();
                buffer.remove_flushed(&ids);
            }
            if i % 11 == 0 {
                buffer.sweep_retention(Utc::now());
            }
            assert!(buffer.len() <= l.max_count);
            assert!(buffer.total_bytes() <= l.max_total_bytes);
        }
    }

    #[test]
    fn test_byte_bound_evicts_oldest() {
        let store = Arc::new(MemoryStore::new());
        let first = metric(0);
        let per_entry = first.size_bytes;
        // Room for exactly three entries of this size
        let buffer = open(limits(100, per_entry * 3 + per_entry / 2), store);

        buffer.add(first.clone());
        for i in 1..4 {
            buffer.add(metric(i));
        }
        let snap = buffer.snapshot();
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|e| e.id != first.id));
    }

    #[test]
    fn test_remove_flushed_removes_exactly_listed_ids() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(10, 100_000), store);
        let entries: Vec<_> = (0..5).map(metric).collect();
        for e in &entries {
            buffer.add(e.clone());
        }

        let confirmed = vec![entries[1].id.clone(), entries[3].id.clone(), "unknown".to_string()];
        assert_eq!(buffer.remove_flushed(&confirmed), 2);
        let remaining: Vec<_> = buffer.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(
            remaining,
            vec![entries[0].id.clone(), entries[2].id.clone(), entries[4].id.clone()]
        );
        // Second removal of the same ids is a no-op
        assert_eq!(buffer.remove_flushed(&confirmed), 0);
    }

    #[test]
    fn test_sweep_retention_removes_only_expired() {
        let store = Arc::new(MemoryStore::new());
        let mut l = limits(100, 1_000_000);
        l.retention = Some(chrono::Duration::hours(24));
        let buffer = open(l, store);

        let now = Utc::now();
        for h in [30, 25, 23, 1] {
            let e = TelemetryEntry::with_timestamp(
                StreamType::Metric,
                serde_json::json!({ "h": h }),
                now - chrono::Duration::hours(h),
            )
            .unwrap();
            buffer.add(e);
        }

        assert_eq!(buffer.sweep_retention(now), 2);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.sweep_retention(now), 0);
    }

    #[test]
    fn test_sweep_without_retention_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(10, 100_000), store.clone());
        let old = TelemetryEntry::with_timestamp(
            StreamType::Metric,
            serde_json::json!({}),
            Utc::now() - chrono::Duration::days(30),
        )
        .unwrap();
        buffer.add(old);
        let writes = store.write_count();
        assert_eq!(buffer.sweep_retention(Utc::now()), 0);
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn test_one_write_per_mutation() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(3, 100_000), store.clone());

        for i in 0..5 {
            buffer.add(metric(i));
        }
        assert_eq!(store.write_count(), 5);

        let id = buffer.snapshot()[0].id.clone();
        buffer.remove_flushed(&[id]);
        assert_eq!(store.write_count(), 6);

        buffer.purge_oldest(0.5);
        assert_eq!(store.write_count(), 7);
    }

    #[test]
    fn test_purge_oldest_fraction() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(100, 1_000_000), store);
        for i in 0..50 {
            buffer.add(metric(i));
        }
        assert_eq!(buffer.purge_oldest(0.5), 25);
        assert_eq!(buffer.len(), 25);
        // Rounds up, never zero
        assert_eq!(buffer.purge_oldest(0.01), 1);
        assert_eq!(buffer.len(), 24);
    }

    #[test]
    fn test_store_ceiling_triggers_local_purge() {
        let store = Arc::new(MemoryStore::with_ceiling(1_000));
        let buffer = open(limits(1_000, 1_000_000), store.clone());

        for i in 0..40 {
            buffer.add(metric(i));
            let blob = store.get(StreamType::Metric.storage_key()).unwrap().unwrap();
            assert!(blob.len() <= 1_000);
            let persisted: Vec<TelemetryEntry> = serde_json::from_slice(&blob).unwrap();
            assert_eq!(persisted.len(), buffer.len(), "memory and store diverged");
        }
        assert!(buffer.len() < 40);
    }

    #[test]
    fn test_restore_after_reopen() {
        let store = Arc::new(MemoryStore::new());
        let ids: Vec<String> = {
            let buffer = open(limits(10, 100_000), store.clone());
            (0..4)
                .map(|i| {
                    let e = metric(i);
                    let id = e.id.clone();
                    buffer.add(e);
                    id
                })
                .collect()
        };

        let reopened = open(limits(10, 100_000), store);
        let restored: Vec<String> = reopened.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(restored, ids);
    }

    #[test]
    fn test_restore_applies_tighter_limits() {
        let store = Arc::new(MemoryStore::new());
        {
            let buffer = open(limits(10, 100_000), store.clone());
            for i in 0..10 {
                buffer.add(metric(i));
            }
        }
        let reopened = open(limits(4, 100_000), store.clone());
        assert_eq!(reopened.len(), 4);

        let blob = store.get(StreamType::Metric.storage_key()).unwrap().unwrap();
        let persisted: Vec<TelemetryEntry> = serde_json::from_slice(&blob).unwrap();
        assert_eq!(persisted.len(), 4);
    }

    #[test]
    fn test_corrupt_blob_recovers_empty() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(StreamType::Metric.storage_key(), b"{not json")
            .unwrap();

        let buffer = open(limits(10, 100_000), store.clone());
        assert!(buffer.is_empty());
        assert_eq!(store.get(StreamType::Metric.storage_key()).unwrap(), None);

        assert!(buffer.add(metric(1)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_still_buffered_filters_purged() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(10, 100_000), store);
        let entries: Vec<_> = (0..4).map(metric).collect();
        for e in &entries {
            buffer.add(e.clone());
        }
        buffer.purge_oldest(0.5);
        let present = buffer.still_buffered(&entries);
        assert_eq!(present.len(), 2);
        assert_eq!(present[0].id, entries[2].id);
    }

    #[test]
    fn test_stats() {
        let store = Arc::new(MemoryStore::new());
        let buffer = open(limits(10, 100_000), store);
        assert!(buffer.stats().oldest.is_none());
        buffer.add(metric(1));
        buffer.add(metric(2));
        let stats = buffer.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.blob_bytes, stats.total_bytes + 3);
        assert!(stats.oldest <= stats.newest);
    }
}
