//! Availability Probe — cached writability check against one sink resource
//!
//! Probing before every event would add latency and load, so results are
//! cached for a TTL. One probe is shared by every stream that writes to the
//! same resource (metrics and alerts share one, reports have their own).
//!
//! The probe exercises the anonymous insert path, so it reports the sink as
//! available before the user has signed in.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::sink::{probe_with_timeout, TelemetrySink};
use crate::types::SinkResource;

/// Last known availability of a sink resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub available: bool,
    pub checked_at: Instant,
    pub ttl: Duration,
}

impl AvailabilitySnapshot {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.checked_at) < self.ttl
    }
}

/// Cached availability check for one sink resource
pub struct AvailabilityProbe {
    resource: SinkResource,
    sink: Arc<dyn TelemetrySink>,
    ttl: Duration,
    timeout: Duration,
    /// Held across the probe call so concurrent callers share one probe
    snapshot: Mutex<Option<AvailabilitySnapshot>>,
}

impl AvailabilityProbe {
    pub fn new(
        resource: SinkResource,
        sink: Arc<dyn TelemetrySink>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            resource,
            sink,
            ttl,
            timeout,
            snapshot: Mutex::new(None),
        }
    }

    pub const fn resource(&self) -> SinkResource {
        self.resource
    }

    /// Cached availability, re-probing once the TTL has lapsed
    pub async fn is_available(&self) -> bool {
        let mut guard = self.snapshot.lock().await;
        if let Some(snap) = *guard {
            if snap.is_fresh(Instant::now()) {
                return snap.available;
            }
        }
        self.probe_locked(&mut guard).await
    }

    /// Probe now, ignoring the cache
    pub async fn force_reprobe(&self) -> bool {
        let mut guard = self.snapshot.lock().await;
        self.probe_locked(&mut guard).await
    }

    /// Record the sink as unavailable without a network call.
    ///
    /// Used after a permission rejection so the next attempt waits for the TTL.
    pub async fn mark_unavailable(&self) {
        let mut guard = self.snapshot.lock().await;
        self.store(&mut guard, false);
    }

    pub async fn snapshot(&self) -> Option<AvailabilitySnapshot> {
        *self.snapshot.lock().await
    }

    async fn probe_locked(&self, guard: &mut Option<AvailabilitySnapshot>) -> bool {
        let available =
            match probe_with_timeout(self.sink.as_ref(), self.resource, self.timeout).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(resource = %self.resource, sink = self.sink.name(), error = %e, class = %e.class(), "Sink probe failed");
                    false
                }
            };
        self.store(guard, available);
        available
    }

    fn store(&self, guard: &mut Option<AvailabilitySnapshot>, available: bool) {
        let previous = guard.map(|s| s.available);
        *guard = Some(AvailabilitySnapshot {
            available,
            checked_at: Instant::now(),
            ttl: self.ttl,
        });

        match (previous, available) {
            (Some(false) | None, true) => {
                info!(resource = %self.resource, "Telemetry sink available");
            }
            (Some(true), false) => {
                warn!(resource = %self.resource, "Telemetry sink unavailable, buffering offline");
            }
            (None, false) => {
                info!(resource = %self.resource, "Telemetry sink unavailable at startup, buffering offline");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{FailureMode, MemorySink};

    fn probe(sink: Arc<MemorySink>, ttl: Duration) -> AvailabilityProbe {
        AvailabilityProbe::new(
            SinkResource::PerformanceMetrics,
            sink,
            ttl,
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cached_within_ttl() {
        let sink = Arc::new(MemorySink::new());
        let p = probe(sink.clone(), Duration::from_secs(60));

        assert!(p.is_available().await);
        sink.set_available(false);
        assert!(p.is_available().await, "cached value should be served");
        assert_eq!(sink.probe_calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!p.is_available().await, "expired cache should re-probe");
        assert_eq!(sink.probe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reprobe_ignores_cache() {
        let sink = Arc::new(MemorySink::new());
        let p = probe(sink.clone(), Duration::from_secs(60));

        sink.set_available(false);
        assert!(!p.is_available().await);
        sink.set_available(true);
        assert!(p.force_reprobe().await);
        assert_eq!(sink.probe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_unavailable() {
        let sink = Arc::new(MemorySink::new());
        sink.set_probe_delay(Duration::from_secs(10));
        let p = probe(sink, Duration::from_secs(60));
        assert!(!p.is_available().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_unavailable_backs_off_for_ttl() {
        let sink = Arc::new(MemorySink::new());
        let p = probe(sink.clone(), Duration::from_secs(30));

        p.mark_unavailable().await;
        assert!(!p.is_available().await);
        assert_eq!(sink.probe_calls(), 0, "no probe storm inside the TTL");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(p.is_available().await);
        assert_eq!(sink.probe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_probe_is_unavailable() {
        let sink = Arc::new(MemorySink::new());
        sink.set_failure(FailureMode::PermissionDenied);
        let p = probe(sink, Duration::from_secs(30));
        assert!(!p.force_reprobe().await);
        let snap = p.snapshot().await.unwrap();
        assert!(!snap.available);
        assert_eq!(snap.ttl, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_probe() {
        let sink = Arc::new(MemorySink::new());
        sink.set_probe_delay(Duration::from_millis(500));
        let p = Arc::new(probe(sink.clone(), Duration::from_secs(60)));

        let a = tokio::spawn({
            let p = p.clone();
            async move { p.is_available().await }
        });
        let b = tokio::spawn({
            let p = p.clone();
            async move { p.is_available().await }
        });
        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        assert_eq!(sink.probe_calls(), 1);
    }
}
