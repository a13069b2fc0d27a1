//! Telemetry Hub — the three stream collectors wired from configuration
//!
//! Metrics and alerts land in the same sink resource and share one
//! availability probe; crash reports have their own probe and may use a
//! separate sink client.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::BoundedBuffer;
use crate::collector::{
    AlertsAdapter, Collector, CollectorStats, InitHandle, MetricsAdapter, ReportsAdapter,
    StreamAdapter,
};
use crate::config::{SyncConfig, TelemetryConfig};
use crate::probe::AvailabilityProbe;
use crate::sink::TelemetrySink;
use crate::storage::BlobStore;
use crate::sync::SyncSettings;
use crate::types::{FlushResult, SinkResource, StreamType};

/// Initialization handles for all three streams
#[derive(Debug)]
pub struct HubInitHandle {
    pub metrics: InitHandle,
    pub alerts: InitHandle,
    pub reports: InitHandle,
}

impl HubInitHandle {
    pub fn is_finished(&self) -> bool {
        self.metrics.is_finished() && self.alerts.is_finished() && self.reports.is_finished()
    }

    pub async fn wait(self) {
        tokio::join!(self.metrics.wait(), self.alerts.wait(), self.reports.wait());
    }
}

/// All telemetry streams of one application
pub struct TelemetryHub {
    pub metrics: Collector<MetricsAdapter>,
    pub alerts: Collector<AlertsAdapter>,
    pub reports: Collector<ReportsAdapter>,
    sync: SyncConfig,
    shutdown: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryHub {
    pub fn new(
        config: &TelemetryConfig,
        store: Arc<dyn BlobStore>,
        performance_sink: Arc<dyn TelemetrySink>,
        crash_sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let settings = SyncSettings::from_config(&config.sync);
        let performance_probe = Arc::new(AvailabilityProbe::new(
            SinkResource::PerformanceMetrics,
            Arc::clone(&performance_sink),
            config.probe.ttl(),
            config.probe.timeout(),
        ));
        let crash_probe = Arc::new(AvailabilityProbe::new(
            SinkResource::CrashReports,
            Arc::clone(&crash_sink),
            config.probe.ttl(),
            config.probe.timeout(),
        ));

        let build = |stream: StreamType| {
            BoundedBuffer::open(
                stream,
                config.stream(stream).limits(),
                config.sync.purge_fraction,
                Arc::clone(&store),
            )
        };

        info!(
            store = store.backend_name(),
            performance_sink = performance_sink.name(),
            crash_sink = crash_sink.name(),
            "Telemetry hub configured"
        );

        Self {
            metrics: Collector::new(
                MetricsAdapter,
                build(StreamType::Metric),
                Arc::clone(&performance_sink),
                Arc::clone(&performance_probe),
                settings,
            ),
            alerts: Collector::new(
                AlertsAdapter,
                build(StreamType::Alert),
                performance_sink,
                performance_probe,
                settings,
            ),
            reports: Collector::new(
                ReportsAdapter::default(),
                build(StreamType::Report),
                crash_sink,
                crash_probe,
                settings,
            ),
            sync: config.sync.clone(),
            shutdown: CancellationToken::new(),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Start all three collectors. Returns immediately.
    pub fn initialize(&self) -> HubInitHandle {
        HubInitHandle {
            metrics: self.metrics.initialize(),
            alerts: self.alerts.initialize(),
            reports: self.reports.initialize(),
        }
    }

    /// Flush every stream concurrently
    pub async fn flush_all(&self) -> Vec<(StreamType, FlushResult)> {
        let (m, a, r) = tokio::join!(
            self.metrics.flush(),
            self.alerts.flush(),
            self.reports.flush()
        );
        vec![
            (StreamType::Metric, m),
            (StreamType::Alert, a),
            (StreamType::Report, r),
        ]
    }

    /// Retention sweep on every stream. Returns the number of entries removed.
    pub fn sweep_retention(&self) -> usize {
        self.metrics.sweep_retention() + self.alerts.sweep_retention() + self.reports.sweep_retention()
    }

    /// Start one flush timer per stream (idempotent)
    pub fn start_schedulers(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if !timers.is_empty() {
            return;
        }
        let interval = self.sync.interval();
        let jitter = self.sync.jitter();
        timers.push(spawn_timer(&self.metrics, interval, jitter, &self.shutdown));
        timers.push(spawn_timer(&self.alerts, interval, jitter, &self.shutdown));
        timers.push(spawn_timer(&self.reports, interval, jitter, &self.shutdown));
    }

    /// Stop the flush timers. Buffered telemetry stays on disk.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let timers: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for timer in timers {
            if let Err(e) = timer.await {
                warn!(error = %e, "Flush timer ended abnormally");
            }
        }
        info!("Telemetry hub stopped");
    }

    pub fn stats(&self) -> Vec<CollectorStats> {
        vec![self.metrics.stats(), self.alerts.stats(), self.reports.stats()]
    }

    /// The buffer behind `stream`
    pub fn buffer(&self, stream: StreamType) -> &BoundedBuffer {
        match stream {
            StreamType::Metric => self.metrics.buffer(),
            StreamType::Alert => self.alerts.buffer(),
            StreamType::Report => self.reports.buffer(),
        }
    }
}

fn spawn_timer<A: StreamAdapter>(
    collector: &Collector<A>,
    interval: std::time::Duration,
    jitter: std::time::Duration,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    collector.start_periodic_flush(interval, jitter, shutdown.child_token())
}
