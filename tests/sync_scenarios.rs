//! Sync Integration Tests
//!
//! End-to-end record → buffer → flush flows through the public collector and
//! hub APIs against the scriptable in-memory sink.

use std::sync::Arc;
use std::time::Duration;

use telemetry_sync::config::TelemetryConfig;
use telemetry_sync::{
    AvailabilityProbe, BoundedBuffer, Collector, CrashReport, Credentials, FailureMode,
    MemorySink, MemoryStore, MetricsAdapter, PerformanceMetric, RecordOutcome, ReportsAdapter,
    SinkError, SinkResource, StreamState, StreamType, SyncSettings, TelemetryHub, TelemetrySink,
};

fn metrics_collector(
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
    settings: SyncSettings,
) -> Collector<MetricsAdapter> {
    let config = TelemetryConfig::default();
    let buffer = BoundedBuffer::open(
        StreamType::Metric,
        config.stream(StreamType::Metric).limits(),
        settings.purge_fraction,
        store,
    );
    let probe = Arc::new(AvailabilityProbe::new(
        SinkResource::PerformanceMetrics,
        sink.clone(),
        config.probe.ttl(),
        config.probe.timeout(),
    ));
    Collector::new(MetricsAdapter, buffer, sink, probe, settings)
}

async fn buffer_offline(c: &Collector<MetricsAdapter>, sink: &MemorySink, n: usize) {
    sink.set_available(false);
    c.probe().force_reprobe().await;
    for i in 0..n {
        let outcome = c
            .record_now(PerformanceMetric::new("api_latency", i as f64, "ms"))
            .await;
        assert_eq!(outcome, RecordOutcome::Buffered);
    }
    sink.set_available(true);
}

#[tokio::test]
async fn oversize_rejection_purges_then_next_flush_drains() {
    let sink = Arc::new(MemorySink::new());
    let c = metrics_collector(Arc::new(MemoryStore::new()), sink.clone(), SyncSettings::default());
    c.initialize().wait().await;
    buffer_offline(&c, &sink, 50).await;

    sink.set_failure(FailureMode::PayloadTooLarge);
    let first = c.flush().await;
    assert!(first.purged_for_oversize);
    assert!(first.failed > 0);
    assert!(c.buffer().len() <= 25);
    let left = c.buffer().len();

    sink.set_failure(FailureMode::None);
    let second = c.flush().await;
    assert!(second.is_clean());
    assert_eq!(second.succeeded, left);
    assert!(c.buffer().is_empty());
    assert_eq!(sink.stored(SinkResource::PerformanceMetrics).len(), left);
    assert_eq!(c.stats().oversize_purges, 1);
}

#[tokio::test]
async fn flushed_entries_are_never_sent_twice() {
    let sink = Arc::new(MemorySink::new());
    let c = metrics_collector(Arc::new(MemoryStore::new()), sink.clone(), SyncSettings::default());
    c.initialize().wait().await;
    buffer_offline(&c, &sink, 30).await;

    sink.set_failure(FailureMode::PartialAccept(10));
    c.flush().await;
    sink.set_failure(FailureMode::None);
    c.flush().await;
    c.flush().await;

    let stored = sink.stored(SinkResource::PerformanceMetrics);
    assert_eq!(stored.len(), 30);
    let mut ids: Vec<_> = stored.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 30, "an entry was delivered twice");
}

#[tokio::test(start_paused = true)]
async fn concurrent_flushes_share_one_network_batch() {
    let sink = Arc::new(MemorySink::new());
    let c = metrics_collector(Arc::new(MemoryStore::new()), sink.clone(), SyncSettings::default());
    c.initialize().wait().await;
    buffer_offline(&c, &sink, 20).await;
    sink.set_insert_delay(Duration::from_millis(800));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let c = c.clone();
            tokio::spawn(async move { c.flush().await })
        })
        .collect();
    let mut results = Vec::new();
    for h in handles {
        results.push(h.await.unwrap());
    }

    assert_eq!(sink.insert_calls(), 1);
    assert!(results.iter().all(|r| *r == results[0]));
    assert_eq!(results[0].succeeded, 20);
    assert!(c.buffer().is_empty());
}

#[tokio::test(start_paused = true)]
async fn initialize_returns_before_probe_resolves() {
    let sink = Arc::new(MemorySink::new());
    sink.set_probe_delay(Duration::from_secs(4));
    let c = metrics_collector(Arc::new(MemoryStore::new()), sink.clone(), SyncSettings::default());

    let started = tokio::time::Instant::now();
    let handle = c.initialize();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(!handle.is_finished());
    assert_eq!(c.state(), StreamState::Initializing);

    // Events recorded during initialization are kept, not dropped
    let early = tokio::spawn({
        let c = c.clone();
        async move { c.record_now(PerformanceMetric::new("cold_start", 1800.0, "ms")).await }
    });

    assert_eq!(handle.wait().await, StreamState::Ready { available: true });
    assert_ne!(early.await.unwrap(), RecordOutcome::Dropped);
}

#[tokio::test]
async fn restart_reconciles_buffer_from_previous_session() {
    let store = Arc::new(MemoryStore::new());
    let perf = Arc::new(MemorySink::new());
    let crash = Arc::new(MemorySink::new());
    perf.set_available(false);
    crash.set_available(false);

    {
        let hub = TelemetryHub::new(&TelemetryConfig::default(), store.clone(), perf.clone(), crash.clone());
        hub.initialize().wait().await;
        for i in 0..4 {
            hub.metrics
                .record_now(PerformanceMetric::new("frame_time", f64::from(i), "ms"))
                .await;
        }
        hub.reports
            .record_now(CrashReport::new("OutOfMemory", "allocation failed", true))
            .await;
    }

    perf.set_available(true);
    crash.set_available(true);
    let hub = TelemetryHub::new(&TelemetryConfig::default(), store, perf.clone(), crash.clone());
    assert_eq!(hub.buffer(StreamType::Metric).len(), 4);
    hub.initialize().wait().await;

    assert_eq!(perf.stored(SinkResource::PerformanceMetrics).len(), 4);
    assert_eq!(crash.stored(SinkResource::CrashReports).len(), 1);
    assert!(hub.stats().iter().all(|s| s.buffer.count == 0));
}

#[tokio::test]
async fn anonymous_insert_but_authenticated_read() {
    let sink = Arc::new(MemorySink::new().with_read_token("user-session"));
    let config = TelemetryConfig::default();
    let buffer = BoundedBuffer::open(
        StreamType::Report,
        config.stream(StreamType::Report).limits(),
        0.5,
        Arc::new(MemoryStore::new()),
    );
    let probe = Arc::new(AvailabilityProbe::new(
        SinkResource::CrashReports,
        sink.clone(),
        config.probe.ttl(),
        config.probe.timeout(),
    ));
    let reports = Collector::new(ReportsAdapter::default(), buffer, sink.clone(), probe, SyncSettings::default());
    reports.initialize().wait().await;

    let outcome = reports
        .record_now(CrashReport::new("TypeError", "cannot read property 'id'", false).with_stack("at render"))
        .await;
    assert_eq!(outcome, RecordOutcome::SentDirect);

    let anonymous = sink.read_recent(SinkResource::CrashReports, 10, None).await;
    assert!(matches!(anonymous, Err(SinkError::PermissionDenied(_))));

    let creds = Credentials {
        bearer_token: "user-session".to_string(),
    };
    let read = sink
        .read_recent(SinkResource::CrashReports, 10, Some(&creds))
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].stream, StreamType::Report);
    assert_eq!(read[0].payload["error_type"], "TypeError");
}

#[tokio::test(start_paused = true)]
async fn slow_sink_times_out_and_keeps_entries() {
    let sink = Arc::new(MemorySink::new());
    let settings = SyncSettings {
        timeout: Duration::from_secs(2),
        ..SyncSettings::default()
    };
    let c = metrics_collector(Arc::new(MemoryStore::new()), sink.clone(), settings);
    c.initialize().wait().await;

    sink.set_insert_delay(Duration::from_secs(10));
    // Direct write times out, the entry falls back to the buffer
    let outcome = c
        .record_now(PerformanceMetric::new("tti", 2100.0, "ms"))
        .await;
    assert_eq!(outcome, RecordOutcome::Buffered);

    let result = c.flush().await;
    assert_eq!(result.failed, 1);
    assert_eq!(c.buffer().len(), 1);

    sink.set_insert_delay(Duration::ZERO);
    assert!(c.flush().await.is_clean());
    assert!(c.buffer().is_empty());
}
