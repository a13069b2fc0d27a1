//! Periodic flush timer

use rand::Rng;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Collector, StreamAdapter};

impl<A: StreamAdapter> Collector<A> {
    /// Spawn the flush timer: every `interval` plus a random share of
    /// `jitter`, sweep retention and flush.
    ///
    /// Cancelling `shutdown` stops new ticks. A flush already running is
    /// left to finish on its own task.
    pub fn start_periodic_flush(
        &self,
        interval: Duration,
        jitter: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let stream = self.stream();
        tokio::spawn(async move {
            info!(
                stream = %stream,
                interval_secs = interval.as_secs(),
                jitter_secs = jitter.as_secs(),
                "Flush scheduler started"
            );
            loop {
                let delay = interval + random_jitter(jitter);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                let swept = this.sweep_retention();
                let result = this.flush().await;
                debug!(stream = %stream, swept, %result, "Scheduled flush");
            }
            info!(stream = %stream, "Flush scheduler stopped");
        })
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
