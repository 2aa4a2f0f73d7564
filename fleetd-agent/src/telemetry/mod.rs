use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use fleetd_core::config::RetryConfig;
use fleetd_core::storage::MetricStorage;

mod sinks;
mod sources;

pub use sinks::{LocalFileSink, MetricSink, RemoteMetricsSink, encode_batch};
pub use sources::{MetricSource, SupervisorMetricsSource, SystemMetricsSource};

/// Source → buffer → batch → sink loop.
///
/// Samples are buffered through device storage first, then drained in
/// tier-sized batches to every sink. A failing sink leaves the batch
/// unsynced; the next flush attempt waits out an exponential backoff.
pub struct TelemetryPipeline {
    sources: Vec<Box<dyn MetricSource>>,
    sinks: Vec<Box<dyn MetricSink>>,
    storage: Arc<dyn MetricStorage>,
    batch_size: usize,
    sync_interval: Duration,
    retry: RetryConfig,
}

impl TelemetryPipeline {
    pub fn new(
        storage: Arc<dyn MetricStorage>,
        batch_size: usize,
        sync_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            sources: Vec::new(),
            sinks: Vec::new(),
            storage,
            batch_size: batch_size.max(1),
            sync_interval,
            retry,
        }
    }

    pub fn add_source(&mut self, source: Box<dyn MetricSource>) {
        self.sources.push(source);
    }

    pub fn add_sink(&mut self, sink: Box<dyn MetricSink>) {
        self.sinks.push(sink);
    }

    /// Run until the shutdown signal flips. Consumes the pipeline.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut backoff = Backoff::new(&self.retry);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Final best-effort flush before exiting
                    let _ = self.flush(&mut backoff).await;
                    break;
                }
                _ = ticker.tick() => {
                    self.collect().await;
                    self.flush(&mut backoff).await;
                }
            }
        }
        debug!("Telemetry pipeline stopped");
    }

    /// Ask every source for samples and buffer them.
    async fn collect(&self) {
        for source in &self.sources {
            match source.collect().await {
                Ok(metrics) => {
                    for metric in &metrics {
                        if let Err(err) = self.storage.store_metric(metric).await {
                            warn!("Buffering metric from {} failed: {}", source.name(), err);
                        }
                    }
                }
                Err(err) => warn!("Source {} failed to collect: {:#}", source.name(), err),
            }
        }
    }

    /// Drain one batch to all sinks, honoring the failure backoff.
    /// A zero-metric flush is a no-op.
    async fn flush(&self, backoff: &mut Backoff) {
        if self.sinks.is_empty() || !backoff.ready() {
            return;
        }

        let batch = match self.storage.unsynced_metrics(self.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!("Reading unsynced metrics failed: {}", err);
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        let metrics: Vec<_> = batch.iter().map(|stored| stored.metric.clone()).collect();
        let mut all_ok = true;
        for sink in &self.sinks {
            if let Err(err) = sink.handle(&metrics).await {
                warn!("Sink {} rejected batch of {}: {:#}", sink.name(), metrics.len(), err);
                all_ok = false;
            }
        }

        if all_ok {
            let ids: Vec<i64> = batch.iter().map(|stored| stored.id).collect();
            if let Err(err) = self.storage.mark_synced(&ids).await {
                warn!("Marking batch synced failed: {}", err);
            }
            backoff.reset();
        } else {
            backoff.bump();
        }
    }
}

/// Exponential backoff between failed flushes, capped at `max_backoff`.
struct Backoff {
    initial: Duration,
    factor: f64,
    cap: Duration,
    current: Option<Duration>,
    next_attempt: tokio::time::Instant,
}

impl Backoff {
    fn new(retry: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(retry.initial_backoff_ms.max(1)),
            factor: retry.backoff_multiplier.max(1.0),
            cap: Duration::from_secs(retry.max_backoff_secs.max(1)),
            current: None,
            next_attempt: tokio::time::Instant::now(),
        }
    }

    fn ready(&self) -> bool {
        tokio::time::Instant::now() >= self.next_attempt
    }

    fn reset(&mut self) {
        self.current = None;
        self.next_attempt = tokio::time::Instant::now();
    }

    fn bump(&mut self) {
        let next = match self.current {
            None => self.initial,
            Some(current) => current.mul_f64(self.factor).min(self.cap),
        };
        self.current = Some(next);
        self.next_attempt = tokio::time::Instant::now() + next;
    }
}
