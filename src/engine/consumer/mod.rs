//! The queue consumer: one poll loop feeding a partitioned worker pool.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::{Config, ConsumerConfig},
    telemetry,
};

use self::{
    handler::MessageHandler,
    pool::{partition_selector, Selector, WorkerPool},
    stats::{Stats, StatsSnapshot},
};
use super::queue::{CheckboxQueue, TransportMessage};

pub mod handler;
pub mod pool;
pub mod stats;

/// Sleep between cycles: a multiple of how long the last cycle took, never
/// less than `min_sleep`. A slow store stretches the gap on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min_sleep: Duration,
    pub multiplier: u32,
}

impl Backoff {
    pub fn delay(&self, runtime: Duration) -> Duration {
        runtime.saturating_mul(self.multiplier).max(self.min_sleep)
    }
}

impl From<&ConsumerConfig> for Backoff {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            min_sleep: config.min_sleep(),
            multiplier: config.backoff_multiplier,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleStatus {
    /// Nothing was received.
    Idle,
    /// Every message in the batch was applied.
    Completed,
    /// The receive failed, the batch was refused, or some messages failed.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub status: CycleStatus,
    pub processed: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn failed(reason: String, duration: Duration) -> Self {
        Self {
            status: CycleStatus::Failed(reason),
            processed: 0,
            failed: 0,
            duration,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, CycleStatus::Failed(_))
    }
}

pub struct Consumer {
    queue: CheckboxQueue,
    pool: WorkerPool,
    batch_size: usize,
    batch_ceiling: usize,
    backoff: Backoff,
    stats_interval: Duration,
    next_batch: AtomicU64,
}

impl Consumer {
    /// Starts `consumer.workers` workers routed by partition key.
    pub fn new(
        queue: CheckboxQueue,
        handler: Arc<dyn MessageHandler>,
        config: &Config,
    ) -> Self {
        let workers = config.consumer.workers;
        Self::with_selector(queue, handler, partition_selector(workers), config)
    }

    pub fn with_selector(
        queue: CheckboxQueue,
        handler: Arc<dyn MessageHandler>,
        selector: Selector,
        config: &Config,
    ) -> Self {
        let pool = WorkerPool::start(
            config.consumer.workers,
            config.consumer.worker_queue_depth,
            handler,
            selector,
        );
        Self {
            queue,
            pool,
            batch_size: config.queue.batch_size,
            batch_ceiling: config.consumer.batch_ceiling,
            backoff: Backoff::from(&config.consumer),
            stats_interval: config.consumer.stats_interval(),
            next_batch: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.pool.stats()
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// One receive followed by [`Consumer::process_batch`].
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        match self.queue.receive(self.batch_size).await {
            Ok(messages) => self.process_batch(messages, started).await,
            Err(e) => {
                error!(error = %e, "failed to pull messages from checkbox action queue");
                CycleReport::failed(e.to_string(), started.elapsed())
            }
        }
    }

    /// Fans `messages` out to the pool and waits for every one of them.
    /// After a failure, later messages of the same partition in this batch
    /// are failed unrun, so they come back behind the one that failed.
    ///
    /// A batch above the ceiling is refused whole: nothing is dispatched and
    /// the messages come back once their leases lapse.
    pub async fn process_batch(
        &self,
        messages: Vec<TransportMessage>,
        started: Instant,
    ) -> CycleReport {
        if messages.is_empty() {
            return CycleReport {
                status: CycleStatus::Idle,
                processed: 0,
                failed: 0,
                duration: started.elapsed(),
            };
        }
        if messages.len() > self.batch_ceiling {
            error!(
                received = messages.len(),
                ceiling = self.batch_ceiling,
                "queue consumer received too many messages, refusing batch"
            );
            return CycleReport::failed(
                format!(
                    "batch of {} exceeds ceiling {}",
                    messages.len(),
                    self.batch_ceiling
                ),
                started.elapsed(),
            );
        }

        let batch = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let (done_tx, mut done_rx) = mpsc::channel(messages.len());
        let mut dispatched = 0;
        let mut failed = 0;
        for message in messages {
            let message_id = message.message_id.clone();
            match self.pool.dispatch(batch, message, done_tx.clone()).await {
                Ok(worker_id) => {
                    debug!(%message_id, worker_id, "dispatched");
                    dispatched += 1;
                }
                Err(e) => {
                    warn!(%message_id, error = %e, "dispatch failed");
                    failed += 1;
                }
            }
        }
        drop(done_tx);

        let mut processed = 0;
        let mut collected = 0;
        while collected < dispatched {
            let Some(result) = done_rx.recv().await else {
                // every outstanding job was dropped without reporting
                failed += dispatched - collected;
                break;
            };
            collected += 1;
            if result.success {
                processed += 1;
            } else {
                failed += 1;
            }
        }

        let duration = started.elapsed();
        let status = if failed == 0 {
            CycleStatus::Completed
        } else {
            CycleStatus::Failed(format!("{failed} messages failed"))
        };
        CycleReport {
            status,
            processed,
            failed,
            duration,
        }
    }

    /// Polls until `shutdown` flips, then drains the pool.
    ///
    /// Shutdown interrupts a pending receive or backoff sleep but never a
    /// batch in progress. Returns the final statistics.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> StatsSnapshot {
        let reporter = spawn_stats_reporter(
            self.pool.stats(),
            self.stats_interval,
            shutdown.clone(),
        );

        async {
            while !*shutdown.borrow() {
                let started = Instant::now();
                let received = tokio::select! {
                    received = self.queue.receive(self.batch_size) => received,
                    _ = shutdown_signal(&mut shutdown) => break,
                };
                let report = match received {
                    Ok(messages) => self.process_batch(messages, started).await,
                    Err(e) => {
                        error!(error = %e, "failed to pull messages from checkbox action queue");
                        CycleReport::failed(e.to_string(), started.elapsed())
                    }
                };
                info!(
                    processed = report.processed,
                    failed = report.failed,
                    errors = report.is_failure(),
                    "processed {} messages in {:?}",
                    report.processed,
                    report.duration
                );

                let delay = self.backoff.delay(report.duration);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_signal(&mut shutdown) => break,
                }
            }
        }
        .instrument(info_span!("consumer"))
        .await;

        info!("consumer shutting down");
        let stats = self.pool.stats();
        self.pool.shutdown().await;
        telemetry::join_logged("stats reporter", reporter).await;
        stats.snapshot()
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Logs a snapshot every `interval`, and a last one at shutdown.
pub fn spawn_stats_reporter(
    stats: Arc<Stats>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => info!(stats = %stats.snapshot(), "consumer stats"),
                _ = shutdown_signal(&mut shutdown) => break,
            }
        }
        info!(stats = %stats.snapshot(), "final consumer stats");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_scales_with_runtime() {
        let backoff = Backoff {
            min_sleep: Duration::from_secs(5),
            multiplier: 5,
        };
        assert_eq!(backoff.delay(Duration::ZERO), Duration::from_secs(5));
        assert_eq!(backoff.delay(Duration::from_millis(900)), Duration::from_secs(5));
        assert_eq!(backoff.delay(Duration::from_secs(2)), Duration::from_secs(10));
        assert_eq!(backoff.delay(Duration::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn shutdown_signal_sees_earlier_flip() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        shutdown_signal(&mut rx).await;
    }

    #[tokio::test]
    async fn shutdown_signal_returns_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_signal(&mut rx).await;
    }
}
