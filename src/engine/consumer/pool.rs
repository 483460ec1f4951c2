use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use hashbrown::HashSet;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{handler::MessageHandler, stats::Stats};
use crate::{engine::queue::TransportMessage, Error, Result};

/// What became of one dispatched message.
#[derive(Clone, Debug)]
pub struct WorkerResult {
    pub message_id: String,
    pub worker_id: usize,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Picks the worker for a message. Must be a pure function of the message's
/// partition key, or same-checkbox ordering is lost.
pub type Selector = Arc<dyn Fn(&TransportMessage) -> usize + Send + Sync>;

pub fn partition_selector(workers: usize) -> Selector {
    Arc::new(move |message: &TransportMessage| {
        partition_index(&message.partition_key, workers)
    })
}

pub fn partition_index(partition_key: &str, workers: usize) -> usize {
    let hash = blake3::hash(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % workers.max(1) as u64) as usize
}

struct Job {
    batch: u64,
    message: TransportMessage,
    done: mpsc::Sender<WorkerResult>,
}

/// A fixed set of long-lived workers, each draining its own bounded inbox one
/// job at a time.
pub struct WorkerPool {
    inboxes: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    selector: Selector,
    stats: Arc<Stats>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        queue_depth: usize,
        handler: Arc<dyn MessageHandler>,
        selector: Selector,
    ) -> Self {
        let stats = Arc::new(Stats::default());
        let workers = workers.max(1);
        let mut inboxes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            inboxes.push(tx);
            handles.push(tokio::spawn(
                run_worker(worker_id, rx, handler.clone(), stats.clone())
                    .instrument(debug_span!("worker", worker_id)),
            ));
        }
        debug!(workers, queue_depth, "worker pool started");
        Self {
            inboxes,
            handles,
            selector,
            stats,
        }
    }

    pub fn workers(&self) -> usize {
        self.inboxes.len()
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Hands `message` to its worker. Exactly one [`WorkerResult`] will later
    /// arrive on `done` for it. Waits while the worker's inbox is full.
    ///
    /// Jobs dispatched under the same `batch` id form one batch: once a job
    /// fails, the worker fails every later job of that batch sharing its
    /// partition key without running it.
    pub async fn dispatch(
        &self,
        batch: u64,
        message: TransportMessage,
        done: mpsc::Sender<WorkerResult>,
    ) -> Result<usize> {
        let worker_id = (self.selector)(&message) % self.inboxes.len();
        self.inboxes[worker_id]
            .send(Job {
                batch,
                message,
                done,
            })
            .await
            .map_err(|_| Error::Internal(format!("worker {worker_id} has stopped")))?;
        Ok(worker_id)
    }

    /// Closes every inbox and waits for the workers to finish what they
    /// already hold.
    pub async fn shutdown(self) {
        info!("shutting down worker pool");
        drop(self.inboxes);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool shutdown complete");
    }
}

async fn run_worker(
    worker_id: usize,
    mut inbox: mpsc::Receiver<Job>,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<Stats>,
) {
    debug!("worker started");
    let mut current_batch = None;
    // partitions with a failed job in the current batch
    let mut blocked: HashSet<String> = HashSet::new();

    while let Some(Job {
        batch,
        message,
        done,
    }) = inbox.recv().await
    {
        if current_batch != Some(batch) {
            current_batch = Some(batch);
            blocked.clear();
        }

        let started = Instant::now();
        let (success, error) = if blocked.contains(&message.partition_key) {
            (
                false,
                Some(format!(
                    "skipped, an earlier message for {} failed in this batch",
                    message.partition_key
                )),
            )
        } else {
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(_)) => (true, None),
                Ok(Err(e)) => (false, Some(e.to_string())),
                Err(panic) => (
                    false,
                    Some(format!("handler panicked: {}", panic_message(&*panic))),
                ),
            }
        };
        if !success {
            blocked.insert(message.partition_key.clone());
        }
        let result = WorkerResult {
            message_id: message.message_id,
            worker_id,
            success,
            error,
            duration: started.elapsed(),
        };

        stats.record(&result);
        match &result.error {
            None => debug!(
                message_id = %result.message_id,
                duration = ?result.duration,
                "message succeeded"
            ),
            Some(error) => warn!(
                message_id = %result.message_id,
                %error,
                "message failed"
            ),
        }
        if done.send(result).await.is_err() {
            debug!("result dropped, cycle no longer collecting");
        }
    }
    debug!("worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use hashbrown::HashMap;
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::store::UpdateOutcome;

    fn message(id: &str, key: &str) -> TransportMessage {
        TransportMessage {
            message_id: id.to_string(),
            receipt_handle: format!("rh-{id}"),
            body: String::new(),
            partition_key: key.to_string(),
            sequence_number: String::new(),
            attributes: HashMap::new(),
        }
    }

    /// Records which message ids it ran, in order. Ids starting with `fail`
    /// return an error and `panic` panics.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: &TransportMessage) -> Result<UpdateOutcome> {
            if message.message_id == "panic" {
                panic!("bad message");
            }
            // yield so that jobs on other workers interleave
            tokio::task::yield_now().await;
            self.seen.lock().push(message.message_id.clone());
            if message.message_id.starts_with("fail") {
                return Err(Error::Internal("store unavailable".into()));
            }
            Ok(UpdateOutcome::Applied)
        }
    }

    #[test]
    fn selector_is_stable_and_in_range() {
        for workers in [1, 3, 8] {
            for n in 0..1000 {
                let key = format!("checkbox-{n}");
                let idx = partition_index(&key, workers);
                assert!(idx < workers);
                assert_eq!(idx, partition_index(&key, workers));
            }
        }
    }

    #[tokio::test]
    async fn same_partition_keeps_arrival_order() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::start(4, 16, recorder.clone(), partition_selector(4));
        let (tx, mut rx) = mpsc::channel(64);

        let mut expected = Vec::new();
        for i in 0..20 {
            let id = format!("same-{i}");
            expected.push(id.clone());
            pool.dispatch(1, message(&id, "checkbox-5"), tx.clone())
                .await
                .unwrap();
            let other = message(&format!("other-{i}"), &format!("checkbox-{i}"));
            pool.dispatch(1, other, tx.clone()).await.unwrap();
        }
        for _ in 0..40 {
            assert!(rx.recv().await.unwrap().success);
        }

        let seen: Vec<String> = recorder
            .seen
            .lock()
            .iter()
            .filter(|id| id.starts_with("same-"))
            .cloned()
            .collect();
        assert_eq!(seen, expected);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failure_skips_rest_of_partition_in_batch() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::start(1, 16, recorder.clone(), partition_selector(1));
        let (tx, mut rx) = mpsc::channel(16);

        for (id, key) in [
            ("fail-a1", "checkbox-1"),
            ("b1", "checkbox-2"),
            ("a2", "checkbox-1"),
            ("b2", "checkbox-2"),
        ] {
            pool.dispatch(1, message(id, key), tx.clone()).await.unwrap();
        }
        let mut results = HashMap::new();
        for _ in 0..4 {
            let result = rx.recv().await.unwrap();
            results.insert(result.message_id.clone(), result);
        }
        assert!(!results["fail-a1"].success);
        assert!(!results["a2"].success);
        assert!(results["a2"].error.as_deref().unwrap().contains("checkbox-1"));
        assert!(results["b1"].success && results["b2"].success);
        assert_eq!(*recorder.seen.lock(), ["fail-a1", "b1", "b2"]);

        // a new batch starts unblocked
        pool.dispatch(2, message("a2", "checkbox-1"), tx).await.unwrap();
        assert!(rx.recv().await.unwrap().success);
        assert_eq!(recorder.seen.lock().last().map(String::as_str), Some("a2"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panic_becomes_failed_result() {
        let handler = Arc::new(Recorder::default());
        let pool = WorkerPool::start(2, 4, handler, partition_selector(2));
        let stats = pool.stats();
        let (tx, mut rx) = mpsc::channel(4);

        pool.dispatch(1, message("panic", "checkbox-1"), tx.clone())
            .await
            .unwrap();
        let result = rx.recv().await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("bad message"));

        // the worker survives its panic
        pool.dispatch(2, message("fine", "checkbox-1"), tx).await.unwrap();
        assert!(rx.recv().await.unwrap().success);

        let snap = stats.snapshot();
        assert_eq!((snap.processed, snap.succeeded, snap.failed), (2, 1, 1));
        pool.shutdown().await;
    }
}
