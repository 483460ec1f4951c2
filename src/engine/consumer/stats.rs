use std::{fmt, time::Duration};

use parking_lot::RwLock;

use super::pool::WorkerResult;

/// Running totals over every message the pool has finished.
#[derive(Debug, Default)]
pub struct Stats {
    inner: RwLock<Totals>,
}

#[derive(Debug, Default)]
struct Totals {
    processed: u64,
    succeeded: u64,
    failed: u64,
    total_time: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_time: Duration,
}

impl Stats {
    pub fn record(&self, result: &WorkerResult) {
        let mut totals = self.inner.write();
        totals.processed += 1;
        totals.total_time += result.duration;
        if result.success {
            totals.succeeded += 1;
        } else {
            totals.failed += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let totals = self.inner.read();
        let avg_time = match u32::try_from(totals.processed) {
            Ok(0) => Duration::ZERO,
            Ok(n) => totals.total_time / n,
            Err(_) => Duration::from_secs_f64(
                totals.total_time.as_secs_f64() / totals.processed as f64,
            ),
        };
        StatsSnapshot {
            processed: totals.processed,
            succeeded: totals.succeeded,
            failed: totals.failed,
            avg_time,
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed: {}, succeeded: {}, failed: {}, avg time: {:?}",
            self.processed, self.succeeded, self.failed, self.avg_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool, millis: u64) -> WorkerResult {
        WorkerResult {
            message_id: "m".into(),
            worker_id: 0,
            success,
            error: (!success).then(|| "boom".to_string()),
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn empty_snapshot_has_zero_average() {
        assert_eq!(Stats::default().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn snapshot_aggregates_results() {
        let stats = Stats::default();
        stats.record(&result(true, 10));
        stats.record(&result(true, 20));
        stats.record(&result(false, 30));

        let snap = stats.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.avg_time, Duration::from_millis(20));

        // a snapshot is a copy, not a view
        stats.record(&result(true, 10));
        assert_eq!(snap.processed, 3);
    }
}
