//! Background progress monitor for long crawls.
//!
//! Workers bump shared atomic counters; a background task logs a snapshot of
//! them every interval so operators can follow a run without reading every
//! per-candidate log line.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::filters::StageName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub considered: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    /// Rejections per stage, in chain order.
    pub rejected: [usize; 5],
    pub accepted: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn rejected_total(&self) -> usize {
        self.fetch_failed + self.rejected.iter().sum::<usize>()
    }
}

/// Shared counters. Clones share state.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    /// Incremented by discovery for every candidate yielded.
    pub considered: Arc<AtomicUsize>,
    pub fetched: Arc<AtomicUsize>,
    pub fetch_failed: Arc<AtomicUsize>,
    rejected: Arc<[AtomicUsize; 5]>,
    pub accepted: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_index(stage: StageName) -> usize {
    StageName::ALL.iter().position(|s| *s == stage).unwrap_or(0)
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            considered: Arc::new(AtomicUsize::new(0)),
            fetched: Arc::new(AtomicUsize::new(0)),
            fetch_failed: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(Default::default()),
            accepted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn record_rejection(&self, stage: StageName) {
        self.rejected[stage_index(stage)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected_at(&self, stage: StageName) -> usize {
        self.rejected[stage_index(stage)].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        let mut rejected = [0usize; 5];
        for (slot, counter) in rejected.iter_mut().zip(self.rejected.iter()) {
            *slot = counter.load(Ordering::Relaxed);
        }
        ProgressSnapshot {
            considered: self.considered.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            fetch_failed: self.fetch_failed.load(Ordering::Relaxed),
            rejected,
            accepted: self.accepted.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

fn log_snapshot(snap: &ProgressSnapshot, budget: usize, message: &'static str) {
    let pct = if budget > 0 {
        (snap.considered as f64 / budget as f64 * 100.0).min(100.0)
    } else {
        0.0
    };
    let elapsed_secs = snap.elapsed.as_secs_f64();
    let considered_per_min = if elapsed_secs > 0.0 {
        snap.considered as f64 / elapsed_secs * 60.0
    } else {
        0.0
    };
    let [keyword, maturity, syntax, structural, outlier] = snap.rejected;

    tracing::info!(
        considered = snap.considered,
        budget,
        fetched = snap.fetched,
        fetch_failed = snap.fetch_failed,
        rejected_keyword = keyword,
        rejected_maturity = maturity,
        rejected_syntax = syntax,
        rejected_structural = structural,
        rejected_outlier = outlier,
        accepted = snap.accepted,
        progress_pct = format!("{pct:.1}%"),
        elapsed_secs = snap.elapsed.as_secs(),
        considered_per_min = format!("{considered_per_min:.1}"),
        "{}",
        message
    );
}

/// Periodic progress logger. [`ProgressMonitor::stop`] logs a final snapshot.
pub struct ProgressMonitor {
    counters: ProgressCounters,
    budget: usize,
    start: Instant,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// A zero `interval` disables periodic logging.
    pub fn start(counters: ProgressCounters, budget: usize, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let start = Instant::now();

        let handle = (!interval.is_zero()).then(|| {
            let flag = stop_flag.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if flag.load(Ordering::Relaxed) {
                        break;
                    }
                    log_snapshot(&counters.snapshot(start), budget, "Crawl progress");
                }
            })
        });

        Self {
            counters,
            budget,
            start,
            stop_flag,
            handle,
        }
    }

    pub async fn stop(mut self) -> ProgressSnapshot {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        let snap = self.counters.snapshot(self.start);
        log_snapshot(&snap, self.budget, "Crawl finished");
        snap
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let snap = ProgressCounters::new().snapshot(Instant::now());
        assert_eq!(snap.considered, 0);
        assert_eq!(snap.rejected, [0; 5]);
        assert_eq!(snap.rejected_total(), 0);
    }

    #[test]
    fn rejections_are_counted_per_stage() {
        let counters = ProgressCounters::new();
        counters.record_rejection(StageName::Maturity);
        counters.record_rejection(StageName::Maturity);
        counters.record_rejection(StageName::BehaviorOutlier);
        counters.fetch_failed.fetch_add(1, Ordering::Relaxed);

        assert_eq!(counters.rejected_at(StageName::Maturity), 2);
        let snap = counters.snapshot(Instant::now());
        assert_eq!(snap.rejected, [0, 2, 0, 0, 1]);
        assert_eq!(snap.rejected_total(), 4);
    }

    #[test]
    fn clones_share_state() {
        let counters = ProgressCounters::new();
        let clone = counters.clone();
        counters.accepted.fetch_add(1, Ordering::Relaxed);
        clone.record_rejection(StageName::Structural);
        assert_eq!(clone.accepted.load(Ordering::Relaxed), 1);
        assert_eq!(counters.rejected_at(StageName::Structural), 1);
    }

    #[tokio::test]
    async fn monitor_start_stop() {
        let counters = ProgressCounters::new();
        counters.considered.fetch_add(3, Ordering::Relaxed);
        let monitor = ProgressMonitor::start(counters, 10, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = monitor.stop().await;
        assert_eq!(snap.considered, 3);
    }

    #[tokio::test]
    async fn disabled_monitor_still_reports_on_stop() {
        let counters = ProgressCounters::new();
        let monitor = ProgressMonitor::start(counters.clone(), 10, Duration::ZERO);
        counters.accepted.fetch_add(2, Ordering::Relaxed);
        assert_eq!(monitor.stop().await.accepted, 2);
    }
}
