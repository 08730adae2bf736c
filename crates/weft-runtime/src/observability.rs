//! Scheduler metrics.
//!
//! Lock-free counters updated on the dispatch path with relaxed atomics;
//! [`MetricsCollector::snapshot`] produces a serializable view for logs or
//! dashboards. Counters accumulate across runs until
//! [`MetricsCollector::reset`].

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters maintained by the scheduler.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    tasks_executed: AtomicUsize,
    tasks_failed: AtomicUsize,
    tasks_rescheduled: AtomicUsize,
    side_work_executed: AtomicUsize,
    values_published: AtomicUsize,
    in_flight: AtomicUsize,
    max_parallelism: AtomicUsize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_dispatch(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        let mut max = self.max_parallelism.load(Ordering::Relaxed);
        while current > max {
            match self.max_parallelism.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => max = actual,
            }
        }
    }

    #[inline]
    pub(crate) fn record_completion(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reschedule(&self) {
        self.tasks_rescheduled.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_side_work(&self) {
        self.side_work_executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_publish(&self) {
        self.values_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Tasks currently being executed by workers.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Capture the counters as a plain value.
    pub fn snapshot(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_rescheduled: self.tasks_rescheduled.load(Ordering::Relaxed),
            side_work_executed: self.side_work_executed.load(Ordering::Relaxed),
            values_published: self.values_published.load(Ordering::Relaxed),
            max_parallelism: self.max_parallelism.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.tasks_executed.store(0, Ordering::Relaxed);
        self.tasks_failed.store(0, Ordering::Relaxed);
        self.tasks_rescheduled.store(0, Ordering::Relaxed);
        self.side_work_executed.store(0, Ordering::Relaxed);
        self.values_published.store(0, Ordering::Relaxed);
        self.max_parallelism.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time metrics view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Task invocations that completed successfully.
    pub tasks_executed: usize,
    /// Task invocations that failed or stopped themselves.
    pub tasks_failed: usize,
    /// Invocations that asked to run again.
    pub tasks_rescheduled: usize,
    /// Side-work items executed outside the DAG.
    pub side_work_executed: usize,
    /// Values staged into the value store.
    pub values_published: usize,
    /// Highest number of concurrently running tasks observed.
    pub max_parallelism: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = MetricsCollector::new();
        m.record_dispatch();
        m.record_dispatch();
        assert_eq!(m.in_flight(), 2);
        m.record_completion();
        m.record_failure();
        m.record_side_work();
        m.record_publish();

        let snap = m.snapshot();
        assert_eq!(snap.tasks_executed, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.side_work_executed, 1);
        assert_eq!(snap.values_published, 1);
        assert_eq!(snap.max_parallelism, 2);
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn test_reset_zeroes() {
        let m = MetricsCollector::new();
        m.record_dispatch();
        m.record_completion();
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.tasks_executed, 0);
        assert_eq!(snap.max_parallelism, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = MetricsCollector::new();
        m.record_dispatch();
        m.record_completion();
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"tasks_executed\":1"));
        let back: SchedulerMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m.snapshot());
    }
}
