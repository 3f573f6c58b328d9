//! Execution and system-wide metrics.
//!
//! [`MonitorCounters`] keeps lifetime totals in atomics so they survive a
//! workflow being detached from the monitor. Per-run figures are returned as
//! [`WorkflowExecutionMetrics`] snapshots.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kind of counter being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// A workflow run began tracking
    WorkflowStarted,
    /// A run finished in `completed`
    WorkflowCompleted,
    /// A run finished in `failed` or `requires_human_review`
    WorkflowFailed,
    /// A run finished in `cancelled`
    WorkflowCancelled,
    /// A task finished successfully
    TaskCompleted,
    /// A task finished unsuccessfully
    TaskFailed,
    /// An extra attempt was made for a task
    TaskRetried,
    /// An alert was raised
    AlertRaised,
}

const COUNTER_KINDS: usize = 8;

/// Lifetime counters shared by every workflow the monitor has seen.
#[derive(Clone, Debug)]
pub struct MonitorCounters {
    inner: Arc<CountersInner>,
}

#[derive(Debug)]
struct CountersInner {
    counts: [AtomicU64; COUNTER_KINDS],
    /// Sum of execution times of completed workflows (nanoseconds)
    completed_time_ns: AtomicU64,
    /// Sum of task execution times (nanoseconds)
    task_time_ns: AtomicU64,
}

impl MonitorCounters {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CountersInner {
                counts: Default::default(),
                completed_time_ns: AtomicU64::new(0),
                task_time_ns: AtomicU64::new(0),
            }),
        }
    }

    /// Increments a counter.
    pub fn record(&self, kind: CounterKind) {
        self.inner.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n` to a counter.
    pub fn record_n(&self, kind: CounterKind, n: u64) {
        self.inner.counts[kind as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Records a completed workflow and its execution time.
    pub fn record_completed_workflow(&self, elapsed: Duration) {
        self.record(CounterKind::WorkflowCompleted);
        self.inner
            .completed_time_ns
            .fetch_add(saturating_nanos(elapsed), Ordering::Relaxed);
    }

    /// Records a finished task and its execution time.
    pub fn record_task(&self, succeeded: bool, elapsed: Duration) {
        self.record(if succeeded {
            CounterKind::TaskCompleted
        } else {
            CounterKind::TaskFailed
        });
        self.inner
            .task_time_ns
            .fetch_add(saturating_nanos(elapsed), Ordering::Relaxed);
    }

    /// Current value of a counter.
    pub fn count(&self, kind: CounterKind) -> u64 {
        self.inner.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Mean execution time of completed workflows.
    pub fn average_completed_time(&self) -> Duration {
        let completed = self.count(CounterKind::WorkflowCompleted);
        if completed == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.inner.completed_time_ns.load(Ordering::Relaxed) / completed)
    }

    /// Mean execution time of finished tasks.
    pub fn average_task_time(&self) -> Duration {
        let tasks = self.count(CounterKind::TaskCompleted) + self.count(CounterKind::TaskFailed);
        if tasks == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.inner.task_time_ns.load(Ordering::Relaxed) / tasks)
    }

    /// Failed workflows divided by all workflows started (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        let total = self.count(CounterKind::WorkflowStarted);
        if total == 0 {
            return 0.0;
        }
        self.count(CounterKind::WorkflowFailed) as f64 / total as f64
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        for count in &self.inner.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.inner.completed_time_ns.store(0, Ordering::Relaxed);
        self.inner.task_time_ns.store(0, Ordering::Relaxed);
    }
}

impl Default for MonitorCounters {
    fn default() -> Self {
        Self::new()
    }
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Aggregate figures for one workflow run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// Extra attempts beyond the first, summed over all tasks
    pub retries: u32,
    /// Errors observed, task failures included
    pub error_count: u32,
    #[serde(with = "conduct_core::duration_ms")]
    pub average_task_time: Duration,
    #[serde(with = "conduct_core::duration_ms")]
    pub total_execution_time: Duration,
    /// Handler-reported cache hits
    pub cache_hits: u64,
    /// Handler-reported cache misses
    pub cache_misses: u64,
    /// Times a ready task had to wait for resources
    pub resource_waits: u64,
}

impl WorkflowExecutionMetrics {
    /// Completed tasks over total tasks; 1.0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / self.total_tasks as f64
    }

    /// Cache hit rate (0.0 to 1.0).
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

/// Process-wide view over every workflow the monitor has seen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Runs currently tracked and not yet terminal
    pub active_workflows: usize,
    pub completed_workflows: u64,
    pub failed_workflows: u64,
    pub cancelled_workflows: u64,
    pub total_workflows: u64,
    /// Mean execution time of completed runs
    #[serde(with = "conduct_core::duration_ms")]
    pub average_execution_time: Duration,
    /// Failed runs over all runs
    pub error_rate: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub task_retries: u64,
    #[serde(with = "conduct_core::duration_ms")]
    pub average_task_time: Duration,
    pub alerts_raised: u64,
    /// Alerts not yet resolved
    pub active_alerts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_record() {
        let counters = MonitorCounters::new();
        counters.record(CounterKind::WorkflowStarted);
        counters.record(CounterKind::WorkflowStarted);
        counters.record_n(CounterKind::TaskRetried, 3);

        assert_eq!(counters.count(CounterKind::WorkflowStarted), 2);
        assert_eq!(counters.count(CounterKind::TaskRetried), 3);
        assert_eq!(counters.count(CounterKind::AlertRaised), 0);
    }

    #[test]
    fn test_average_completed_time() {
        let counters = MonitorCounters::new();
        counters.record_completed_workflow(Duration::from_millis(100));
        counters.record_completed_workflow(Duration::from_millis(300));
        assert_eq!(counters.average_completed_time(), Duration::from_millis(200));
    }

    #[test]
    fn test_error_rate() {
        let counters = MonitorCounters::new();
        assert_eq!(counters.error_rate(), 0.0);
        for _ in 0..4 {
            counters.record(CounterKind::WorkflowStarted);
        }
        counters.record(CounterKind::WorkflowFailed);
        assert!((counters.error_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters_shared_between_clones() {
        let counters = MonitorCounters::new();
        let clone = counters.clone();
        clone.record_task(true, Duration::from_millis(10));
        assert_eq!(counters.count(CounterKind::TaskCompleted), 1);
        assert_eq!(counters.average_task_time(), Duration::from_millis(10));

        counters.reset();
        assert_eq!(clone.count(CounterKind::TaskCompleted), 0);
    }

    #[test]
    fn test_execution_metrics_rates() {
        let metrics = WorkflowExecutionMetrics {
            total_tasks: 4,
            completed_tasks: 3,
            failed_tasks: 1,
            cache_hits: 1,
            cache_misses: 3,
            ..Default::default()
        };
        assert_eq!(metrics.success_rate(), 0.75);
        assert_eq!(metrics.cache_hit_rate(), 0.25);
        assert_eq!(WorkflowExecutionMetrics::default().success_rate(), 1.0);
    }
}
