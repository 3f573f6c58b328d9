//! Task definitions, dependency edges and retry policies.

use crate::error::{CoreError, Result};
use crate::types::{TaskId, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-attempt task timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Kind of ordering constraint carried by a dependency edge.
///
/// Only `FinishToStart` participates in resolution and scheduling; the other
/// kinds are accepted in definitions and ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Dependent starts after the prerequisite finishes
    #[default]
    FinishToStart,
    StartToStart,
    FinishToFinish,
    StartToFinish,
}

/// Directed dependency edge between two tasks of one workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Task that waits
    pub task: TaskId,
    /// Task that must finish first
    pub depends_on: TaskId,
    /// Edge type
    #[serde(default)]
    pub kind: DependencyKind,
}

impl Dependency {
    /// Creates a finish-to-start edge: `task` runs after `depends_on`.
    pub fn finish_to_start(task: impl Into<TaskId>, depends_on: impl Into<TaskId>) -> Self {
        Self {
            task: task.into(),
            depends_on: depends_on.into(),
            kind: DependencyKind::FinishToStart,
        }
    }

    /// Returns true if this edge constrains execution order.
    pub fn is_finish_to_start(&self) -> bool {
        self.kind == DependencyKind::FinishToStart
    }
}

/// Attempt budget and backoff parameters for a task.
///
/// # Invariants
///
/// - `max_attempts >= 1`
/// - `base_delay <= max_delay`
/// - `backoff_multiplier >= 1.0`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "crate::duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "crate::duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Glob patterns of error messages worth retrying (empty = retry all)
    #[serde(default)]
    pub retryable_errors: Vec<String>,
}

impl RetryPolicy {
    /// Creates a policy with no error filter.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier,
            retryable_errors: Vec::new(),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Restricts retries to errors matching the given glob patterns.
    pub fn with_retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the policy invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(CoreError::InvalidRetryPolicy(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(CoreError::InvalidRetryPolicy(format!(
                "backoff_multiplier {} must be >= 1.0",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0)
    }
}

/// A single unit of work inside a workflow.
///
/// Definitions are immutable once registered; the engine copies them into a
/// fresh per-run graph, where `status`, the timestamps and `last_error` are
/// mutated as the run progresses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(with = "crate::duration_ms", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    /// Creates a pending task with default policy and timeout.
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task_type,
            dependencies: Vec::new(),
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TASK_TIMEOUT,
            metadata: serde_json::Map::new(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Adds a dependency on another task.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns a copy with run state cleared, ready for a new execution.
    pub fn fresh_copy(&self) -> Self {
        let mut task = self.clone();
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.completed_at = None;
        task.last_error = None;
        task
    }

    /// Elapsed time between start and completion, if both are known.
    pub fn execution_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}
