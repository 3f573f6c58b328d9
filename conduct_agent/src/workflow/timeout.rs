//! Task and workflow time limits.
//!
//! Task timeouts apply per attempt and are retryable. A workflow timeout
//! is a [`Deadline`] for the whole run and is fatal when it passes.

use conduct_core::{TaskId, WorkflowId};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// A time limit that was exceeded.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Task '{task_id}' attempt {attempt} timed out after {timeout:?}")]
    TaskTimeout {
        task_id: TaskId,
        attempt: u32,
        timeout: Duration,
    },

    #[error("Workflow '{workflow_id}' timed out after {timeout:?}")]
    WorkflowTimeout {
        workflow_id: WorkflowId,
        timeout: Duration,
    },
}

/// Runs one attempt of a task against its timeout.
pub async fn race_task<F, T>(task_id: &TaskId, attempt: u32, limit: Duration, fut: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TimeoutError::TaskTimeout {
            task_id: task_id.clone(),
            attempt,
            timeout: limit,
        })
}

/// Absolute end time of a workflow run.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    /// Starts a deadline `limit` from now.
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// Instant at which the run must stop.
    ///
    /// Saturates far in the future for limits too large to represent.
    pub fn instant(&self) -> Instant {
        self.started
            .checked_add(self.limit)
            .unwrap_or_else(|| self.started + Duration::from_secs(86_400 * 365))
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Time left before the deadline, zero once passed.
    pub fn remaining(&self) -> Duration {
        self.instant().saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.instant()
    }

    /// Completes when the deadline passes.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.instant()).await;
    }

    /// The error describing this deadline being exceeded.
    pub fn error(&self, workflow_id: &WorkflowId) -> TimeoutError {
        TimeoutError::WorkflowTimeout {
            workflow_id: workflow_id.clone(),
            timeout: self.limit,
        }
    }
}
