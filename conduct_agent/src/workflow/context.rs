//! Per-run execution state, status snapshots and final results.

use crate::workflow::handler::TaskResult;
use chrono::{DateTime, Utc};
use conduct_core::{ExecutionId, TaskId, TaskStatus, WorkflowId, WorkflowState};
use conduct_runtime::{WorkflowExecutionMetrics, WorkflowInsights};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One workflow state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkflowState,
    pub to: WorkflowState,
    #[serde(default)]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Time spent in one workflow state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: WorkflowState,
    #[serde(with = "conduct_core::duration_ms")]
    pub duration: Duration,
}

/// A state change the workflow state machine does not allow.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal workflow transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

/// Mutable state of one run, shared between the driving loop and status
/// queries.
#[derive(Debug)]
pub struct WorkflowExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    state: WorkflowState,
    started_at: DateTime<Utc>,
    started: Instant,
    phase_started: Instant,
    history: Vec<StateTransition>,
    phases: Vec<PhaseTiming>,
    /// Declaration order, kept for stable listings
    task_order: Vec<TaskId>,
    task_status: HashMap<TaskId, TaskStatus>,
    errors: Vec<String>,
}

impl WorkflowExecutionContext {
    pub fn new(execution_id: ExecutionId, workflow_id: WorkflowId, task_ids: Vec<TaskId>) -> Self {
        let now = Instant::now();
        Self {
            execution_id,
            workflow_id,
            state: WorkflowState::Pending,
            started_at: Utc::now(),
            started: now,
            phase_started: now,
            history: Vec::new(),
            phases: Vec::new(),
            task_status: task_ids.iter().map(|id| (id.clone(), TaskStatus::Pending)).collect(),
            task_order: task_ids,
            errors: Vec::new(),
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Moves to `to`, closing the timing of the current phase.
    pub fn transition(&mut self, to: WorkflowState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition { from: self.state, to });
        }
        let now = Instant::now();
        self.phases.push(PhaseTiming {
            phase: self.state,
            duration: now.saturating_duration_since(self.phase_started),
        });
        self.history.push(StateTransition {
            from: self.state,
            to,
            reason: reason.map(str::to_string),
            at: Utc::now(),
        });
        self.state = to;
        self.phase_started = now;
        Ok(())
    }

    /// Updates a task's status if the task state machine allows it.
    ///
    /// Returns false for an unknown task or a disallowed change.
    pub fn set_task_status(&mut self, task: &TaskId, status: TaskStatus) -> bool {
        match self.task_status.get_mut(task) {
            Some(current) if *current == status => true,
            Some(current) if current.can_transition_to(status) => {
                *current = status;
                true
            }
            _ => false,
        }
    }

    pub fn task_status(&self, task: &TaskId) -> Option<TaskStatus> {
        self.task_status.get(task).copied()
    }

    /// Tasks currently in `status`, in declaration order.
    pub fn tasks_with(&self, status: TaskStatus) -> Vec<TaskId> {
        self.task_order
            .iter()
            .filter(|id| self.task_status.get(*id) == Some(&status))
            .cloned()
            .collect()
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Closed phases plus the one still open.
    pub fn phase_timings(&self) -> Vec<PhaseTiming> {
        let mut phases = self.phases.clone();
        if !self.state.is_terminal() {
            phases.push(PhaseTiming {
                phase: self.state,
                duration: self.phase_started.elapsed(),
            });
        }
        phases
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fraction of tasks in a terminal status.
    pub fn progress(&self) -> f64 {
        if self.task_order.is_empty() {
            return 1.0;
        }
        let done = self.task_status.values().filter(|s| s.is_terminal()).count();
        done as f64 / self.task_order.len() as f64
    }

    /// Point-in-time view for status queries.
    pub fn snapshot(&self) -> WorkflowStatus {
        WorkflowStatus {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            state: self.state,
            progress: self.progress(),
            pending_tasks: self.tasks_with(TaskStatus::Pending),
            running_tasks: self
                .task_order
                .iter()
                .filter(|id| {
                    matches!(
                        self.task_status.get(*id),
                        Some(TaskStatus::Running) | Some(TaskStatus::Retrying)
                    )
                })
                .cloned()
                .collect(),
            completed_tasks: self.tasks_with(TaskStatus::Completed),
            failed_tasks: self.tasks_with(TaskStatus::Failed),
            cancelled_tasks: self.tasks_with(TaskStatus::Cancelled),
            errors: self.errors.clone(),
            phase_timings: self.phase_timings(),
            started_at: self.started_at,
            elapsed: self.elapsed(),
        }
    }
}

/// Externally visible status of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    /// Fraction of tasks finished, 0.0 to 1.0
    pub progress: f64,
    pub pending_tasks: Vec<TaskId>,
    pub running_tasks: Vec<TaskId>,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub cancelled_tasks: Vec<TaskId>,
    pub errors: Vec<String>,
    pub phase_timings: Vec<PhaseTiming>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "conduct_core::duration_ms")]
    pub elapsed: Duration,
}

/// Final outcome of `execute_workflow`.
#[derive(Clone, Debug)]
pub struct WorkflowResult {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    /// True only when every task completed
    pub success: bool,
    pub final_state: WorkflowState,
    pub requires_human_review: bool,
    /// Output of each completed task
    pub outputs: HashMap<TaskId, Value>,
    pub task_results: HashMap<TaskId, TaskResult>,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub cancelled_tasks: Vec<TaskId>,
    pub errors: Vec<String>,
    pub metrics: WorkflowExecutionMetrics,
    pub insights: Option<WorkflowInsights>,
    pub history: Vec<StateTransition>,
    pub phase_timings: Vec<PhaseTiming>,
    pub duration: Duration,
}

impl WorkflowResult {
    /// A run that failed before any task could execute.
    pub fn rejected(execution_id: ExecutionId, workflow_id: WorkflowId, error: impl Into<String>) -> Self {
        Self {
            execution_id,
            workflow_id,
            success: false,
            final_state: WorkflowState::Failed,
            requires_human_review: false,
            outputs: HashMap::new(),
            task_results: HashMap::new(),
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            cancelled_tasks: Vec::new(),
            errors: vec![error.into()],
            metrics: WorkflowExecutionMetrics::default(),
            insights: None,
            history: Vec::new(),
            phase_timings: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Output of a completed task.
    pub fn output(&self, task: &TaskId) -> Option<&Value> {
        self.outputs.get(task)
    }
}
