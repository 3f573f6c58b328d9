//! Workflow alerts and their action vocabulary.

use chrono::{DateTime, Utc};
use conduct_core::{ExecutionId, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of an alert.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Condition that raised an alert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Run ended in `failed`
    WorkflowFailed,
    /// Run ended in `requires_human_review`
    HumanReviewRequired,
    /// A task failed
    TaskFailure,
    /// A task ran longer than the slow-task threshold
    Performance,
    /// Anything raised by a caller
    Custom(String),
}

/// Severity of an alert, ordered info < warning < error < critical.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Action suggested to whoever handles the alert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Retry,
    Escalate,
    Cancel,
    Ignore,
    Custom(String),
}

/// A noteworthy workflow or task condition raised by the monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAlert {
    pub id: AlertId,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub suggested_actions: Vec<AlertAction>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub resolved: bool,
}

impl WorkflowAlert {
    /// Returns true until the alert is resolved.
    pub fn is_active(&self) -> bool {
        !self.resolved
    }
}

/// Fields a caller supplies to raise an alert.
#[derive(Clone, Debug)]
pub struct AlertSpec {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub task_id: Option<TaskId>,
    pub suggested_actions: Vec<AlertAction>,
}

impl AlertSpec {
    pub fn new(alert_type: AlertType, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            severity,
            message: message.into(),
            task_id: None,
            suggested_actions: Vec::new(),
        }
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task_id = Some(task);
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = AlertAction>) -> Self {
        self.suggested_actions = actions.into_iter().collect();
        self
    }
}
