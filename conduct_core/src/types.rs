//! Core types used across the orchestration workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task within a workflow.
///
/// TaskId wraps a string identifier and implements the necessary traits
/// for use as a HashMap key and graph node identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the TaskId and returns the underlying string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a registered workflow definition.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Creates a new WorkflowId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one execution (run) of a workflow.
///
/// Every per-run registry (schedules, in-flight tasks, monitor records)
/// is keyed by this id, so concurrent runs of one workflow never collide.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Creates a fresh random execution id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag selecting which handler executes a task.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Analyse an incoming issue or request
    IssueAnalysis,
    /// Produce a code change resolving the issue
    CodeResolution,
    /// Review a proposed change
    CodeReview,
    /// Generate supporting artifacts (docs, reports)
    ArtifactGeneration,
    /// Open a pull request with the final change
    PrCreation,
    /// Any other pluggable handler, identified by name
    Custom(String),
}

impl TaskType {
    /// Returns a stable string name for the task type.
    pub fn name(&self) -> &str {
        match self {
            TaskType::IssueAnalysis => "issue_analysis",
            TaskType::CodeResolution => "code_resolution",
            TaskType::CodeReview => "code_review",
            TaskType::ArtifactGeneration => "artifact_generation",
            TaskType::PrCreation => "pr_creation",
            TaskType::Custom(name) => name,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle status of a single task.
///
/// `Retrying` is a transient sub-state of `Running` entered between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or admission
    Pending,
    /// Handler is executing
    Running,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Aborted by a cancellation signal
    Cancelled,
}

impl TaskStatus {
    /// Returns true for completed, failed and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns true if the state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Retrying) | (Retrying, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Retrying, Failed) | (Retrying, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State of a whole workflow execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created, not yet planned
    Pending,
    /// Dependency resolution and schedule construction
    Scheduling,
    /// Tasks are being executed
    Running,
    /// All tasks completed
    Completed,
    /// Finished with task failures that need a human
    RequiresHumanReview,
    /// Aborted by a fatal error or workflow timeout
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl WorkflowState {
    /// Returns true once no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed
                | WorkflowState::RequiresHumanReview
                | WorkflowState::Failed
                | WorkflowState::Cancelled
        )
    }

    /// Returns true if the workflow state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Scheduling) => true,
            (Scheduling, Running) => true,
            (_, Failed) | (_, Cancelled) => true,
            (Running, Completed) | (Running, RequiresHumanReview) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Scheduling => "scheduling",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::RequiresHumanReview => "requires_human_review",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Priority tier of a task. Ordered low < normal < high < critical.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Weight used when computing priority scores.
    pub fn weight(&self) -> u32 {
        match self {
            Priority::Low => 10,
            Priority::Normal => 20,
            Priority::High => 30,
            Priority::Critical => 40,
        }
    }

    /// Parses a tier name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" | "medium" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}
