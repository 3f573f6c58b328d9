//! Error types for Conductkit core.

use crate::types::{ExecutionId, TaskId};

/// Main error type for the orchestration core.
///
/// All core operations return `Result<T> = std::result::Result<T, CoreError>`.
/// Every variant is a configuration or planning error: none of them is ever
/// retried by the executor.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Workflow definition is structurally invalid.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Two tasks in the same workflow share an id.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// A task depends on an id that does not exist in the workflow.
    #[error("Task {task} depends on unknown task {dependency}")]
    MissingDependency {
        /// Task declaring the dependency
        task: TaskId,
        /// Dependency id that could not be found
        dependency: TaskId,
    },

    /// Dependency graph contains a cycle through the given task.
    #[error("Circular dependency detected at task {0}")]
    CycleDetected(TaskId),

    /// Retry policy violates its invariants.
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// A single task demands more than the whole resource pool holds.
    #[error("Task {task} exceeds total capacity (needs {cpu} cpu / {memory} memory)")]
    ExceedsCapacity {
        /// Offending task
        task: TaskId,
        /// Requested cpu units
        cpu: u32,
        /// Requested memory units
        memory: u64,
    },

    /// Resources are currently exhausted.
    #[error("Insufficient resources for {0}")]
    InsufficientResources(String),

    /// Configuration could not be used.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No schedule or allocation is known for this run.
    #[error("Unknown execution {0}")]
    UnknownExecution(ExecutionId),

    /// The component has been shut down and accepts no new work.
    #[error("{0} is shut down")]
    ShutDown(String),
}

/// Type alias for Result with CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::CycleDetected(TaskId::new("review"));
        assert_eq!(err.to_string(), "Circular dependency detected at task review");
    }

    #[test]
    fn test_missing_dependency_display() {
        let err = CoreError::MissingDependency {
            task: TaskId::new("b"),
            dependency: TaskId::new("ghost"),
        };
        assert!(err.to_string().contains("ghost"));
        assert!(err.to_string().contains("b"));
    }
}
