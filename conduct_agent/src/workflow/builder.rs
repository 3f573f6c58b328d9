//! Fluent builder API for workflow construction.
//!
//! Provides a chainable API for assembling a [`Workflow`] in code. Tasks
//! added with [`WorkflowBuilder::task`] get the built-in retry policy of
//! their type; [`WorkflowBuilder::add_task`] takes a fully configured
//! [`Task`] as is.

use conduct_core::{default_policy_for, CoreError, Dependency, Task, TaskId, TaskType, Workflow, WorkflowConfig};

/// Fluent builder for constructing workflows.
///
/// # Example
///
/// ```ignore
/// use conduct_agent::workflow::WorkflowBuilder;
/// use conduct_core::{TaskId, TaskType};
///
/// let workflow = WorkflowBuilder::new("triage", "Issue triage")
///     .task("analyze", "Analyze issue", TaskType::IssueAnalysis)
///     .task("review", "Review", TaskType::CodeReview)
///     .dependency(TaskId::new("analyze"), TaskId::new("review"))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<conduct_core::WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            workflow: Workflow::new(id, name),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.workflow.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.workflow.description = Some(description.into());
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.workflow.config = config;
        self
    }

    /// Adds a task with the default retry policy for its type.
    pub fn task(self, id: impl Into<TaskId>, name: impl Into<String>, task_type: TaskType) -> Self {
        let policy = default_policy_for(&task_type);
        self.add_task(Task::new(id, name, task_type).with_retry_policy(policy))
    }

    /// Adds a fully configured task.
    pub fn add_task(mut self, task: Task) -> Self {
        self.workflow.tasks.push(task);
        self
    }

    /// Declares that `to` runs after `from` has completed.
    ///
    /// Dependencies are validated when [`build`](Self::build) is called.
    pub fn dependency(mut self, from: TaskId, to: TaskId) -> Self {
        self.workflow.dependencies.push(Dependency::finish_to_start(to, from));
        self
    }

    /// Validates and returns the workflow.
    ///
    /// # Errors
    ///
    /// Any [`CoreError`] raised by [`Workflow::validate`]: empty workflow,
    /// duplicate task ids, unknown dependency, invalid retry policy or a
    /// cycle.
    pub fn build(self) -> Result<Workflow, CoreError> {
        self.workflow.validate()?;
        Ok(self.workflow)
    }

    /// Chains the given tasks so each depends on the previous one.
    pub fn sequential(id: impl Into<conduct_core::WorkflowId>, name: impl Into<String>, tasks: Vec<Task>) -> Result<Workflow, CoreError> {
        let mut builder = Self::new(id, name);
        let mut previous: Option<TaskId> = None;
        for task in tasks {
            let current = task.id.clone();
            builder = builder.add_task(task);
            if let Some(prev) = previous.take() {
                builder = builder.dependency(prev, current.clone());
            }
            previous = Some(current);
        }
        builder.build()
    }
}
