//! Workflow definitions and their structural validation.

use crate::error::{CoreError, Result};
use crate::resolver::DependencyResolver;
use crate::task::{Dependency, RetryPolicy, Task};
use crate::types::{TaskId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// What the engine does when a task fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutHandling {
    /// Abort the whole workflow on the first task failure
    Fail,
    /// Keep running independent tasks; failures end in human review
    #[default]
    Continue,
}

/// Per-workflow execution settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow-level timeout; exceeding it is fatal for the run
    #[serde(with = "crate::duration_ms")]
    pub timeout: Duration,
    /// Policy applied by builders to tasks that do not set their own
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
    /// Fraction of failed tasks at which the run is escalated to a human
    pub human_intervention_threshold: f64,
    /// When false at most one task is in flight at a time
    pub parallel_execution: bool,
    /// Upper bound on concurrently executing tasks
    pub max_parallel_tasks: usize,
    /// Failure policy
    #[serde(default)]
    pub timeout_handling: TimeoutHandling,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            default_retry_policy: RetryPolicy::default(),
            human_intervention_threshold: 0.3,
            parallel_execution: true,
            max_parallel_tasks: 3,
            timeout_handling: TimeoutHandling::Continue,
        }
    }
}

impl WorkflowConfig {
    /// Effective number of tasks that may run concurrently.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallel_execution {
            self.max_parallel_tasks.max(1)
        } else {
            1
        }
    }
}

/// A named, versioned collection of tasks and their dependency edges.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl Workflow {
    /// Creates an empty workflow definition.
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            description: None,
            tasks: Vec::new(),
            dependencies: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }

    /// Looks up a task definition by id.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Returns all task ids in declaration order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Number of tasks in the workflow.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Validates the definition so it can be made executable.
    ///
    /// Checks, in order:
    /// 1. id, name and task list are non-empty
    /// 2. task ids are unique
    /// 3. every task-declared and edge-declared dependency exists
    /// 4. every retry policy satisfies its invariants
    /// 5. the combined dependency graph is acyclic
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the workflow may be registered
    /// - `Err(CoreError)` describing the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::InvalidWorkflow("workflow id is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidWorkflow(format!(
                "workflow {} has an empty name",
                self.id
            )));
        }
        if self.tasks.is_empty() {
            return Err(CoreError::InvalidWorkflow(format!(
                "workflow {} has no tasks",
                self.id
            )));
        }

        let mut seen: HashSet<&TaskId> = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(CoreError::DuplicateTask(task.id.clone()));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep) {
                    return Err(CoreError::MissingDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            task.retry_policy.validate()?;
        }

        for edge in &self.dependencies {
            for id in [&edge.task, &edge.depends_on] {
                if !seen.contains(id) {
                    return Err(CoreError::MissingDependency {
                        task: edge.task.clone(),
                        dependency: id.clone(),
                    });
                }
            }
        }

        DependencyResolver::new().resolve_dependencies(&self.tasks, &self.dependencies)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    fn task(id: &str) -> Task {
        Task::new(id, id.to_uppercase(), TaskType::Custom("noop".to_string()))
    }

    #[test]
    fn test_valid_workflow() {
        let mut wf = Workflow::new("wf", "Workflow");
        wf.tasks = vec![task("a"), task("b").depends_on("a")];
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let wf = Workflow::new("wf", "Workflow");
        assert!(matches!(wf.validate(), Err(CoreError::InvalidWorkflow(_))));
    }

    #[test]
    fn test_blank_name_rejected() {
        let mut wf = Workflow::new("wf", "  ");
        wf.tasks = vec![task("a")];
        assert!(matches!(wf.validate(), Err(CoreError::InvalidWorkflow(_))));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut wf = Workflow::new("wf", "Workflow");
        wf.tasks = vec![task("a"), task("a")];
        assert_eq!(wf.validate(), Err(CoreError::DuplicateTask(TaskId::new("a"))));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let mut wf = Workflow::new("wf", "Workflow");
        wf.tasks = vec![task("a").depends_on("ghost")];
        assert!(matches!(
            wf.validate(),
            Err(CoreError::MissingDependency { dependency, .. }) if dependency.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut wf = Workflow::new("wf", "Workflow");
        wf.tasks = vec![task("a")];
        wf.dependencies = vec![Dependency::finish_to_start("a", "ghost")];
        assert!(matches!(wf.validate(), Err(CoreError::MissingDependency { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut wf = Workflow::new("wf", "Workflow");
        wf.tasks = vec![task("a").depends_on("b"), task("b").depends_on("a")];
        assert!(matches!(wf.validate(), Err(CoreError::CycleDetected(_))));
    }

    #[test]
    fn test_sequential_config_parallelism() {
        let config = WorkflowConfig {
            parallel_execution: false,
            ..WorkflowConfig::default()
        };
        assert_eq!(config.effective_parallelism(), 1);
        assert_eq!(WorkflowConfig::default().effective_parallelism(), 3);
    }
}
