//! YAML workflow definition and parsing.
//!
//! Workflows can be declared in YAML and loaded into a validated
//! [`Workflow`]. Durations are given in milliseconds.
//!
//! ```yaml
//! id: triage
//! name: Issue triage
//! config:
//!   max_parallel_tasks: 2
//!   timeout_handling: continue
//! tasks:
//!   - id: analyze
//!     name: Analyze issue
//!     type: issue_analysis
//!   - id: lint
//!     name: Lint
//!     type: lint            # unknown names become custom task types
//!     depends_on: [analyze]
//!     timeout_ms: 5000
//!     retry:
//!       max_attempts: 2
//!       base_delay: 200
//!       max_delay: 1000
//!       backoff_multiplier: 2.0
//!     metadata:
//!       priority: high
//! ```

use crate::workflow::builder::WorkflowBuilder;
use conduct_core::{default_policy_for, CoreError, RetryPolicy, Task, TaskType, Workflow, WorkflowConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Workflow definition from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlWorkflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Execution settings; omitted fields take their defaults
    #[serde(default)]
    pub config: Option<YamlWorkflowConfig>,
    pub tasks: Vec<YamlTask>,
}

/// Partial [`WorkflowConfig`] as written in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YamlWorkflowConfig {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub human_intervention_threshold: Option<f64>,
    #[serde(default)]
    pub parallel_execution: Option<bool>,
    #[serde(default)]
    pub max_parallel_tasks: Option<usize>,
    #[serde(default)]
    pub timeout_handling: Option<conduct_core::TimeoutHandling>,
}

/// Task definition from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlTask {
    pub id: String,
    pub name: String,
    /// Built-in type name (`issue_analysis`, `code_review`...) or a custom one
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-attempt timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides the default policy of the task type
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Errors that can occur during YAML workflow parsing.
#[derive(Error, Debug)]
pub enum YamlWorkflowError {
    #[error("Invalid workflow schema: {0}")]
    InvalidSchema(String),

    /// The parsed definition does not form a valid workflow
    #[error("Invalid workflow: {0}")]
    Invalid(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

/// Maps a YAML type name to a [`TaskType`].
pub fn parse_task_type(name: &str) -> TaskType {
    match name {
        "issue_analysis" => TaskType::IssueAnalysis,
        "code_resolution" => TaskType::CodeResolution,
        "code_review" => TaskType::CodeReview,
        "artifact_generation" => TaskType::ArtifactGeneration,
        "pr_creation" => TaskType::PrCreation,
        other => TaskType::Custom(other.to_string()),
    }
}

impl YamlWorkflowConfig {
    fn apply(&self, mut config: WorkflowConfig) -> WorkflowConfig {
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.human_intervention_threshold {
            config.human_intervention_threshold = threshold;
        }
        if let Some(parallel) = self.parallel_execution {
            config.parallel_execution = parallel;
        }
        if let Some(max) = self.max_parallel_tasks {
            config.max_parallel_tasks = max;
        }
        if let Some(handling) = self.timeout_handling {
            config.timeout_handling = handling;
        }
        config
    }
}

impl TryFrom<YamlWorkflow> for Workflow {
    type Error = YamlWorkflowError;

    fn try_from(yaml: YamlWorkflow) -> Result<Self, Self::Error> {
        let mut builder = WorkflowBuilder::new(yaml.id, yaml.name);
        if let Some(version) = yaml.version {
            builder = builder.version(version);
        }
        if let Some(description) = yaml.description {
            builder = builder.description(description);
        }
        if let Some(config) = &yaml.config {
            if config.max_parallel_tasks == Some(0) {
                return Err(YamlWorkflowError::InvalidSchema(
                    "max_parallel_tasks must be at least 1".to_string(),
                ));
            }
            builder = builder.config(config.apply(WorkflowConfig::default()));
        }

        for yaml_task in yaml.tasks {
            if yaml_task.task_type.trim().is_empty() {
                return Err(YamlWorkflowError::InvalidSchema(format!(
                    "task '{}' has an empty type",
                    yaml_task.id
                )));
            }
            let task_type = parse_task_type(&yaml_task.task_type);
            let policy = yaml_task.retry.unwrap_or_else(|| default_policy_for(&task_type));
            let mut task = Task::new(yaml_task.id, yaml_task.name, task_type).with_retry_policy(policy);
            if let Some(ms) = yaml_task.timeout_ms {
                task = task.with_timeout(Duration::from_millis(ms));
            }
            for dep in yaml_task.depends_on {
                task = task.depends_on(dep);
            }
            task.metadata = yaml_task.metadata;
            builder = builder.add_task(task);
        }

        Ok(builder.build()?)
    }
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```ignore
/// let workflow = load_workflow_file(Path::new("triage.yaml")).await?;
/// ```
pub async fn load_workflow_file(path: &Path) -> Result<Workflow, YamlWorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    load_workflow_str(&content)
}

/// Loads a workflow from a YAML string.
pub fn load_workflow_str(yaml: &str) -> Result<Workflow, YamlWorkflowError> {
    let yaml_workflow: YamlWorkflow = serde_yaml::from_str(yaml)?;
    yaml_workflow.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduct_core::{TaskId, TimeoutHandling};
    use serde_json::json;

    const TRIAGE: &str = r#"
id: triage
name: Issue triage
version: "1.2.0"
config:
  timeout_ms: 60000
  max_parallel_tasks: 2
  timeout_handling: fail
tasks:
  - id: analyze
    name: Analyze issue
    type: issue_analysis
  - id: lint
    name: Lint
    type: lint
    depends_on: [analyze]
    timeout_ms: 5000
    retry:
      max_attempts: 2
      base_delay: 200
      max_delay: 1000
      backoff_multiplier: 2.0
    metadata:
      priority: high
"#;

    #[test]
    fn test_load_full_definition() {
        let workflow = load_workflow_str(TRIAGE).unwrap();
        assert_eq!(workflow.id.as_str(), "triage");
        assert_eq!(workflow.version, "1.2.0");
        assert_eq!(workflow.config.timeout, Duration::from_secs(60));
        assert_eq!(workflow.config.max_parallel_tasks, 2);
        assert_eq!(workflow.config.timeout_handling, TimeoutHandling::Fail);

        let analyze = workflow.task(&TaskId::new("analyze")).unwrap();
        assert_eq!(analyze.task_type, TaskType::IssueAnalysis);
        assert_eq!(analyze.retry_policy, default_policy_for(&TaskType::IssueAnalysis));

        let lint = workflow.task(&TaskId::new("lint")).unwrap();
        assert_eq!(lint.task_type, TaskType::Custom("lint".into()));
        assert_eq!(lint.timeout, Duration::from_secs(5));
        assert_eq!(lint.retry_policy.max_attempts, 2);
        assert_eq!(lint.retry_policy.base_delay, Duration::from_millis(200));
        assert_eq!(lint.dependencies, vec![TaskId::new("analyze")]);
        assert_eq!(lint.metadata.get("priority"), Some(&json!("high")));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let yaml = r#"
id: broken
name: Broken
tasks:
  - id: review
    name: Review
    type: code_review
    depends_on: [resolve]
"#;
        assert!(matches!(
            load_workflow_str(yaml),
            Err(YamlWorkflowError::Invalid(CoreError::MissingDependency { .. }))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
id: cyclic
name: Cyclic
tasks:
  - id: a
    name: A
    type: issue_analysis
    depends_on: [b]
  - id: b
    name: B
    type: code_review
    depends_on: [a]
"#;
        assert!(matches!(
            load_workflow_str(yaml),
            Err(YamlWorkflowError::Invalid(CoreError::CycleDetected(_)))
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            load_workflow_str("id: [unclosed"),
            Err(YamlWorkflowError::YamlParse(_))
        ));
        let zero = "id: z\nname: Z\nconfig:\n  max_parallel_tasks: 0\ntasks:\n  - {id: a, name: A, type: lint}\n";
        assert!(matches!(load_workflow_str(zero), Err(YamlWorkflowError::InvalidSchema(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.yaml");
        tokio::fs::write(&path, TRIAGE).await.unwrap();

        let workflow = load_workflow_file(&path).await.unwrap();
        assert_eq!(workflow.task_count(), 2);

        let missing = load_workflow_file(&dir.path().join("absent.yaml")).await;
        assert!(matches!(missing, Err(YamlWorkflowError::Io(_))));
    }
}
