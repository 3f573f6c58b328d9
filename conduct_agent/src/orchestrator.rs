//! Process-level entry point.
//!
//! [`WorkflowOrchestrator`] owns one instance of every component, wires the
//! handlers in, and exposes the submit / cancel / status / metrics /
//! shutdown API. It adds no execution semantics of its own beyond work
//! prioritisation.

use crate::config::{ConfigError, OrchestratorConfig};
use crate::workflow::{
    EngineError, ExecutionOptions, HandlerRegistry, TaskExecutor, TaskHandler, TaskScheduler, WorkflowBuilder,
    WorkflowEngine, WorkflowResult, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use conduct_core::telemetry::default_reporter;
use conduct_core::{
    CoreError, ErrorReport, ExecutionId, ResourceManager, ResourceUsage, SharedReporter, TaskId, TaskType, Workflow,
    WorkflowId,
};
use conduct_runtime::{MonitorError, SystemMetrics, WorkflowAlert, WorkflowMonitor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Id of the built-in issue-to-PR workflow.
pub const STANDARD_PIPELINE: &str = "standard_pipeline";

const BASE_PRIORITY: u32 = 50;
const MAX_PRIORITY: u32 = 100;

/// Orchestrator errors.
#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Workflow {workflow} has no handler for task type '{task_type}'")]
    MissingHandler { workflow: WorkflowId, task_type: TaskType },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A unit of work submitted for processing, typically an issue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Handed to handlers unchanged
    #[serde(default)]
    pub payload: Value,
    /// Workflow to run; the orchestrator default when absent
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
}

impl WorkRequest {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            labels: Vec::new(),
            created_at: Utc::now(),
            payload: Value::Null,
            workflow_id: None,
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn for_workflow(mut self, workflow: impl Into<WorkflowId>) -> Self {
        self.workflow_id = Some(workflow.into());
        self
    }
}

/// Per-submission overrides.
#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    pub execution_id: Option<ExecutionId>,
    /// Replaces the workflow timeout for this run
    pub timeout: Option<Duration>,
}

/// Integer priority of a work request, 0 to 100.
///
/// Base 50; +30 for an urgent or critical label; +20 for a bug label;
/// +15 if older than 30 days, otherwise +10 if older than 7 days.
pub fn compute_priority(request: &WorkRequest, now: DateTime<Utc>) -> u32 {
    let has = |needles: &[&str]| {
        request.labels.iter().any(|label| {
            let label = label.to_lowercase();
            needles.iter().any(|n| label.contains(n))
        })
    };

    let mut priority = BASE_PRIORITY;
    if has(&["urgent", "critical"]) {
        priority += 30;
    }
    if has(&["bug"]) {
        priority += 20;
    }
    let age = now.signed_duration_since(request.created_at);
    if age > chrono::Duration::days(30) {
        priority += 15;
    } else if age > chrono::Duration::days(7) {
        priority += 10;
    }
    priority.min(MAX_PRIORITY)
}

/// The issue-to-PR pipeline: analysis, resolution, then review and
/// artifact generation side by side, then PR creation.
pub fn standard_pipeline() -> std::result::Result<Workflow, CoreError> {
    let id = |s: &str| TaskId::new(s);
    WorkflowBuilder::new(STANDARD_PIPELINE, "Standard issue pipeline")
        .description("Analyze an issue, resolve it, review the change and open a pull request")
        .task("analyze", "Analyze issue", TaskType::IssueAnalysis)
        .task("resolve", "Resolve issue", TaskType::CodeResolution)
        .task("review", "Review change", TaskType::CodeReview)
        .task("artifacts", "Generate artifacts", TaskType::ArtifactGeneration)
        .task("create_pr", "Create pull request", TaskType::PrCreation)
        .dependency(id("analyze"), id("resolve"))
        .dependency(id("resolve"), id("review"))
        .dependency(id("resolve"), id("artifacts"))
        .dependency(id("review"), id("create_pr"))
        .dependency(id("artifacts"), id("create_pr"))
        .build()
}

/// Aggregate counters for the whole process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub system: SystemMetrics,
    pub resources: ResourceUsage,
    pub active_executions: usize,
    pub in_flight_tasks: usize,
    pub registered_workflows: usize,
    pub registered_handlers: usize,
}

/// Wires configuration, handlers and workflows into an orchestrator.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    reporter: Option<SharedReporter>,
    handlers: Vec<(TaskType, Arc<dyn TaskHandler>)>,
    workflows: Vec<Workflow>,
    standard_pipeline: bool,
    default_workflow: Option<WorkflowId>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn handler(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push((task_type, handler));
        self
    }

    pub fn workflow(mut self, workflow: Workflow) -> Self {
        self.workflows.push(workflow);
        self
    }

    /// Installs [`standard_pipeline`], the default unless another is set.
    pub fn with_standard_pipeline(mut self) -> Self {
        self.standard_pipeline = true;
        self
    }

    pub fn default_workflow(mut self, id: impl Into<WorkflowId>) -> Self {
        self.default_workflow = Some(id.into());
        self
    }

    pub fn build(self) -> Result<WorkflowOrchestrator> {
        self.config.validate()?;
        let reporter = self.reporter.unwrap_or_else(default_reporter);
        let config = self.config;

        let handlers = Arc::new(HandlerRegistry::new());
        for (task_type, handler) in self.handlers {
            handlers.register(task_type, handler);
        }

        let resources = Arc::new(ResourceManager::new(config.resources.clone()));
        let scheduler = Arc::new(TaskScheduler::new(resources.clone()));
        let executor =
            Arc::new(TaskExecutor::new(handlers.clone(), config.executor.clone()).with_reporter(reporter.clone()));
        let monitor = Arc::new(WorkflowMonitor::with_reporter(config.monitor.clone(), reporter.clone()));
        let engine = Arc::new(
            WorkflowEngine::new(scheduler.clone(), executor.clone(), monitor.clone(), config.engine.clone())
                .with_reporter(reporter.clone()),
        );

        let mut orchestrator = WorkflowOrchestrator {
            config,
            handlers,
            resources,
            scheduler,
            executor,
            monitor,
            engine,
            reporter,
            default_workflow: self.default_workflow,
            shutting_down: AtomicBool::new(false),
        };

        if self.standard_pipeline {
            orchestrator.register_workflow(standard_pipeline().map_err(EngineError::from)?)?;
            orchestrator
                .default_workflow
                .get_or_insert_with(|| WorkflowId::new(STANDARD_PIPELINE));
        }
        for workflow in self.workflows {
            orchestrator.register_workflow(workflow)?;
        }
        Ok(orchestrator)
    }
}

/// Owns every component and exposes the process-level API.
pub struct WorkflowOrchestrator {
    config: OrchestratorConfig,
    handlers: Arc<HandlerRegistry>,
    resources: Arc<ResourceManager>,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<TaskExecutor>,
    monitor: Arc<WorkflowMonitor>,
    engine: Arc<WorkflowEngine>,
    reporter: SharedReporter,
    default_workflow: Option<WorkflowId>,
    shutting_down: AtomicBool,
}

impl WorkflowOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<WorkflowMonitor> {
        &self.monitor
    }

    pub fn default_workflow(&self) -> Option<&WorkflowId> {
        self.default_workflow.as_ref()
    }

    /// Binds a handler, replacing any previous one for the type.
    pub fn register_handler(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        if self.handlers.register(task_type.clone(), handler).is_some() {
            warn!(%task_type, "handler replaced");
        }
    }

    /// Registers a workflow whose task types all have handlers.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &workflow.tasks {
            if seen.insert(&task.task_type) && !self.handlers.contains(&task.task_type) {
                let err = OrchestratorError::MissingHandler {
                    workflow: workflow.id.clone(),
                    task_type: task.task_type.clone(),
                };
                self.reporter
                    .report(ErrorReport::new("orchestrator", "register_workflow", err.to_string()).fatal());
                return Err(err);
            }
        }
        self.engine.register_workflow(workflow)?;
        Ok(())
    }

    /// Runs the workflow selected for `request` and returns its result.
    ///
    /// The request is prioritised and the priority is stamped into the run
    /// input as `priority`. After shutdown has begun every submission
    /// fails immediately.
    #[instrument(skip_all, fields(request = %request.id))]
    pub async fn process_work(&self, request: WorkRequest, options: ProcessOptions) -> WorkflowResult {
        let execution = options.execution_id.unwrap_or_default();
        let workflow_id = request
            .workflow_id
            .clone()
            .or_else(|| self.default_workflow.clone())
            .unwrap_or_else(|| WorkflowId::new(""));

        if self.is_shutting_down() {
            return self.reject(execution, workflow_id, OrchestratorError::ShuttingDown);
        }
        if workflow_id.as_str().is_empty() {
            return self.reject(
                execution,
                workflow_id,
                OrchestratorError::Engine(EngineError::Core(CoreError::Config(
                    "no workflow selected and no default configured".to_string(),
                ))),
            );
        }

        let priority = compute_priority(&request, Utc::now());
        info!(workflow = %workflow_id, priority, "processing work request");
        let input = json!({
            "request": {
                "id": request.id,
                "title": request.title,
                "labels": request.labels,
                "created_at": request.created_at,
            },
            "payload": request.payload,
            "priority": priority,
        });

        let mut run = ExecutionOptions::default().with_execution_id(execution);
        run.timeout = options.timeout;
        self.engine.execute_workflow(&workflow_id, input, run).await
    }

    fn reject(&self, execution: ExecutionId, workflow_id: WorkflowId, err: OrchestratorError) -> WorkflowResult {
        self.reporter
            .report(ErrorReport::new("orchestrator", "process_work", err.to_string()).with("execution", execution.to_string()));
        WorkflowResult::rejected(execution, workflow_id, err.to_string())
    }

    pub fn cancel_workflow(&self, execution: ExecutionId, reason: &str) -> bool {
        self.engine.cancel_workflow(execution, reason)
    }

    pub fn get_status(&self, execution: ExecutionId) -> Option<WorkflowStatus> {
        self.engine.get_workflow_status(execution)
    }

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            system: self.monitor.get_system_metrics(),
            resources: self.resources.usage(),
            active_executions: self.engine.active_executions().len(),
            in_flight_tasks: self.executor.in_flight_count(),
            registered_workflows: self.engine.workflow_ids().len(),
            registered_handlers: self.handlers.len(),
        }
    }

    pub fn subscribe_alerts(&self) -> Result<broadcast::Receiver<WorkflowAlert>> {
        Ok(self.monitor.subscribe()?)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Graceful shutdown within `timeout`.
    ///
    /// Active runs are cancelled and awaited, then scheduler, executor and
    /// monitor are shut down in that order. Half the budget goes to the
    /// engine and whatever is left to the executor; stragglers are
    /// cancelled. Returns true if everything stopped in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        info!(?timeout, "orchestrator shutting down");

        let engine_clean = self.engine.shutdown(timeout / 2).await;
        let dropped = self.scheduler.shutdown();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let executor_clean = self.executor.shutdown(remaining).await;
        self.monitor.shutdown();

        let clean = engine_clean && executor_clean;
        if !clean {
            self.reporter.report(
                ErrorReport::new("orchestrator", "shutdown", "components did not stop within the budget")
                    .with("engine_clean", engine_clean)
                    .with("executor_clean", executor_clean)
                    .with("dropped_schedules", dropped),
            );
        }
        info!(clean, "orchestrator stopped");
        clean
    }
}
