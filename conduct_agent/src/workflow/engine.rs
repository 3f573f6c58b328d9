//! Workflow engine: registration and concurrent execution of runs.
//!
//! A run moves `pending → scheduling → running → terminal`. While running,
//! the engine repeatedly asks the [`TaskScheduler`] for admissible tasks,
//! starts them on a [`JoinSet`] through the [`TaskExecutor`], and settles
//! each completion as it arrives. Sibling tasks are independent: one
//! failure does not cancel the others.
//!
//! Final states:
//!
//! | Situation | State |
//! |---|---|
//! | every task completed | `completed` |
//! | some task failed or was skipped | `requires_human_review` |
//! | `timeout_handling = fail` and a task failed | `failed` |
//! | workflow deadline passed, or an internal error | `failed` |
//! | `cancel_workflow` | `cancelled` |
//!
//! [`WorkflowEngine::execute_workflow`] never returns an error: every
//! failure is folded into the [`WorkflowResult`].

use crate::workflow::cancellation::CancellationTokenSource;
use crate::workflow::context::{IllegalTransition, WorkflowExecutionContext, WorkflowResult, WorkflowStatus};
use crate::workflow::executor::TaskExecutor;
use crate::workflow::handler::{TaskContext, TaskResult};
use crate::workflow::scheduler::{ScheduledTask, TaskScheduler};
use crate::workflow::timeout::Deadline;
use conduct_core::telemetry::default_reporter;
use conduct_core::{
    CoreError, ErrorReport, ExecutionId, SharedReporter, TaskId, TaskStatus, TimeoutHandling, Workflow, WorkflowId,
    WorkflowState,
};
use conduct_runtime::{AlertAction, AlertSeverity, AlertSpec, AlertType, MonitorError, TaskMetrics, WorkflowMonitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Error type for engine operations.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow already registered: {0}")]
    AlreadyRegistered(WorkflowId),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    /// Tasks remain but none can run and none is running
    #[error("Workflow blocked with {} task(s) left: {0:?}", .0.len())]
    Blocked(Vec<TaskId>),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Type alias for Result with EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often a run with nothing in flight re-checks a full pool
    #[serde(with = "conduct_core::duration_ms")]
    pub resource_poll_interval: Duration,
    /// Statuses of finished runs kept for `get_workflow_status`
    pub retained_statuses: usize,
    /// Default budget for `shutdown`
    #[serde(with = "conduct_core::duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resource_poll_interval: Duration::from_millis(50),
            retained_statuses: 100,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-run overrides.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    /// Use this id instead of a fresh one
    pub execution_id: Option<ExecutionId>,
    /// Replaces `WorkflowConfig::timeout` for this run
    pub timeout: Option<Duration>,
}

impl ExecutionOptions {
    pub fn with_execution_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct ActiveRun {
    source: CancellationTokenSource,
    context: Arc<Mutex<WorkflowExecutionContext>>,
}

/// Registers workflow definitions and executes runs of them.
pub struct WorkflowEngine {
    config: EngineConfig,
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<TaskExecutor>,
    monitor: Arc<WorkflowMonitor>,
    reporter: SharedReporter,
    active: Mutex<HashMap<ExecutionId, ActiveRun>>,
    finished: Mutex<VecDeque<WorkflowStatus>>,
    shutting_down: AtomicBool,
    idle: Notify,
}

impl WorkflowEngine {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        executor: Arc<TaskExecutor>,
        monitor: Arc<WorkflowMonitor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            config,
            workflows: RwLock::new(HashMap::new()),
            scheduler,
            executor,
            monitor,
            reporter: default_reporter(),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn monitor(&self) -> &Arc<WorkflowMonitor> {
        &self.monitor
    }

    /// Validates and stores a workflow definition.
    ///
    /// Definitions are immutable once registered; registering the same id
    /// twice is an error.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<()> {
        let outcome = self.try_register(workflow);
        if let Err(err) = &outcome {
            self.reporter
                .report(ErrorReport::new("engine", "register_workflow", err.to_string()).fatal());
        }
        outcome
    }

    fn try_register(&self, workflow: Workflow) -> Result<()> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        workflow.validate()?;

        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        if workflows.contains_key(&workflow.id) {
            return Err(EngineError::AlreadyRegistered(workflow.id));
        }
        debug!(workflow = %workflow.id, tasks = workflow.task_count(), "workflow registered");
        workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn workflow(&self, id: &WorkflowId) -> Option<Arc<Workflow>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Registered workflow ids, sorted.
    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Runs a registered workflow to completion.
    #[instrument(skip(self, input, options), fields(workflow = %workflow_id))]
    pub async fn execute_workflow(&self, workflow_id: &WorkflowId, input: Value, options: ExecutionOptions) -> WorkflowResult {
        let execution = options.execution_id.unwrap_or_default();

        if self.is_shutting_down() {
            return self.reject(execution, workflow_id, EngineError::ShuttingDown);
        }
        let Some(workflow) = self.workflow(workflow_id) else {
            return self.reject(execution, workflow_id, EngineError::WorkflowNotFound(workflow_id.clone()));
        };
        if self.lock_active().contains_key(&execution) {
            return self.reject(
                execution,
                workflow_id,
                EngineError::Core(CoreError::InvalidWorkflow(format!("execution {} is already running", execution))),
            );
        }
        if let Err(err) = self
            .monitor
            .track_workflow_execution(execution, workflow_id, workflow.task_count())
        {
            return self.reject(execution, workflow_id, err.into());
        }

        let source = CancellationTokenSource::new();
        let context = Arc::new(Mutex::new(WorkflowExecutionContext::new(
            execution,
            workflow_id.clone(),
            workflow.task_ids(),
        )));
        self.lock_active().insert(
            execution,
            ActiveRun {
                source: source.clone(),
                context: context.clone(),
            },
        );

        let guard = RunGuard {
            engine: self,
            execution,
            source: source.clone(),
            context: context.clone(),
            armed: true,
        };

        let limit = options.timeout.unwrap_or(workflow.config.timeout);
        info!(%execution, tasks = workflow.task_count(), timeout = ?limit, "workflow started");

        let mut run = RunDriver {
            engine: self,
            execution,
            workflow: &workflow,
            context,
            source,
            input: Arc::new(input),
            deadline: Deadline::after(limit),
            remaining: workflow.task_ids().into_iter().collect(),
            outputs: HashMap::new(),
            results: HashMap::new(),
            tasks: JoinSet::new(),
        };

        let outcome = match run.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(_) if run.source.is_cancelled() && !run.deadline.is_expired() => {
                run.abort("workflow cancelled").await;
                Ok(Outcome::Cancelled)
            }
            Err(err) => {
                run.abort("workflow aborted").await;
                Err(err)
            }
        };
        let result = self.finish(run, outcome);
        guard.disarm();
        result
    }

    fn finish(&self, run: RunDriver<'_>, outcome: Result<Outcome>) -> WorkflowResult {
        let execution = run.execution;
        let workflow = run.workflow;

        let (target, reason) = match &outcome {
            Ok(Outcome::Finished) => {
                let ctx = lock(&run.context);
                if ctx.tasks_with(TaskStatus::Failed).is_empty() && ctx.tasks_with(TaskStatus::Cancelled).is_empty() {
                    (WorkflowState::Completed, None)
                } else {
                    (
                        WorkflowState::RequiresHumanReview,
                        Some("one or more tasks did not complete".to_string()),
                    )
                }
            }
            Ok(Outcome::FailFast(task)) => (WorkflowState::Failed, Some(format!("task {} failed", task))),
            Ok(Outcome::TimedOut) => (WorkflowState::Failed, Some(run.deadline.error(&workflow.id).to_string())),
            Ok(Outcome::Cancelled) => (WorkflowState::Cancelled, Some("workflow cancelled".to_string())),
            Err(err) => (WorkflowState::Failed, Some(err.to_string())),
        };

        let fatal = match &outcome {
            Err(err) => Some(err.to_string()),
            Ok(Outcome::FailFast(_)) | Ok(Outcome::TimedOut) => reason.clone(),
            Ok(_) => None,
        };
        if let Some(message) = fatal {
            self.reporter.report(
                ErrorReport::new("engine", "execute_workflow", message)
                    .fatal()
                    .with("execution", execution.to_string())
                    .with("workflow", workflow.id.as_str()),
            );
        }

        let final_state = {
            let mut ctx = lock(&run.context);
            if !ctx.state().is_terminal() {
                if let (WorkflowState::Failed, Some(reason)) = (target, &reason) {
                    ctx.record_error(reason.clone());
                }
                // Only reachable from a terminal state, already excluded.
                let _ = ctx.transition(target, reason.as_deref());
            }
            ctx.state()
        };
        self.absorb(
            "update_workflow_state",
            self.monitor
                .update_workflow_state(execution, final_state, reason.as_deref()),
        );

        let failed = lock(&run.context).tasks_with(TaskStatus::Failed).len();
        let total = workflow.task_count().max(1);
        if failed > 0 && failed as f64 / total as f64 >= workflow.config.human_intervention_threshold {
            let spec = AlertSpec::new(
                AlertType::Custom("failure_threshold_exceeded".to_string()),
                AlertSeverity::Critical,
                format!(
                    "{} of {} tasks failed in workflow {}",
                    failed,
                    workflow.task_count(),
                    workflow.id
                ),
            )
            .with_actions([AlertAction::Escalate]);
            self.absorb("create_alert", self.monitor.create_alert(execution, spec));
        }

        let metrics = self.monitor.execution_metrics(execution).unwrap_or_default();
        let insights = self.monitor.generate_insights(execution).ok();
        self.monitor.stop_tracking(execution);
        self.scheduler.cancel_workflow_tasks(execution);

        let status = lock(&run.context).snapshot();
        self.retire(execution, status.clone());

        info!(
            %execution,
            workflow = %workflow.id,
            state = %final_state,
            completed = status.completed_tasks.len(),
            failed = status.failed_tasks.len(),
            "workflow finished"
        );

        let ctx = lock(&run.context);
        WorkflowResult {
            execution_id: execution,
            workflow_id: workflow.id.clone(),
            success: final_state == WorkflowState::Completed,
            final_state,
            requires_human_review: final_state == WorkflowState::RequiresHumanReview,
            outputs: run.outputs,
            task_results: run.results,
            completed_tasks: status.completed_tasks,
            failed_tasks: status.failed_tasks,
            cancelled_tasks: status.cancelled_tasks,
            errors: ctx.errors().to_vec(),
            metrics,
            insights,
            history: ctx.history().to_vec(),
            phase_timings: ctx.phase_timings(),
            duration: ctx.elapsed(),
        }
    }

    /// Moves a run from the active set to the retained statuses.
    fn retire(&self, execution: ExecutionId, status: WorkflowStatus) {
        self.lock_active().remove(&execution);
        {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.push_back(status);
            while finished.len() > self.config.retained_statuses {
                finished.pop_front();
            }
        }
        self.idle.notify_waiters();
    }

    fn reject(&self, execution: ExecutionId, workflow_id: &WorkflowId, err: EngineError) -> WorkflowResult {
        self.reporter.report(
            ErrorReport::new("engine", "execute_workflow", err.to_string())
                .fatal()
                .with("execution", execution.to_string())
                .with("workflow", workflow_id.as_str()),
        );
        WorkflowResult::rejected(execution, workflow_id.clone(), err.to_string())
    }

    /// Cancels a running execution.
    ///
    /// In-flight tasks are signalled, every resource the run holds is
    /// released and nothing further is admitted. Returns false if the run
    /// is unknown or already finished.
    pub fn cancel_workflow(&self, execution: ExecutionId, reason: &str) -> bool {
        let Some((source, context)) = self
            .lock_active()
            .get(&execution)
            .map(|run| (run.source.clone(), run.context.clone()))
        else {
            return false;
        };

        {
            let mut ctx = lock(&context);
            if ctx.transition(WorkflowState::Cancelled, Some(reason)).is_err() {
                return false;
            }
        }
        source.cancel();
        let signalled = self.executor.cancel_workflow_tasks(execution);
        let released = self.scheduler.cancel_workflow_tasks(execution);
        self.absorb(
            "update_workflow_state",
            self.monitor
                .update_workflow_state(execution, WorkflowState::Cancelled, Some(reason)),
        );
        info!(%execution, reason, signalled, released = released.len(), "workflow cancelled");
        true
    }

    /// Status of a running execution, or of a recently finished one.
    pub fn get_workflow_status(&self, execution: ExecutionId) -> Option<WorkflowStatus> {
        if let Some(context) = self.lock_active().get(&execution).map(|run| run.context.clone()) {
            return Some(lock(&context).snapshot());
        }
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|status| status.execution_id == execution)
            .cloned()
    }

    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.lock_active().keys().copied().collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stops accepting runs, cancels the active ones and waits up to
    /// `timeout` for them to finish.
    ///
    /// Returns true if every run finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        for execution in self.active_executions() {
            self.cancel_workflow(execution, "engine shutting down");
        }

        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            let remaining = self.lock_active().len();
            if remaining == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                self.reporter.report(ErrorReport::new(
                    "engine",
                    "shutdown",
                    format!("{} run(s) still active after {:?}", remaining, timeout),
                ));
                return self.lock_active().is_empty();
            }
        }
    }

    fn absorb<T, E: Display>(&self, operation: &str, outcome: std::result::Result<T, E>) -> Option<T> {
        match outcome {
            Ok(value) => Some(value),
            Err(err) => {
                self.reporter
                    .report(ErrorReport::new("engine", operation, err.to_string()));
                None
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<ExecutionId, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(context: &Mutex<WorkflowExecutionContext>) -> MutexGuard<'_, WorkflowExecutionContext> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancels and releases a run whose `execute_workflow` future was dropped
/// before `finish` ran. Handlers live on their own tasks and outlive the
/// future otherwise.
struct RunGuard<'a> {
    engine: &'a WorkflowEngine,
    execution: ExecutionId,
    source: CancellationTokenSource,
    context: Arc<Mutex<WorkflowExecutionContext>>,
    armed: bool,
}

impl RunGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let engine = self.engine;
        let execution = self.execution;
        let reason = "execution dropped before completion";

        self.source.cancel();
        let signalled = engine.executor.cancel_workflow_tasks(execution);
        let released = engine.scheduler.cancel_workflow_tasks(execution);

        let status = {
            let mut ctx = lock(&self.context);
            if !ctx.state().is_terminal() {
                ctx.record_error(reason);
                // Only reachable from a terminal state, already excluded.
                let _ = ctx.transition(WorkflowState::Cancelled, Some(reason));
            }
            for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Retrying] {
                for task in ctx.tasks_with(status) {
                    ctx.set_task_status(&task, TaskStatus::Cancelled);
                }
            }
            ctx.snapshot()
        };
        engine.absorb(
            "update_workflow_state",
            engine
                .monitor
                .update_workflow_state(execution, status.state, Some(reason)),
        );
        engine.monitor.stop_tracking(execution);
        engine.retire(execution, status);

        engine.reporter.report(
            ErrorReport::new("engine", "execute_workflow", reason)
                .with("execution", execution.to_string())
                .with("signalled", signalled)
                .with("released", released.len()),
        );
    }
}

/// How the driving loop ended.
enum Outcome {
    /// No task left
    Finished,
    /// A task failed under `timeout_handling = fail`
    FailFast(TaskId),
    /// The workflow deadline passed
    TimedOut,
    Cancelled,
}

enum Event {
    Cancelled,
    Deadline,
    Joined(Option<(TaskId, TaskResult)>),
}

/// State of one run while it is being driven.
struct RunDriver<'a> {
    engine: &'a WorkflowEngine,
    execution: ExecutionId,
    workflow: &'a Workflow,
    context: Arc<Mutex<WorkflowExecutionContext>>,
    source: CancellationTokenSource,
    input: Arc<Value>,
    deadline: Deadline,
    /// Tasks not yet settled
    remaining: HashSet<TaskId>,
    outputs: HashMap<TaskId, Value>,
    results: HashMap<TaskId, TaskResult>,
    tasks: JoinSet<(TaskId, TaskResult)>,
}

impl RunDriver<'_> {
    async fn drive(&mut self) -> Result<Outcome> {
        self.transition(WorkflowState::Scheduling, None)?;
        self.engine.scheduler.register_workflow(self.execution, self.workflow)?;
        self.transition(WorkflowState::Running, None)?;

        let parallelism = self.workflow.config.effective_parallelism();
        let token = self.source.token();
        let deadline = self.deadline;

        loop {
            if token.is_cancelled() {
                self.abort("workflow cancelled").await;
                return Ok(Outcome::Cancelled);
            }
            if deadline.is_expired() {
                let error = deadline.error(&self.workflow.id).to_string();
                self.abort(&error).await;
                return Ok(Outcome::TimedOut);
            }

            let mut blocked = 0;
            let slots = parallelism.saturating_sub(self.tasks.len());
            if slots > 0 {
                let admission = self.engine.scheduler.poll_ready(self.execution, slots)?;
                blocked = admission.resource_blocked;
                if blocked > 0 {
                    self.engine
                        .absorb("record_resource_wait", self.engine.monitor.record_resource_wait(self.execution));
                }
                for scheduled in admission.tasks {
                    match self.engine.scheduler.mark_task_started(self.execution, scheduled.id()) {
                        Ok(()) => self.spawn(scheduled),
                        Err(CoreError::InsufficientResources(_)) => {
                            blocked += 1;
                            break;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }

            if self.tasks.is_empty() {
                if self.remaining.is_empty() {
                    return Ok(Outcome::Finished);
                }
                let unreachable = self.engine.scheduler.unreachable_tasks(self.execution)?;
                if !unreachable.is_empty() {
                    for task in unreachable {
                        self.skip(task, "dependency failed");
                    }
                    continue;
                }
                if blocked > 0 {
                    // Other runs hold the pool; wait for it to drain.
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = deadline.expired() => {}
                        _ = tokio::time::sleep(self.engine.config.resource_poll_interval) => {}
                    }
                    continue;
                }
                return Err(EngineError::Blocked(self.remaining_in_order()));
            }

            let event = tokio::select! {
                _ = token.cancelled() => Event::Cancelled,
                _ = deadline.expired() => Event::Deadline,
                joined = self.tasks.join_next() => Event::Joined(joined.and_then(|j| j.ok())),
            };
            match event {
                Event::Cancelled | Event::Deadline | Event::Joined(None) => continue,
                Event::Joined(Some((task, result))) => {
                    let failed = self.settle(task.clone(), result);
                    if failed && self.workflow.config.timeout_handling == TimeoutHandling::Fail {
                        self.abort("workflow aborted after task failure").await;
                        return Ok(Outcome::FailFast(task));
                    }
                }
            }
        }
    }

    fn spawn(&mut self, scheduled: ScheduledTask) {
        let task = scheduled.task;
        let id = task.id.clone();
        let dependency_outputs = scheduled
            .dependencies
            .iter()
            .filter_map(|dep| self.outputs.get(dep).map(|out| (dep.clone(), out.clone())))
            .collect();
        let context = TaskContext::new(self.execution, self.workflow.id.clone(), &task, self.source.child_token())
            .with_input(self.input.clone())
            .with_dependency_outputs(dependency_outputs);

        lock(&self.context).set_task_status(&id, TaskStatus::Running);
        debug!(execution = %self.execution, task = %id, score = scheduled.priority_score, "task admitted");

        let executor = self.engine.executor.clone();
        self.tasks.spawn(async move {
            // A panicking handler must not take the task id down with it.
            let inner = tokio::spawn(async move { executor.execute_task(&task, context).await });
            let result = match inner.await {
                Ok(result) => result,
                Err(err) => TaskResult::failure(format!("task panicked: {}", err), false),
            };
            (id, result)
        });
    }

    /// Records a finished task. Returns true if it failed.
    fn settle(&mut self, task: TaskId, result: TaskResult) -> bool {
        self.remaining.remove(&task);
        let live = !self.source.is_cancelled();
        let status = result.status;

        if live {
            let scheduler = &self.engine.scheduler;
            let marked = if status == TaskStatus::Completed {
                scheduler.mark_task_completed(self.execution, &task).map(|_| ())
            } else {
                scheduler.mark_task_failed(self.execution, &task)
            };
            self.engine.absorb("settle_task", marked);
        }

        {
            let mut ctx = lock(&self.context);
            ctx.set_task_status(&task, status);
            if status == TaskStatus::Failed {
                ctx.record_error(format!(
                    "task {} failed: {}",
                    task,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        self.record_metrics(&task, &result);
        if status == TaskStatus::Completed {
            self.outputs
                .insert(task.clone(), result.output.clone().unwrap_or(Value::Null));
        }
        self.results.insert(task, result);
        status == TaskStatus::Failed
    }

    /// Marks a task that never ran as cancelled.
    fn skip(&mut self, task: TaskId, reason: &str) {
        self.remaining.remove(&task);
        if !self.source.is_cancelled() {
            self.engine
                .absorb("skip_task", self.engine.scheduler.mark_task_failed(self.execution, &task));
        }
        lock(&self.context).set_task_status(&task, TaskStatus::Cancelled);
        debug!(execution = %self.execution, %task, reason, "task skipped");

        let result = TaskResult::aborted(reason);
        self.record_metrics(&task, &result);
        self.results.insert(task, result);
    }

    /// Cancels everything still running, waits for it, and skips the rest.
    async fn abort(&mut self, reason: &str) {
        self.source.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok((task, result)) = joined {
                self.settle(task, result);
            }
        }
        for task in self.remaining_in_order() {
            self.skip(task, reason);
        }
    }

    fn record_metrics(&self, task: &TaskId, result: &TaskResult) {
        let Some(definition) = self.workflow.task(task) else {
            return;
        };
        let mut metrics = TaskMetrics::new(task.clone(), definition.task_type.clone(), result.status, result.duration)
            .with_attempts(result.attempts.max(1))
            .with_cache(result.cache_hits, result.cache_misses);
        if let Some(error) = &result.error {
            metrics = metrics.with_error(error.clone());
        }
        self.engine
            .absorb("record_task_metrics", self.engine.monitor.record_task_metrics(self.execution, metrics));
    }

    fn transition(&self, to: WorkflowState, reason: Option<&str>) -> Result<()> {
        lock(&self.context).transition(to, reason)?;
        self.engine
            .monitor
            .update_workflow_state(self.execution, to, reason)?;
        Ok(())
    }

    fn remaining_in_order(&self) -> Vec<TaskId> {
        self.workflow
            .tasks
            .iter()
            .filter(|t| self.remaining.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executor::ExecutorConfig;
    use crate::workflow::handler::{FnHandler, HandlerRegistry, TaskError};
    use conduct_core::{MemoryReporter, ResourceManager, ResourcePoolConfig, RetryPolicy, Task, TaskType};
    use conduct_runtime::MonitorConfig;
    use serde_json::json;

    fn custom(name: &str) -> TaskType {
        TaskType::Custom(name.to_string())
    }

    fn task(id: &str, kind: &str) -> Task {
        Task::new(id, id, custom(kind)).with_retry_policy(RetryPolicy::no_retry())
    }

    fn engine_with(handlers: HandlerRegistry) -> Arc<WorkflowEngine> {
        let resources = Arc::new(ResourceManager::new(ResourcePoolConfig::default()));
        let executor = TaskExecutor::new(
            Arc::new(handlers),
            ExecutorConfig {
                enable_jitter: false,
                ..ExecutorConfig::default()
            },
        );
        Arc::new(WorkflowEngine::new(
            Arc::new(TaskScheduler::new(resources)),
            Arc::new(executor),
            Arc::new(WorkflowMonitor::new(MonitorConfig::default())),
            EngineConfig::default(),
        ))
    }

    fn standard_handlers() -> HandlerRegistry {
        let handlers = HandlerRegistry::new();
        handlers.register(
            custom("echo"),
            Arc::new(FnHandler::new(|ctx: TaskContext| async move {
                let upstream: Vec<String> = {
                    let mut ids: Vec<String> = ctx.dependency_outputs.keys().map(|k| k.to_string()).collect();
                    ids.sort();
                    ids
                };
                Ok(TaskResult::success(json!({ "task": ctx.task_id.as_str(), "upstream": upstream })))
            })),
        );
        handlers.register(
            custom("fail"),
            Arc::new(FnHandler::new(|_ctx: TaskContext| async move {
                Err(TaskError::Fatal("broken input".into()))
            })),
        );
        handlers.register(
            custom("slow"),
            Arc::new(FnHandler::new(|_ctx: TaskContext| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(TaskResult::success(Value::Null))
            })),
        );
        handlers
    }

    fn workflow(id: &str, tasks: Vec<Task>) -> Workflow {
        let mut wf = Workflow::new(id, id);
        wf.tasks = tasks;
        wf
    }

    #[tokio::test]
    async fn test_linear_workflow_completes_and_passes_outputs() {
        let engine = engine_with(standard_handlers());
        engine
            .register_workflow(workflow(
                "linear",
                vec![task("a", "echo"), task("b", "echo").depends_on("a")],
            ))
            .unwrap();

        let result = engine
            .execute_workflow(&WorkflowId::new("linear"), json!({}), ExecutionOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(result.final_state, WorkflowState::Completed);
        assert_eq!(result.completed_tasks, vec![TaskId::new("a"), TaskId::new("b")]);
        assert_eq!(result.output(&TaskId::new("b")), Some(&json!({"task": "b", "upstream": ["a"]})));
        assert!(engine.active_executions().is_empty());
        assert!(engine.scheduler().resources().usage().is_idle());

        let status = engine.get_workflow_status(result.execution_id).unwrap();
        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(status.progress, 1.0);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_and_requires_review() {
        let engine = engine_with(standard_handlers());
        engine
            .register_workflow(workflow(
                "partial",
                vec![
                    task("bad", "fail"),
                    task("after", "echo").depends_on("bad"),
                    task("side", "echo"),
                ],
            ))
            .unwrap();

        let result = engine
            .execute_workflow(&WorkflowId::new("partial"), json!({}), ExecutionOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.requires_human_review);
        assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);
        assert_eq!(result.failed_tasks, vec![TaskId::new("bad")]);
        assert_eq!(result.cancelled_tasks, vec![TaskId::new("after")]);
        assert_eq!(result.completed_tasks, vec![TaskId::new("side")]);

        // 1 of 3 failed, above the default 0.3 threshold
        let alerts = engine.monitor().alerts_for(result.execution_id);
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == AlertType::Custom("failure_threshold_exceeded".into())));
    }

    #[tokio::test]
    async fn test_fail_fast_handling() {
        let engine = engine_with(standard_handlers());
        let mut wf = workflow("strict", vec![task("bad", "fail"), task("after", "echo").depends_on("bad")]);
        wf.config.timeout_handling = TimeoutHandling::Fail;
        engine.register_workflow(wf).unwrap();

        let result = engine
            .execute_workflow(&WorkflowId::new("strict"), json!({}), ExecutionOptions::default())
            .await;

        assert_eq!(result.final_state, WorkflowState::Failed);
        assert_eq!(result.cancelled_tasks, vec![TaskId::new("after")]);
    }

    #[tokio::test]
    async fn test_unknown_workflow_rejected() {
        let engine = engine_with(standard_handlers());
        let result = engine
            .execute_workflow(&WorkflowId::new("ghost"), json!({}), ExecutionOptions::default())
            .await;
        assert_eq!(result.final_state, WorkflowState::Failed);
        assert!(result.errors[0].contains("ghost"));
    }

    #[test]
    fn test_register_rejects_duplicate_and_invalid() {
        let reporter = Arc::new(MemoryReporter::new());
        let engine = Arc::into_inner(engine_with(standard_handlers()))
            .unwrap()
            .with_reporter(reporter.clone());

        engine.register_workflow(workflow("wf", vec![task("a", "echo")])).unwrap();
        assert!(matches!(
            engine.register_workflow(workflow("wf", vec![task("a", "echo")])),
            Err(EngineError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            engine.register_workflow(workflow("cyclic", vec![task("a", "echo").depends_on("a")])),
            Err(EngineError::Core(_))
        ));
        assert_eq!(engine.workflow_ids(), vec![WorkflowId::new("wf")]);
        assert_eq!(reporter.reports_from("engine").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_workflow() {
        let engine = engine_with(standard_handlers());
        engine
            .register_workflow(workflow("long", vec![task("wait", "slow"), task("then", "echo").depends_on("wait")]))
            .unwrap();

        let execution = ExecutionId::new();
        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_workflow(
                        &WorkflowId::new("long"),
                        json!({}),
                        ExecutionOptions::default().with_execution_id(execution),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            engine.get_workflow_status(execution).unwrap().running_tasks,
            vec![TaskId::new("wait")]
        );
        assert!(engine.cancel_workflow(execution, "user request"));
        assert!(!engine.cancel_workflow(execution, "again"));

        let result = run.await.unwrap();
        assert_eq!(result.final_state, WorkflowState::Cancelled);
        assert_eq!(result.cancelled_tasks, vec![TaskId::new("wait"), TaskId::new("then")]);
        assert!(engine.scheduler().resources().usage().is_idle());
        assert!(!engine.cancel_workflow(execution, "finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_deadline_fails_run() {
        let engine = engine_with(standard_handlers());
        let mut wf = workflow("late", vec![task("wait", "slow")]);
        wf.config.timeout = Duration::from_secs(1);
        engine.register_workflow(wf).unwrap();

        let result = engine
            .execute_workflow(&WorkflowId::new("late"), json!({}), ExecutionOptions::default())
            .await;

        assert_eq!(result.final_state, WorkflowState::Failed);
        assert_eq!(result.cancelled_tasks, vec![TaskId::new("wait")]);
        assert!(result.errors.iter().any(|e| e.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_active_runs() {
        let engine = engine_with(standard_handlers());
        engine
            .register_workflow(workflow("long", vec![task("wait", "slow")]))
            .unwrap();

        let run = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_workflow(&WorkflowId::new("long"), json!({}), ExecutionOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.shutdown(Duration::from_secs(1)).await);
        assert_eq!(run.await.unwrap().final_state, WorkflowState::Cancelled);

        let rejected = engine
            .execute_workflow(&WorkflowId::new("long"), json!({}), ExecutionOptions::default())
            .await;
        assert_eq!(rejected.final_state, WorkflowState::Failed);
        assert!(rejected.errors[0].contains("shutting down"));
    }
}
