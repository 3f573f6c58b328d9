//! Workflow execution monitor.
//!
//! The monitor keeps one tracking record per in-flight run, evaluates alert
//! rules as state changes and task outcomes arrive, and computes insights
//! when a run reaches a terminal state. It is the canonical owner of
//! execution metrics; the engine queries it rather than keeping its own
//! counters.
//!
//! Alerts are retained in memory until resolved and are also broadcast to
//! every [`subscribe`](WorkflowMonitor::subscribe)r.

use crate::alert::{AlertAction, AlertId, AlertSeverity, AlertSpec, AlertType, WorkflowAlert};
use crate::metrics::{CounterKind, MonitorCounters, SystemMetrics, WorkflowExecutionMetrics};
use chrono::{DateTime, Utc};
use conduct_core::telemetry::{default_reporter, ErrorReport, SharedReporter};
use conduct_core::{ExecutionId, TaskId, TaskStatus, TaskType, WorkflowId, WorkflowState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Error type for monitor operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// No tracking record exists for the run
    #[error("Execution {0} is not tracked")]
    NotTracked(ExecutionId),

    /// The run is already being tracked
    #[error("Execution {0} is already tracked")]
    AlreadyTracked(ExecutionId),

    /// No alert with this id is retained
    #[error("Unknown alert {0}")]
    UnknownAlert(AlertId),

    /// The monitor has been shut down
    #[error("Monitor is shut down")]
    ShutDown,
}

/// Type alias for Result with MonitorError.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Thresholds and limits of the monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// A single task running longer than this raises a performance alert
    #[serde(with = "conduct_core::duration_ms")]
    pub slow_task_threshold: Duration,
    /// Buffer size of the alert broadcast channel
    pub alert_channel_capacity: usize,
    /// Oldest alerts are dropped beyond this many
    pub max_retained_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_task_threshold: Duration::from_secs(60),
            alert_channel_capacity: 256,
            max_retained_alerts: 1000,
        }
    }
}

/// Outcome of one task as reported to the monitor.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskMetrics {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub duration: Duration,
    pub attempts: u32,
    pub error: Option<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl TaskMetrics {
    pub fn new(task_id: TaskId, task_type: TaskType, status: TaskStatus, duration: Duration) -> Self {
        Self {
            task_id,
            task_type,
            status,
            duration,
            attempts: 1,
            error: None,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_cache(mut self, hits: u64, misses: u64) -> Self {
        self.cache_hits = hits;
        self.cache_misses = misses;
        self
    }
}

/// Analysis of a finished (or in-progress) run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInsights {
    pub execution_id: ExecutionId,
    /// 0 to 100
    pub efficiency: f64,
    /// 0 to 100
    pub performance_score: f64,
    pub success_rate: f64,
    pub failure_ratio: f64,
    pub error_count: u32,
    #[serde(with = "conduct_core::duration_ms")]
    pub execution_time: Duration,
    pub bottlenecks: Vec<String>,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Tracking record of one run.
#[derive(Clone, Debug)]
pub struct WorkflowTracking {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub total_tasks: usize,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub cancelled_tasks: Vec<TaskId>,
    pub slow_tasks: Vec<TaskId>,
    pub error_count: u32,
    pub retries: u32,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub resource_waits: u64,
    /// Set once the run reaches a terminal state
    pub execution_time: Option<Duration>,
    /// Set once the run reaches a terminal state
    pub insights: Option<WorkflowInsights>,
    started: Instant,
    task_time: Duration,
    finished_tasks: u32,
}

impl WorkflowTracking {
    fn new(execution_id: ExecutionId, workflow_id: WorkflowId, total_tasks: usize) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id,
            state: WorkflowState::Pending,
            total_tasks,
            started_at: now,
            last_update: now,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            cancelled_tasks: Vec::new(),
            slow_tasks: Vec::new(),
            error_count: 0,
            retries: 0,
            cache_hits: 0,
            cache_misses: 0,
            resource_waits: 0,
            execution_time: None,
            insights: None,
            started: Instant::now(),
            task_time: Duration::ZERO,
            finished_tasks: 0,
        }
    }

    /// Time since tracking began, frozen once the run is terminal.
    pub fn elapsed(&self) -> Duration {
        self.execution_time.unwrap_or_else(|| self.started.elapsed())
    }

    fn metrics(&self) -> WorkflowExecutionMetrics {
        let average_task_time = if self.finished_tasks == 0 {
            Duration::ZERO
        } else {
            self.task_time / self.finished_tasks
        };
        WorkflowExecutionMetrics {
            total_tasks: self.total_tasks,
            completed_tasks: self.completed_tasks.len(),
            failed_tasks: self.failed_tasks.len(),
            cancelled_tasks: self.cancelled_tasks.len(),
            retries: self.retries,
            error_count: self.error_count,
            average_task_time,
            total_execution_time: self.elapsed(),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            resource_waits: self.resource_waits,
        }
    }
}

/// Computes insights from a tracking record.
///
/// - `efficiency = min(100, success_rate*100 + max(0, 100 - errors*10))`
/// - `performance = 100 - time penalty - (1-success_rate)*40 - min(errors*10, 20)`
///   where the time penalty is 30 above 30s and 15 above 15s
pub fn compute_insights(record: &WorkflowTracking) -> WorkflowInsights {
    let metrics = record.metrics();
    let success_rate = metrics.success_rate();
    let failure_ratio = if record.total_tasks == 0 {
        0.0
    } else {
        record.failed_tasks.len() as f64 / record.total_tasks as f64
    };
    let errors = f64::from(record.error_count);
    let execution_time = record.elapsed();

    let efficiency = (success_rate * 100.0 + (100.0 - errors * 10.0).max(0.0)).min(100.0);

    let time_penalty = if execution_time > Duration::from_secs(30) {
        30.0
    } else if execution_time > Duration::from_secs(15) {
        15.0
    } else {
        0.0
    };
    let performance_score =
        (100.0 - time_penalty - (1.0 - success_rate) * 40.0 - (errors * 10.0).min(20.0)).max(0.0);

    let mut bottlenecks = Vec::new();
    let mut risk_factors = Vec::new();
    let mut recommendations = Vec::new();

    if failure_ratio > 0.3 {
        bottlenecks.push(format!(
            "{:.0}% of tasks failed",
            failure_ratio * 100.0
        ));
        recommendations.push("Review handlers and retry policies of the failing tasks".to_string());
    }
    if failure_ratio > 0.4 {
        risk_factors.push("Task failure ratio above 40%".to_string());
    }
    if record.error_count > 3 {
        bottlenecks.push(format!("{} errors during execution", record.error_count));
        recommendations.push("Investigate recurring errors before re-running".to_string());
    }
    if record.error_count > 2 {
        risk_factors.push(format!("Elevated error count ({})", record.error_count));
    }
    for task in &record.slow_tasks {
        bottlenecks.push(format!("Task {} exceeded the slow-task threshold", task));
    }
    if !record.slow_tasks.is_empty() {
        recommendations.push("Allocate more resources to slow tasks or split them".to_string());
    }
    if time_penalty >= 30.0 {
        recommendations.push("Enable parallel execution or raise max_parallel_tasks".to_string());
    }

    WorkflowInsights {
        execution_id: record.execution_id,
        efficiency,
        performance_score,
        success_rate,
        failure_ratio,
        error_count: record.error_count,
        execution_time,
        bottlenecks,
        risk_factors,
        recommendations,
    }
}

#[derive(Default)]
struct MonitorState {
    records: HashMap<ExecutionId, WorkflowTracking>,
    alerts: VecDeque<WorkflowAlert>,
}

/// Tracks workflow runs, raises alerts and aggregates metrics.
///
/// # Example
///
/// ```ignore
/// let monitor = WorkflowMonitor::new(MonitorConfig::default());
/// let mut alerts = monitor.subscribe()?;
/// monitor.track_workflow_execution(execution, &workflow.id, workflow.task_count())?;
/// monitor.update_workflow_state(execution, WorkflowState::Running, None)?;
/// ```
pub struct WorkflowMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    counters: MonitorCounters,
    alerts_tx: Mutex<Option<broadcast::Sender<WorkflowAlert>>>,
    reporter: SharedReporter,
    shut_down: AtomicBool,
}

impl WorkflowMonitor {
    /// Creates a monitor that reports errors to `tracing`.
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_reporter(config, default_reporter())
    }

    /// Creates a monitor with a custom error reporter.
    pub fn with_reporter(config: MonitorConfig, reporter: SharedReporter) -> Self {
        let (tx, _) = broadcast::channel(config.alert_channel_capacity.max(1));
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            counters: MonitorCounters::new(),
            alerts_tx: Mutex::new(Some(tx)),
            reporter,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Lifetime counters.
    pub fn counters(&self) -> &MonitorCounters {
        &self.counters
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(MonitorError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn not_tracked(&self, execution: ExecutionId, operation: &str) -> MonitorError {
        self.reporter.report(
            ErrorReport::new("monitor", operation, "execution is not tracked")
                .with("execution", execution.to_string()),
        );
        MonitorError::NotTracked(execution)
    }

    /// Subscribes to every alert raised from now on.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<WorkflowAlert>> {
        self.alerts_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(MonitorError::ShutDown)
    }

    /// Starts tracking a run.
    pub fn track_workflow_execution(&self, execution: ExecutionId, workflow_id: &WorkflowId, total_tasks: usize) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.state();
        if state.records.contains_key(&execution) {
            return Err(MonitorError::AlreadyTracked(execution));
        }
        state.records.insert(
            execution,
            WorkflowTracking::new(execution, workflow_id.clone(), total_tasks),
        );
        self.counters.record(CounterKind::WorkflowStarted);
        debug!(%execution, workflow = %workflow_id, total_tasks, "tracking started");
        Ok(())
    }

    /// Records a state change of a tracked run.
    ///
    /// Reaching a terminal state finalises the record exactly once:
    /// insights are computed, terminal alerts raised and counters bumped.
    ///
    /// # Returns
    ///
    /// - `Ok(true)` if the state was applied
    /// - `Ok(false)` if the run was already terminal (nothing happens)
    /// - `Err(MonitorError::NotTracked)` for an unknown run
    pub fn update_workflow_state(&self, execution: ExecutionId, new_state: WorkflowState, reason: Option<&str>) -> Result<bool> {
        let mut state = self.state();
        let Some(record) = state.records.get_mut(&execution) else {
            return Err(self.not_tracked(execution, "update_workflow_state"));
        };
        if record.state.is_terminal() {
            debug!(%execution, current = %record.state, ignored = %new_state, "update after terminal state ignored");
            return Ok(false);
        }

        record.state = new_state;
        record.last_update = Utc::now();
        debug!(%execution, state = %new_state, reason = reason.unwrap_or(""), "workflow state updated");

        if !new_state.is_terminal() {
            return Ok(true);
        }

        let elapsed = record.started.elapsed();
        record.execution_time = Some(elapsed);
        let insights = compute_insights(record);
        record.insights = Some(insights.clone());
        let workflow_id = record.workflow_id.clone();

        match new_state {
            WorkflowState::Completed => self.counters.record_completed_workflow(elapsed),
            WorkflowState::Cancelled => self.counters.record(CounterKind::WorkflowCancelled),
            _ => self.counters.record(CounterKind::WorkflowFailed),
        }

        let detail = reason.map(|r| format!(": {}", r)).unwrap_or_default();
        match new_state {
            WorkflowState::Failed => {
                let spec = AlertSpec::new(
                    AlertType::WorkflowFailed,
                    AlertSeverity::Critical,
                    format!("Workflow {} failed{}", workflow_id, detail),
                )
                .with_actions([AlertAction::Retry, AlertAction::Escalate]);
                self.push_alert(&mut state, execution, &workflow_id, spec);
            }
            WorkflowState::RequiresHumanReview => {
                let spec = AlertSpec::new(
                    AlertType::HumanReviewRequired,
                    AlertSeverity::Error,
                    format!("Workflow {} requires human review{}", workflow_id, detail),
                )
                .with_actions([AlertAction::Escalate, AlertAction::Retry, AlertAction::Ignore]);
                self.push_alert(&mut state, execution, &workflow_id, spec);
            }
            _ => {}
        }

        info!(
            %execution,
            workflow = %workflow_id,
            state = %new_state,
            elapsed_ms = elapsed.as_millis() as u64,
            efficiency = insights.efficiency,
            performance = insights.performance_score,
            "workflow finished"
        );
        Ok(true)
    }

    /// Records the outcome of one task and evaluates task-level alert rules.
    pub fn record_task_metrics(&self, execution: ExecutionId, metrics: TaskMetrics) -> Result<()> {
        let mut state = self.state();
        let Some(record) = state.records.get_mut(&execution) else {
            return Err(self.not_tracked(execution, "record_task_metrics"));
        };

        record.last_update = Utc::now();
        record.retries += metrics.attempts.saturating_sub(1);
        record.cache_hits += metrics.cache_hits;
        record.cache_misses += metrics.cache_misses;
        self.counters
            .record_n(CounterKind::TaskRetried, u64::from(metrics.attempts.saturating_sub(1)));

        let workflow_id = record.workflow_id.clone();
        let mut raised = Vec::new();

        match metrics.status {
            TaskStatus::Completed => {
                record.completed_tasks.push(metrics.task_id.clone());
                record.task_time += metrics.duration;
                record.finished_tasks += 1;
                self.counters.record_task(true, metrics.duration);
            }
            TaskStatus::Failed => {
                record.failed_tasks.push(metrics.task_id.clone());
                record.error_count += 1;
                record.task_time += metrics.duration;
                record.finished_tasks += 1;
                self.counters.record_task(false, metrics.duration);
                let error = metrics.error.as_deref().unwrap_or("unknown error");
                raised.push(
                    AlertSpec::new(
                        AlertType::TaskFailure,
                        AlertSeverity::Error,
                        format!(
                            "Task {} ({}) failed after {} attempt(s): {}",
                            metrics.task_id, metrics.task_type, metrics.attempts, error
                        ),
                    )
                    .for_task(metrics.task_id.clone())
                    .with_actions([AlertAction::Retry, AlertAction::Escalate, AlertAction::Ignore]),
                );
            }
            TaskStatus::Cancelled => {
                record.cancelled_tasks.push(metrics.task_id.clone());
            }
            _ => {}
        }

        if metrics.duration > self.config.slow_task_threshold {
            record.slow_tasks.push(metrics.task_id.clone());
            raised.push(
                AlertSpec::new(
                    AlertType::Performance,
                    AlertSeverity::Warning,
                    format!(
                        "Task {} took {}ms (threshold {}ms)",
                        metrics.task_id,
                        metrics.duration.as_millis(),
                        self.config.slow_task_threshold.as_millis()
                    ),
                )
                .for_task(metrics.task_id.clone())
                .with_actions([
                    AlertAction::Ignore,
                    AlertAction::Custom("increase_resources".to_string()),
                ]),
            );
        }

        for spec in raised {
            self.push_alert(&mut state, execution, &workflow_id, spec);
        }
        Ok(())
    }

    /// Counts a non-task error against a run.
    pub fn record_error(&self, execution: ExecutionId, message: &str) -> Result<()> {
        let mut state = self.state();
        let record = state
            .records
            .get_mut(&execution)
            .ok_or(MonitorError::NotTracked(execution))?;
        record.error_count += 1;
        record.last_update = Utc::now();
        debug!(%execution, error = message, "workflow error recorded");
        Ok(())
    }

    /// Counts one wait for resources against a run.
    pub fn record_resource_wait(&self, execution: ExecutionId) -> Result<()> {
        let mut state = self.state();
        let record = state
            .records
            .get_mut(&execution)
            .ok_or(MonitorError::NotTracked(execution))?;
        record.resource_waits += 1;
        Ok(())
    }

    /// Computes insights for a run.
    ///
    /// Terminal runs return the insights frozen at finalisation.
    pub fn generate_insights(&self, execution: ExecutionId) -> Result<WorkflowInsights> {
        let state = self.state();
        let record = state
            .records
            .get(&execution)
            .ok_or(MonitorError::NotTracked(execution))?;
        Ok(record
            .insights
            .clone()
            .unwrap_or_else(|| compute_insights(record)))
    }

    /// Aggregate metrics for one run.
    pub fn execution_metrics(&self, execution: ExecutionId) -> Result<WorkflowExecutionMetrics> {
        let state = self.state();
        state
            .records
            .get(&execution)
            .map(WorkflowTracking::metrics)
            .ok_or(MonitorError::NotTracked(execution))
    }

    /// Snapshot of a run's tracking record.
    pub fn tracking(&self, execution: ExecutionId) -> Option<WorkflowTracking> {
        self.state().records.get(&execution).cloned()
    }

    /// Returns true while the run is attached to the monitor.
    pub fn is_tracking(&self, execution: ExecutionId) -> bool {
        self.state().records.contains_key(&execution)
    }

    /// Detaches a run, returning its final record.
    ///
    /// Lifetime counters are unaffected; retained alerts stay until
    /// resolved.
    pub fn stop_tracking(&self, execution: ExecutionId) -> Option<WorkflowTracking> {
        let removed = self.state().records.remove(&execution);
        if removed.is_some() {
            debug!(%execution, "tracking stopped");
        }
        removed
    }

    /// Process-wide metrics over every run seen so far.
    pub fn get_system_metrics(&self) -> SystemMetrics {
        let state = self.state();
        let active_workflows = state
            .records
            .values()
            .filter(|r| !r.state.is_terminal())
            .count();
        let active_alerts = state.alerts.iter().filter(|a| a.is_active()).count();
        drop(state);

        let c = &self.counters;
        SystemMetrics {
            active_workflows,
            completed_workflows: c.count(CounterKind::WorkflowCompleted),
            failed_workflows: c.count(CounterKind::WorkflowFailed),
            cancelled_workflows: c.count(CounterKind::WorkflowCancelled),
            total_workflows: c.count(CounterKind::WorkflowStarted),
            average_execution_time: c.average_completed_time(),
            error_rate: c.error_rate(),
            tasks_completed: c.count(CounterKind::TaskCompleted),
            tasks_failed: c.count(CounterKind::TaskFailed),
            task_retries: c.count(CounterKind::TaskRetried),
            average_task_time: c.average_task_time(),
            alerts_raised: c.count(CounterKind::AlertRaised),
            active_alerts,
        }
    }

    /// Raises an alert against a tracked run.
    pub fn create_alert(&self, execution: ExecutionId, spec: AlertSpec) -> Result<WorkflowAlert> {
        self.ensure_running()?;
        let mut state = self.state();
        let workflow_id = state
            .records
            .get(&execution)
            .map(|r| r.workflow_id.clone())
            .ok_or(MonitorError::NotTracked(execution))?;
        Ok(self.push_alert(&mut state, execution, &workflow_id, spec))
    }

    fn push_alert(&self, state: &mut MonitorState, execution: ExecutionId, workflow_id: &WorkflowId, spec: AlertSpec) -> WorkflowAlert {
        let alert = WorkflowAlert {
            id: AlertId::new(),
            alert_type: spec.alert_type,
            severity: spec.severity,
            message: spec.message,
            workflow_id: workflow_id.clone(),
            execution_id: execution,
            task_id: spec.task_id,
            timestamp: Utc::now(),
            suggested_actions: spec.suggested_actions,
            acknowledged: false,
            resolved: false,
        };

        state.alerts.push_back(alert.clone());
        while state.alerts.len() > self.config.max_retained_alerts {
            state.alerts.pop_front();
        }
        self.counters.record(CounterKind::AlertRaised);
        debug!(%execution, alert = %alert.id, severity = ?alert.severity, "alert raised");

        if let Some(tx) = self
            .alerts_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            // no subscribers is fine
            let _ = tx.send(alert.clone());
        }
        alert
    }

    fn with_alert<F>(&self, id: AlertId, f: F) -> Result<()>
    where
        F: FnOnce(&mut WorkflowAlert),
    {
        let mut state = self.state();
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(MonitorError::UnknownAlert(id))?;
        f(alert);
        Ok(())
    }

    /// Marks an alert as seen.
    pub fn acknowledge_alert(&self, id: AlertId) -> Result<()> {
        self.with_alert(id, |a| a.acknowledged = true)
    }

    /// Marks an alert as handled; it no longer counts as active.
    pub fn resolve_alert(&self, id: AlertId) -> Result<()> {
        self.with_alert(id, |a| {
            a.acknowledged = true;
            a.resolved = true;
        })
    }

    /// Alerts not yet resolved, oldest first.
    pub fn active_alerts(&self) -> Vec<WorkflowAlert> {
        self.state()
            .alerts
            .iter()
            .filter(|a| a.is_active())
            .cloned()
            .collect()
    }

    /// Every retained alert of one run, oldest first.
    pub fn alerts_for(&self, execution: ExecutionId) -> Vec<WorkflowAlert> {
        self.state()
            .alerts
            .iter()
            .filter(|a| a.execution_id == execution)
            .cloned()
            .collect()
    }

    /// Stops accepting new runs, drops all tracking and closes the alert
    /// channel.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut state = self.state();
            let n = state.records.len();
            state.records.clear();
            n
        };
        self.alerts_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(dropped_records = dropped, "monitor shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
