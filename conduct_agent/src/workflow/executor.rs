//! Single-task execution with retry, timeout and cancellation.
//!
//! [`TaskExecutor::execute_task`] runs one task to a terminal outcome:
//!
//! 1. Reject if the executor is shutting down
//! 2. Look up the handler for the task type (missing handler is fatal)
//! 3. Run the handler's `validate`
//! 4. Up to `max_attempts` times, race the handler against the task
//!    timeout and the task's cancellation token, sleeping the
//!    [`RetryManager`] backoff between attempts
//!
//! Failures never escape as `Err`; they are folded into the returned
//! [`TaskResult`].

use crate::workflow::cancellation::ChildToken;
use crate::workflow::handler::{HandlerRegistry, TaskContext, TaskResult};
use crate::workflow::timeout::race_task;
use conduct_core::telemetry::default_reporter;
use conduct_core::{
    ErrorReport, ExecutionId, RetryDecision, RetryManager, RetryPolicy, SharedReporter, Task, TaskId, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Executor settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Add up to 10% random jitter to backoff delays
    pub enable_jitter: bool,
    /// How long `shutdown` waits for in-flight tasks by default
    #[serde(with = "conduct_core::duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enable_jitter: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

type InFlightMap = HashMap<ExecutionId, HashMap<TaskId, ChildToken>>;

/// Runs tasks through their registered handlers.
pub struct TaskExecutor {
    handlers: Arc<HandlerRegistry>,
    retry: RetryManager,
    reporter: SharedReporter,
    config: ExecutorConfig,
    in_flight: Mutex<InFlightMap>,
    shutting_down: AtomicBool,
    drained: Notify,
}

impl TaskExecutor {
    pub fn new(handlers: Arc<HandlerRegistry>, config: ExecutorConfig) -> Self {
        let retry = if config.enable_jitter {
            RetryManager::new()
        } else {
            RetryManager::without_jitter()
        };
        Self {
            handlers,
            retry,
            reporter: default_reporter(),
            config,
            in_flight: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Sends error reports to `reporter` instead of the tracing default.
    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Executes `task` until it succeeds, fails for good, or is cancelled.
    #[instrument(skip_all, fields(execution = %context.execution_id, task = %task.id, task_type = %task.task_type))]
    pub async fn execute_task(&self, task: &Task, mut context: TaskContext) -> TaskResult {
        let started = Instant::now();

        if self.is_shutting_down() {
            return settle(TaskResult::failure("executor is shutting down", false), 0, Vec::new(), started);
        }

        let Some(handler) = self.handlers.get(&task.task_type) else {
            let message = format!("no handler registered for task type '{}'", task.task_type);
            self.report(ErrorReport::new("executor", "execute_task", &message).fatal(), &context);
            return settle(TaskResult::failure(message, false), 0, Vec::new(), started);
        };

        if !handler.validate(&context).await {
            let message = format!("validation failed for task '{}'", task.id);
            self.report(ErrorReport::new("executor", "validate", &message), &context);
            return settle(TaskResult::failure(message, false), 0, Vec::new(), started);
        }

        let token = context.cancellation_token().clone();
        let _in_flight = self.track(context.execution_id, &task.id, token.clone());
        let policy = &task.retry_policy;
        let mut delays = Vec::new();
        let mut attempt = 0;

        let result = loop {
            if token.is_cancelled() {
                break TaskResult::aborted("task cancelled");
            }
            attempt += 1;
            context.attempt = attempt;
            debug!(attempt, max_attempts = policy.max_attempts, "starting attempt");

            let (error, timed_out) = tokio::select! {
                _ = token.cancelled() => break TaskResult::aborted("task cancelled"),
                outcome = race_task(&task.id, attempt, task.timeout, handler.execute(&context)) => match outcome {
                    Ok(Ok(result)) if result.success => break result,
                    Ok(Ok(result)) if !result.retryable => break result,
                    Ok(Ok(result)) => (
                        result.error.unwrap_or_else(|| "task reported failure".to_string()),
                        false,
                    ),
                    Ok(Err(err)) if !err.is_retryable() => break TaskResult::failure(err.to_string(), false),
                    Ok(Err(err)) => (err.to_string(), false),
                    Err(elapsed) => (elapsed.to_string(), true),
                },
            };

            self.report(
                ErrorReport::new("executor", "execute_task", &error)
                    .with("attempt", attempt)
                    .with("timed_out", timed_out),
                &context,
            );

            match self.decide(attempt, policy, &error, timed_out) {
                RetryDecision::Stop(reason) => {
                    debug!(%reason, "not retrying");
                    let mut result = TaskResult::failure(error, false);
                    result.timed_out = timed_out;
                    break result;
                }
                RetryDecision::Retry(delay) => {
                    debug!(attempt, ?delay, "backing off before retry");
                    tokio::select! {
                        _ = token.cancelled() => break TaskResult::aborted("task cancelled during backoff"),
                        _ = tokio::time::sleep(delay) => delays.push(delay),
                    }
                }
            }
        };

        settle(result, attempt, delays, started)
    }

    /// Timeouts are retryable regardless of the policy's error patterns.
    fn decide(&self, attempt: u32, policy: &RetryPolicy, error: &str, timed_out: bool) -> RetryDecision {
        if !timed_out {
            return self.retry.next_retry(attempt, policy, error);
        }
        if attempt >= policy.max_attempts {
            RetryDecision::Stop(format!("retry budget exhausted after {} attempt(s)", attempt))
        } else {
            RetryDecision::Retry(self.retry.calculate_delay(attempt, policy, None))
        }
    }

    /// Cancels one in-flight task. Returns false if it is not running.
    pub fn cancel_task(&self, execution: ExecutionId, task: &TaskId) -> bool {
        match self.lock().get(&execution).and_then(|tasks| tasks.get(task)) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight task of one run, returning how many.
    pub fn cancel_workflow_tasks(&self, execution: ExecutionId) -> usize {
        let in_flight = self.lock();
        let Some(tasks) = in_flight.get(&execution) else {
            return 0;
        };
        for token in tasks.values() {
            token.cancel();
        }
        tasks.len()
    }

    /// Number of tasks currently executing, across all runs.
    pub fn in_flight_count(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Tasks of one run that are currently executing.
    pub fn in_flight_tasks(&self, execution: ExecutionId) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self
            .lock()
            .get(&execution)
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default();
        tasks.sort();
        tasks
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks, cancels everything in flight and waits up to
    /// `timeout` for it to drain.
    ///
    /// Returns true if nothing was left running.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        let cancelled: usize = {
            let in_flight = self.lock();
            in_flight.values().flat_map(HashMap::values).for_each(ChildToken::cancel);
            in_flight.values().map(HashMap::len).sum()
        };
        debug!(cancelled, "executor shutting down");

        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let remaining = self.in_flight_count();
            if remaining == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                self.reporter.report(
                    ErrorReport::new(
                        "executor",
                        "shutdown",
                        format!("{} task(s) still in flight after {:?}", remaining, timeout),
                    )
                    .with("remaining", remaining),
                );
                return self.in_flight_count() == 0;
            }
        }
    }

    fn track(&self, execution: ExecutionId, task: &TaskId, token: ChildToken) -> InFlight<'_> {
        self.lock().entry(execution).or_default().insert(task.clone(), token);
        InFlight {
            executor: self,
            execution,
            task: task.clone(),
        }
    }

    fn untrack(&self, execution: ExecutionId, task: &TaskId) {
        {
            let mut in_flight = self.lock();
            if let Some(tasks) = in_flight.get_mut(&execution) {
                tasks.remove(task);
                if tasks.is_empty() {
                    in_flight.remove(&execution);
                }
            }
        }
        self.drained.notify_waiters();
    }

    fn report(&self, report: ErrorReport, context: &TaskContext) {
        self.reporter.report(
            report
                .with("execution", context.execution_id.to_string())
                .with("workflow", context.workflow_id.as_str())
                .with("task", context.task_id.as_str()),
        );
    }

    fn lock(&self) -> MutexGuard<'_, InFlightMap> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a task from the in-flight map when execution ends, including
/// when the executing future is dropped.
struct InFlight<'a> {
    executor: &'a TaskExecutor,
    execution: ExecutionId,
    task: TaskId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.executor.untrack(self.execution, &self.task);
    }
}

fn settle(mut result: TaskResult, attempts: u32, delays: Vec<Duration>, started: Instant) -> TaskResult {
    result.attempts = attempts;
    result.retry_delays = delays;
    result.duration = started.elapsed();
    result.status = if result.success {
        TaskStatus::Completed
    } else if result.status == TaskStatus::Cancelled {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Failed
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handler::{FnHandler, TaskError};
    use conduct_core::{MemoryReporter, ReportLevel, TaskType, WorkflowId};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn executor_with(task_type: TaskType, handler: Arc<dyn crate::workflow::TaskHandler>) -> (TaskExecutor, MemoryReporter) {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(task_type, handler);
        let reporter = MemoryReporter::new();
        let config = ExecutorConfig {
            enable_jitter: false,
            ..Default::default()
        };
        let executor = TaskExecutor::new(registry, config).with_reporter(Arc::new(reporter.clone()));
        (executor, reporter)
    }

    fn context(task: &Task, token: ChildToken) -> TaskContext {
        TaskContext::new(ExecutionId::new(), WorkflowId::new("wf"), task, token)
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1), 2.0)
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let handler = FnHandler::new(|_ctx: TaskContext| async { Ok(TaskResult::success(json!("done"))) });
        let (executor, reporter) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let task = Task::new("review", "Review", TaskType::CodeReview);

        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;

        assert!(result.success);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.attempts, 1);
        assert!(result.retry_delays.is_empty());
        assert!(reporter.reports().is_empty());
        assert_eq!(executor.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failures_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnHandler::new(move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(TaskResult::failure("service unavailable", true))
                } else {
                    Ok(TaskResult::success(json!(42)))
                }
            }
        });
        let (executor, reporter) = executor_with(TaskType::IssueAnalysis, Arc::new(handler));
        let task = Task::new("analyze", "Analyze", TaskType::IssueAnalysis).with_retry_policy(quick_policy(3));

        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;

        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(
            result.retry_delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reporter.reports_from("executor").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_not_retryable() {
        let handler = FnHandler::new(|_ctx: TaskContext| async { Err(TaskError::Failed("connection reset".into())) });
        let (executor, _) = executor_with(TaskType::PrCreation, Arc::new(handler));
        let task = Task::new("pr", "Open PR", TaskType::PrCreation).with_retry_policy(quick_policy(2));

        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;

        assert!(!result.success);
        assert!(!result.retryable);
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.retry_delays.len(), 1);
        assert!(result.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_non_retryable_result_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnHandler::new(move |_ctx: TaskContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(TaskResult::failure("invalid diff", false)) }
        });
        let (executor, _) = executor_with(TaskType::CodeResolution, Arc::new(handler));
        let task = Task::new("fix", "Fix", TaskType::CodeResolution);

        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_and_pattern_mismatch_stop() {
        let handler = FnHandler::new(|_ctx: TaskContext| async { Err(TaskError::Fatal("corrupt input".into())) });
        let (executor, _) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let task = Task::new("review", "Review", TaskType::CodeReview);
        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().contains("corrupt input"));

        let handler = FnHandler::new(|_ctx: TaskContext| async { Err(TaskError::Failed("syntax error".into())) });
        let (executor, _) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let task = Task::new("review", "Review", TaskType::CodeReview)
            .with_retry_policy(quick_policy(5).with_retryable_errors(["*timeout*"]));
        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = FnHandler::new(move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(TaskResult::success(json!(null)))
            }
        });
        let (executor, reporter) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let task = Task::new("review", "Review", TaskType::CodeReview)
            .with_timeout(Duration::from_millis(500))
            .with_retry_policy(quick_policy(2).with_retryable_errors(["*rate limit*"]));

        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;

        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(reporter
            .reports()
            .iter()
            .all(|r| r.metadata.get("timed_out") == Some(&json!(true))));
    }

    #[tokio::test]
    async fn test_missing_handler_is_fatal() {
        let handler = FnHandler::new(|_ctx: TaskContext| async { Ok(TaskResult::success(json!(null))) });
        let (executor, reporter) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let task = Task::new("gen", "Generate", TaskType::ArtifactGeneration);

        let result = executor.execute_task(&task, context(&task, ChildToken::detached())).await;

        assert!(!result.success);
        assert!(!result.retryable);
        assert_eq!(result.attempts, 0);
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].level, ReportLevel::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_task_interrupts_handler() {
        let handler = FnHandler::new(|_ctx: TaskContext| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(TaskResult::success(json!(null)))
        });
        let (executor, _) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let executor = Arc::new(executor);
        let task = Task::new("review", "Review", TaskType::CodeReview);
        let ctx = context(&task, ChildToken::detached());
        let execution = ctx.execution_id;

        let running = {
            let executor = executor.clone();
            let task = task.clone();
            tokio::spawn(async move { executor.execute_task(&task, ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.in_flight_tasks(execution), vec![TaskId::new("review")]);
        assert!(executor.cancel_task(execution, &TaskId::new("review")));

        let result = running.await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert!(!result.retryable);
        assert_eq!(executor.in_flight_count(), 0);
        assert!(!executor.cancel_task(execution, &TaskId::new("review")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_and_rejects() {
        let handler = FnHandler::new(|_ctx: TaskContext| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(TaskResult::success(json!(null)))
        });
        let (executor, _) = executor_with(TaskType::CodeReview, Arc::new(handler));
        let executor = Arc::new(executor);
        let task = Task::new("review", "Review", TaskType::CodeReview);

        let running = {
            let executor = executor.clone();
            let task = task.clone();
            let ctx = context(&task, ChildToken::detached());
            tokio::spawn(async move { executor.execute_task(&task, ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(executor.shutdown(Duration::from_secs(1)).await);
        assert!(running.await.unwrap().is_cancelled());

        let rejected = executor.execute_task(&task, context(&task, ChildToken::detached())).await;
        assert!(!rejected.success);
        assert_eq!(rejected.error.as_deref(), Some("executor is shutting down"));
    }
}
