//! Pluggable task handlers.
//!
//! The engine never performs domain work itself: every [`TaskType`] is
//! bound to a [`TaskHandler`] in a [`HandlerRegistry`], and the executor
//! dispatches each task to the handler registered for its type.

use crate::workflow::cancellation::ChildToken;
use async_trait::async_trait;
use conduct_core::{ExecutionId, Task, TaskId, TaskStatus, TaskType, WorkflowId};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Everything a handler sees about the task it is running.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// 1-based attempt number, set by the executor
    pub attempt: u32,
    /// Input the run was started with
    pub input: Arc<Value>,
    /// Task metadata from the workflow definition
    pub metadata: serde_json::Map<String, Value>,
    /// Outputs of completed dependencies, keyed by task id
    pub dependency_outputs: HashMap<TaskId, Value>,
    cancellation: ChildToken,
}

impl TaskContext {
    /// Builds the context for `task` in run `execution_id`.
    pub fn new(execution_id: ExecutionId, workflow_id: WorkflowId, task: &Task, cancellation: ChildToken) -> Self {
        Self {
            execution_id,
            workflow_id,
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            attempt: 0,
            input: Arc::new(Value::Null),
            metadata: task.metadata.clone(),
            dependency_outputs: HashMap::new(),
            cancellation,
        }
    }

    pub fn with_input(mut self, input: Arc<Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_dependency_outputs(mut self, outputs: HashMap<TaskId, Value>) -> Self {
        self.dependency_outputs = outputs;
        self
    }

    /// Token handlers may poll or await to stop early.
    pub fn cancellation_token(&self) -> &ChildToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Outcome of running a task.
///
/// Handlers build one with [`success`](Self::success) or
/// [`failure`](Self::failure); the executor then fills in attempts,
/// backoff delays, duration and the final status.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskResult {
    pub success: bool,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Whether another attempt may succeed
    pub retryable: bool,
    /// The last attempt hit the task timeout
    pub timed_out: bool,
    pub attempts: u32,
    /// Every backoff delay actually awaited
    pub retry_delays: Vec<Duration>,
    pub duration: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl TaskResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            retryable: false,
            timed_out: false,
            attempts: 0,
            retry_delays: Vec::new(),
            duration: Duration::ZERO,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            retryable,
            ..Self::success(Value::Null)
        }
    }

    /// A run that was stopped by cancellation.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            ..Self::failure(reason, false)
        }
    }

    /// Records handler-side cache usage.
    pub fn with_cache(mut self, hits: u64, misses: u64) -> Self {
        self.cache_hits = hits;
        self.cache_misses = misses;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == TaskStatus::Cancelled
    }
}

/// Error raised by a handler.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// Handler failed; retried if the message is retryable under the policy
    #[error("Task execution failed: {0}")]
    Failed(String),

    /// Handler failed in a way no retry can fix
    #[error("Fatal task error: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Only [`TaskError::Fatal`] is exempt from retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Fatal(_))
    }
}

/// Executes tasks of one type.
///
/// # Example
///
/// ```ignore
/// struct Review;
///
/// #[async_trait]
/// impl TaskHandler for Review {
///     async fn execute(&self, ctx: &TaskContext) -> Result<TaskResult, TaskError> {
///         let diff = ctx.dependency_outputs.get(&TaskId::new("resolve"));
///         Ok(TaskResult::success(json!({ "approved": diff.is_some() })))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, context: &TaskContext) -> Result<TaskResult, TaskError>;

    /// Pre-flight check; a `false` fails the task without retry.
    async fn validate(&self, _context: &TaskContext) -> bool {
        true
    }
}

/// Handler built from an async closure.
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskResult, TaskError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskResult, TaskError>> + Send,
{
    async fn execute(&self, context: &TaskContext) -> Result<TaskResult, TaskError> {
        (self.f)(context.clone()).await
    }
}

/// Thread-safe map from task type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `task_type`, returning the handler it replaced.
    pub fn register(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_type, handler)
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered task types, sorted by name.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort_by(|a, b| a.name().cmp(b.name()));
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
