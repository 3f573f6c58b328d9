//! Workflow execution: handlers, executor, scheduler and engine.
//!
//! # Architecture
//!
//! - [`HandlerRegistry`]: binds each task type to a [`TaskHandler`]
//! - [`TaskExecutor`]: runs one task with per-attempt timeouts, retries and
//!   cancellation
//! - [`TaskScheduler`]: plans batches and admits ready tasks against the
//!   shared resource pool
//! - [`WorkflowEngine`]: drives runs, folding every outcome into a
//!   [`WorkflowResult`]
//!
//! Definitions come from [`WorkflowBuilder`] in code or from YAML through
//! [`load_workflow_file`].
//!
//! # Example
//!
//! ```ignore
//! let workflow = WorkflowBuilder::new("triage", "Issue triage")
//!     .task("analyze", "Analyze", TaskType::IssueAnalysis)
//!     .build()?;
//! engine.register_workflow(workflow)?;
//! let result = engine
//!     .execute_workflow(&WorkflowId::new("triage"), json!({}), ExecutionOptions::default())
//!     .await;
//! ```

pub mod builder;
pub mod cancellation;
pub mod context;
pub mod engine;
pub mod executor;
pub mod handler;
pub mod scheduler;
pub mod timeout;
pub mod yaml;

pub use builder::WorkflowBuilder;
pub use cancellation::{CancellationToken, CancellationTokenSource, ChildToken};
pub use context::{IllegalTransition, PhaseTiming, StateTransition, WorkflowExecutionContext, WorkflowResult, WorkflowStatus};
pub use engine::{EngineConfig, EngineError, ExecutionOptions, WorkflowEngine};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use handler::{FnHandler, HandlerRegistry, TaskContext, TaskError, TaskHandler, TaskResult};
pub use scheduler::{default_estimate, Admission, Schedule, ScheduledTask, TaskEstimate, TaskScheduler};
pub use timeout::{Deadline, TimeoutError};
pub use yaml::{load_workflow_file, load_workflow_str, YamlWorkflow, YamlWorkflowError};
