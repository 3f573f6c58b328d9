//! Conductkit agent layer - Workflow execution and orchestration.
//!
//! This crate turns workflow definitions into concurrent, resource-aware
//! runs:
//!
//! - Handlers: one pluggable [`TaskHandler`] per task type
//! - Execution: per-attempt timeouts, retries with backoff, cooperative
//!   cancellation
//! - Scheduling: priority-ordered admission against a shared resource pool
//! - Engine: run lifecycle, status snapshots and structured results
//! - Orchestrator: component wiring, work prioritisation, graceful shutdown
//!
//! # Example
//!
//! ```rust,ignore
//! use conduct_agent::{FnHandler, TaskResult, WorkRequest, WorkflowOrchestrator, ProcessOptions};
//! use conduct_core::TaskType;
//!
//! let orchestrator = WorkflowOrchestrator::builder()
//!     .handler(TaskType::IssueAnalysis, Arc::new(FnHandler::new(|_ctx| async {
//!         Ok(TaskResult::success(json!({ "summary": "..." })))
//!     })))
//!     // ... one handler per task type ...
//!     .with_standard_pipeline()
//!     .build()?;
//!
//! let result = orchestrator
//!     .process_work(WorkRequest::new("42", "Crash on start"), ProcessOptions::default())
//!     .await;
//! ```

pub mod config;
pub mod orchestrator;
pub mod workflow;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{
    compute_priority, standard_pipeline, OrchestratorBuilder, OrchestratorError, OrchestratorMetrics, ProcessOptions,
    WorkRequest, WorkflowOrchestrator, STANDARD_PIPELINE,
};
pub use workflow::{
    load_workflow_file, load_workflow_str, EngineConfig, EngineError, ExecutionOptions, ExecutorConfig, FnHandler,
    HandlerRegistry, TaskContext, TaskError, TaskExecutor, TaskHandler, TaskResult, TaskScheduler, WorkflowBuilder,
    WorkflowEngine, WorkflowResult, WorkflowStatus,
};
