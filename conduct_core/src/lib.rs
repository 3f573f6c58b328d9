//! Conductkit core - workflow data model and planning primitives
//!
//! This crate holds everything the orchestration layers share and that does
//! not need an async runtime.
//!
//! # Overview
//!
//! - **Data model**: workflows, tasks, dependency edges, retry policies
//! - **Retry**: backoff computation and retryable-error classification
//! - **Resources**: a fixed cpu / memory / concurrency pool with what-if checks
//! - **Resolver**: topological ordering and cycle detection
//! - **Telemetry**: the single error-reporting seam
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use conduct_core::{DependencyResolver, Task, TaskType};
//!
//! let tasks = vec![
//!     Task::new("analyze", "Analyze issue", TaskType::IssueAnalysis),
//!     Task::new("resolve", "Resolve issue", TaskType::CodeResolution).depends_on("analyze"),
//! ];
//! let ordered = DependencyResolver::new().resolve_dependencies(&tasks, &[])?;
//! ```
//!
//! # Modules
//!
//! - [`types`]: Identifiers, task types, status enums
//! - [`error`]: Error type for all core operations
//! - [`task`]: Task, dependency and retry policy definitions
//! - [`workflow`]: Workflow definition and validation
//! - [`retry`]: Retry manager
//! - [`resources`]: Resource manager
//! - [`resolver`]: Dependency resolver
//! - [`telemetry`]: Error reporter trait and implementations
//! - [`logging`]: Subscriber initialisation

pub mod duration_ms;
pub mod error;
pub mod logging;
pub mod resolver;
pub mod resources;
pub mod retry;
pub mod task;
pub mod telemetry;
pub mod types;
pub mod workflow;

pub use error::{CoreError, Result};
pub use resolver::{DependencyGraph, DependencyResolver};
pub use resources::{
    AllocationKey, ResourceAllocation, ResourceManager, ResourcePoolConfig, ResourceUsage, Utilization,
};
pub use retry::{default_policy_for, is_retryable_error, ErrorPatterns, RetryDecision, RetryManager};
pub use task::{Dependency, DependencyKind, RetryPolicy, Task};
pub use telemetry::{ErrorReport, ErrorReporter, MemoryReporter, ReportLevel, SharedReporter, TracingReporter};
pub use types::{ExecutionId, Priority, TaskId, TaskStatus, TaskType, WorkflowId, WorkflowState};
pub use workflow::{TimeoutHandling, Workflow, WorkflowConfig};
