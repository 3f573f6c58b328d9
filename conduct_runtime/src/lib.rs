//! Conductkit runtime layer - Workflow monitoring and alerting.
//!
//! This crate provides the observation side of workflow execution:
//!
//! - Per-run tracking records and state history
//! - Alert rules, retention and a broadcast subscription channel
//! - Insights computed when a run reaches a terminal state
//! - Lifetime and per-run execution metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use conduct_runtime::{MonitorConfig, WorkflowMonitor};
//!
//! let monitor = WorkflowMonitor::new(MonitorConfig::default());
//! let mut alerts = monitor.subscribe()?;
//! tokio::spawn(async move {
//!     while let Ok(alert) = alerts.recv().await {
//!         println!("{:?}: {}", alert.severity, alert.message);
//!     }
//! });
//! ```

pub mod alert;
pub mod metrics;
pub mod monitor;

pub use alert::{AlertAction, AlertId, AlertSeverity, AlertSpec, AlertType, WorkflowAlert};
pub use metrics::{CounterKind, MonitorCounters, SystemMetrics, WorkflowExecutionMetrics};
pub use monitor::{
    compute_insights, MonitorConfig, MonitorError, TaskMetrics, WorkflowInsights, WorkflowMonitor,
    WorkflowTracking,
};
