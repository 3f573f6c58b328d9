//! Error and telemetry sink.
//!
//! Every component reports its errors, fatal or not, through one
//! [`ErrorReporter`]. This is the seam where observability is attached:
//! [`TracingReporter`] forwards reports to `tracing`, [`MemoryReporter`]
//! keeps them for inspection in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// How bad a reported error is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    /// The operation or run was aborted
    Fatal,
    /// Recovered from, or absorbed into a result
    NonFatal,
}

/// One error report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Reporting component, e.g. `"executor"`
    pub component: String,
    /// Operation that failed, e.g. `"execute_task"`
    pub operation: String,
    pub message: String,
    pub level: ReportLevel,
    /// Free-form context (execution id, task id, attempt...)
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    /// Creates a non-fatal report timestamped now.
    pub fn new(component: impl Into<String>, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            level: ReportLevel::NonFatal,
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Marks the report fatal.
    pub fn fatal(mut self) -> Self {
        self.level = ReportLevel::Fatal;
        self
    }

    /// Attaches a metadata entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Narrow sink for error reports.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Shared handle to a reporter.
pub type SharedReporter = Arc<dyn ErrorReporter>;

/// Reporter that emits each report as a `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        let metadata = serde_json::Value::Object(report.metadata);
        match report.level {
            ReportLevel::Fatal => tracing::error!(
                component = %report.component,
                operation = %report.operation,
                metadata = %metadata,
                "{}",
                report.message
            ),
            ReportLevel::NonFatal => tracing::warn!(
                component = %report.component,
                operation = %report.operation,
                metadata = %metadata,
                "{}",
                report.message
            ),
        }
    }
}

/// Reporter that stores reports in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryReporter {
    reports: Arc<Mutex<Vec<ErrorReport>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every report received so far.
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reports from one component.
    pub fn reports_from(&self, component: &str) -> Vec<ErrorReport> {
        self.reports()
            .into_iter()
            .filter(|r| r.component == component)
            .collect()
    }
}

impl ErrorReporter for MemoryReporter {
    fn report(&self, report: ErrorReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }
}

/// Returns the default reporter.
pub fn default_reporter() -> SharedReporter {
    Arc::new(TracingReporter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reporter_collects() {
        let reporter = MemoryReporter::new();
        let shared: SharedReporter = Arc::new(reporter.clone());

        shared.report(ErrorReport::new("executor", "execute_task", "boom").with("task", "a"));
        shared.report(ErrorReport::new("engine", "execute_workflow", "blocked").fatal());

        let all = reporter.reports();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].metadata.get("task"), Some(&serde_json::json!("a")));
        assert_eq!(reporter.reports_from("engine")[0].level, ReportLevel::Fatal);
    }

    #[test]
    fn test_tracing_reporter_does_not_panic() {
        TracingReporter.report(ErrorReport::new("monitor", "update", "late update").with("attempt", 2));
    }
}
