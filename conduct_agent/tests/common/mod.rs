//! Shared helpers for the conduct_agent integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use conduct_agent::workflow::{
    EngineConfig, ExecutorConfig, HandlerRegistry, TaskContext, TaskError, TaskExecutor, TaskHandler, TaskResult,
    TaskScheduler, WorkflowEngine,
};
use conduct_core::{MemoryReporter, ResourceManager, ResourcePoolConfig};
use conduct_runtime::{MonitorConfig, WorkflowMonitor};
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything a scenario needs to inspect after a run.
pub struct Harness {
    pub engine: Arc<WorkflowEngine>,
    pub resources: Arc<ResourceManager>,
    pub monitor: Arc<WorkflowMonitor>,
    pub reporter: Arc<MemoryReporter>,
}

/// Builds an engine over `handlers` with jitter disabled.
pub fn harness(handlers: HandlerRegistry, pool: ResourcePoolConfig) -> Harness {
    let reporter = Arc::new(MemoryReporter::new());
    let resources = Arc::new(ResourceManager::new(pool));
    let executor = TaskExecutor::new(
        Arc::new(handlers),
        ExecutorConfig {
            enable_jitter: false,
            ..ExecutorConfig::default()
        },
    )
    .with_reporter(reporter.clone());
    let monitor = Arc::new(WorkflowMonitor::with_reporter(MonitorConfig::default(), reporter.clone()));
    let engine = WorkflowEngine::new(
        Arc::new(TaskScheduler::new(resources.clone())),
        Arc::new(executor),
        monitor.clone(),
        EngineConfig::default(),
    )
    .with_reporter(reporter.clone());

    Harness {
        engine: Arc::new(engine),
        resources,
        monitor,
        reporter,
    }
}

/// Ordered log of task starts, shared between handlers and assertions.
#[derive(Clone, Default)]
pub struct StartLog(Arc<Mutex<Vec<String>>>);

impl StartLog {
    pub fn push(&self, id: &str) {
        self.0.lock().unwrap().push(id.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == id)
    }
}

/// Logs each start, sleeps, then succeeds. Tracks peak concurrency.
#[derive(Clone, Default)]
pub struct LoggingHandler {
    pub log: StartLog,
    pub delay: Duration,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl LoggingHandler {
    pub fn new(log: StartLog, delay: Duration) -> Self {
        Self {
            log,
            delay,
            ..Self::default()
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn execute(&self, context: &TaskContext) -> Result<TaskResult, TaskError> {
        self.log.push(context.task_id.as_str());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskResult::success(json!({ "task": context.task_id.as_str() })))
    }
}

/// Fails with a retryable result `failures` times, then succeeds.
pub struct FlakyHandler {
    remaining: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn execute(&self, _context: &TaskContext) -> Result<TaskResult, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Ok(TaskResult::failure("service unavailable", true));
        }
        Ok(TaskResult::success(json!("recovered")))
    }
}

/// Sleeps far longer than any timeout used in the tests.
pub struct HangingHandler;

#[async_trait]
impl TaskHandler for HangingHandler {
    async fn execute(&self, _context: &TaskContext) -> Result<TaskResult, TaskError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(TaskResult::success(json!(null)))
    }
}
