//! End-to-end engine scenarios.

mod common;

use common::{harness, FlakyHandler, HangingHandler, LoggingHandler, StartLog};
use conduct_agent::workflow::{EngineError, ExecutionOptions, HandlerRegistry};
use conduct_core::{
    ExecutionId, ResourcePoolConfig, RetryPolicy, Task, TaskId, TaskType, Workflow, WorkflowId, WorkflowState,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn custom(name: &str) -> TaskType {
    TaskType::Custom(name.to_string())
}

fn workflow(id: &str, tasks: Vec<Task>) -> Workflow {
    let mut wf = Workflow::new(id, id);
    wf.tasks = tasks;
    wf
}

fn ids(list: &[TaskId]) -> HashSet<&str> {
    list.iter().map(|t| t.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_completes_in_dependency_order() {
    let log = StartLog::default();
    let handlers = HandlerRegistry::new();
    handlers.register(custom("step"), Arc::new(LoggingHandler::new(log.clone(), Duration::from_millis(20))));
    let h = harness(handlers, ResourcePoolConfig::default());

    h.engine
        .register_workflow(workflow(
            "fan_out",
            vec![
                Task::new("a", "A", custom("step")),
                Task::new("b", "B", custom("step")).depends_on("a"),
                Task::new("c", "C", custom("step")).depends_on("a"),
            ],
        ))
        .unwrap();

    let result = h
        .engine
        .execute_workflow(&WorkflowId::new("fan_out"), json!({}), ExecutionOptions::default())
        .await;

    assert!(result.success);
    assert_eq!(result.final_state, WorkflowState::Completed);
    assert_eq!(ids(&result.completed_tasks), HashSet::from(["a", "b", "c"]));
    assert_eq!(log.position("a"), Some(0));
    assert_eq!(result.metrics.completed_tasks, 3);
    assert!(h.resources.usage().is_idle());
    assert!(h.reporter.reports().is_empty());
}

#[tokio::test]
async fn test_cycle_rejected_before_any_task_runs() {
    let log = StartLog::default();
    let handlers = HandlerRegistry::new();
    handlers.register(custom("step"), Arc::new(LoggingHandler::new(log.clone(), Duration::ZERO)));
    let h = harness(handlers, ResourcePoolConfig::default());

    let err = h
        .engine
        .register_workflow(workflow(
            "cyclic",
            vec![
                Task::new("a", "A", custom("step")).depends_on("b"),
                Task::new("b", "B", custom("step")).depends_on("a"),
            ],
        ))
        .unwrap_err();
    assert!(matches!(err, EngineError::Core(conduct_core::CoreError::CycleDetected(_))));

    let result = h
        .engine
        .execute_workflow(&WorkflowId::new("cyclic"), json!({}), ExecutionOptions::default())
        .await;
    assert_eq!(result.final_state, WorkflowState::Failed);
    assert!(log.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_then_success() {
    let flaky = Arc::new(FlakyHandler::new(2));
    let handlers = HandlerRegistry::new();
    handlers.register(custom("flaky"), flaky.clone());
    let h = harness(handlers, ResourcePoolConfig::default());

    let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1), 2.0);
    h.engine
        .register_workflow(workflow(
            "flaky",
            vec![Task::new("call", "Call", custom("flaky")).with_retry_policy(policy)],
        ))
        .unwrap();

    let result = h
        .engine
        .execute_workflow(&WorkflowId::new("flaky"), json!({}), ExecutionOptions::default())
        .await;

    assert!(result.success);
    let call = &result.task_results[&TaskId::new("call")];
    assert_eq!(call.attempts, 3);
    assert_eq!(
        call.retry_delays,
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.output(&TaskId::new("call")), Some(&json!("recovered")));
    assert_eq!(result.metrics.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_is_retryable_failure() {
    let handlers = HandlerRegistry::new();
    handlers.register(custom("hang"), Arc::new(HangingHandler));
    let h = harness(handlers, ResourcePoolConfig::default());

    let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1), 2.0)
        .with_retryable_errors(["rate limit*"]);
    h.engine
        .register_workflow(workflow(
            "slow",
            vec![Task::new("hang", "Hang", custom("hang"))
                .with_retry_policy(policy)
                .with_timeout(Duration::from_secs(1))],
        ))
        .unwrap();

    let result = h
        .engine
        .execute_workflow(&WorkflowId::new("slow"), json!({}), ExecutionOptions::default())
        .await;

    let hang = &result.task_results[&TaskId::new("hang")];
    assert!(hang.timed_out);
    // The timeout was retried even though no pattern matches it.
    assert_eq!(hang.attempts, 2);
    assert_eq!(hang.retry_delays, vec![Duration::from_millis(100)]);
    assert!(hang.error.as_deref().unwrap().contains("timed out after 1s"));
    assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);

    let timeouts = h
        .reporter
        .reports_from("executor")
        .into_iter()
        .filter(|r| r.metadata.get("timed_out") == Some(&json!(true)))
        .count();
    assert_eq!(timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_releases_resources_and_stops_admission() {
    let log = StartLog::default();
    let handlers = HandlerRegistry::new();
    handlers.register(custom("hang"), Arc::new(HangingHandler));
    handlers.register(custom("step"), Arc::new(LoggingHandler::new(log.clone(), Duration::ZERO)));
    let h = harness(handlers, ResourcePoolConfig::default());

    h.engine
        .register_workflow(workflow(
            "two_active",
            vec![
                Task::new("a", "A", custom("hang")),
                Task::new("b", "B", custom("hang")),
                Task::new("c", "C", custom("step")).depends_on("a").depends_on("b"),
            ],
        ))
        .unwrap();

    let execution = ExecutionId::new();
    let run = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .execute_workflow(
                    &WorkflowId::new("two_active"),
                    json!({}),
                    ExecutionOptions::default().with_execution_id(execution),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.resources.usage().active_tasks, 2);
    assert!(h.monitor.is_tracking(execution));

    assert!(h.engine.cancel_workflow(execution, "operator request"));
    assert!(h.resources.usage().is_idle());

    let result = run.await.unwrap();
    assert_eq!(result.final_state, WorkflowState::Cancelled);
    assert_eq!(ids(&result.cancelled_tasks), HashSet::from(["a", "b", "c"]));
    assert!(log.entries().is_empty());
    assert!(h.resources.usage().is_idle());
    assert!(!h.monitor.is_tracking(execution));
}

#[tokio::test(start_paused = true)]
async fn test_pool_limits_concurrency_across_runs() {
    let log = StartLog::default();
    let handler = LoggingHandler::new(log.clone(), Duration::from_millis(50));
    let handlers = HandlerRegistry::new();
    handlers.register(custom("step"), Arc::new(handler.clone()));
    let h = harness(
        handlers,
        ResourcePoolConfig {
            max_concurrent_tasks: 2,
            ..ResourcePoolConfig::default()
        },
    );

    h.engine
        .register_workflow(workflow(
            "wide",
            vec![
                Task::new("a", "A", custom("step")),
                Task::new("b", "B", custom("step")),
                Task::new("c", "C", custom("step")),
            ],
        ))
        .unwrap();

    let runs: Vec<_> = (0..3)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .execute_workflow(&WorkflowId::new("wide"), json!({}), ExecutionOptions::default())
                    .await
            })
        })
        .collect();

    for run in runs {
        assert!(run.await.unwrap().success);
    }
    assert_eq!(log.entries().len(), 9);
    assert!(handler.peak() <= 2);
    assert!(h.resources.usage().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_execution_releases_its_run() {
    let log = StartLog::default();
    let handlers = HandlerRegistry::new();
    handlers.register(custom("hang"), Arc::new(HangingHandler));
    handlers.register(custom("step"), Arc::new(LoggingHandler::new(log.clone(), Duration::ZERO)));
    let h = harness(handlers, ResourcePoolConfig::default());

    h.engine
        .register_workflow(workflow(
            "stuck",
            vec![
                Task::new("hang", "Hang", custom("hang")),
                Task::new("after", "After", custom("step")).depends_on("hang"),
            ],
        ))
        .unwrap();
    h.engine
        .register_workflow(workflow("quick", vec![Task::new("step", "Step", custom("step"))]))
        .unwrap();

    let execution = ExecutionId::new();
    let stuck_id = WorkflowId::new("stuck");
    let run = h.engine.execute_workflow(
        &stuck_id,
        json!({}),
        ExecutionOptions::default().with_execution_id(execution),
    );
    assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());

    assert!(h.resources.usage().is_idle());
    assert!(h.engine.active_executions().is_empty());
    assert!(!h.monitor.is_tracking(execution));
    let status = h.engine.get_workflow_status(execution).unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);

    // The detached handler observes the cancellation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.executor().in_flight_count(), 0);
    assert!(log.entries().is_empty());

    let rerun = h
        .engine
        .execute_workflow(
            &WorkflowId::new("quick"),
            json!({}),
            ExecutionOptions::default().with_execution_id(execution),
        )
        .await;
    assert!(rerun.success, "errors: {:?}", rerun.errors);
}
