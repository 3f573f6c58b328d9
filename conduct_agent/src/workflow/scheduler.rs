//! Static schedule planning and runtime admission.
//!
//! Planning ([`TaskScheduler::register_workflow`]) simulates the run on an
//! empty resource pool to produce a [`Schedule`]: batches of at most
//! [`MAX_BATCH_SIZE`] tasks, chosen greedily by priority tier and then by
//! shortest estimated duration.
//!
//! Admission ([`TaskScheduler::get_next_tasks`]) works on the live pool:
//! a task is handed out only when every dependency has completed and its
//! demand fits, cumulatively, next to everything already running.

use conduct_core::{
    AllocationKey, CoreError, DependencyResolver, ExecutionId, Priority, ResourceAllocation, ResourceManager, Result,
    Task, TaskId, TaskType, Workflow, WorkflowId,
};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on tasks planned into one simulated batch.
pub const MAX_BATCH_SIZE: usize = 3;

/// Weight of the newest observation in the duration moving average.
const EMA_WEIGHT: f64 = 0.3;

/// Points added to a task's score for every task that depends on it.
const DEPENDENT_BONUS: u32 = 5;

/// Expected cost of running a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TaskEstimate {
    #[serde(with = "conduct_core::duration_ms")]
    pub duration: Duration,
    pub cpu: u32,
    /// Memory in MB
    pub memory: u64,
    pub priority: Priority,
}

impl TaskEstimate {
    /// Resource demand implied by the estimate.
    pub fn demand(&self) -> ResourceAllocation {
        ResourceAllocation::new(self.cpu, self.memory, self.priority)
    }
}

/// Built-in estimate for a task type.
pub fn default_estimate(task_type: &TaskType) -> TaskEstimate {
    let (secs, cpu, memory, priority) = match task_type {
        TaskType::IssueAnalysis => (30, 2, 512, Priority::High),
        TaskType::CodeResolution => (120, 4, 2048, Priority::High),
        TaskType::CodeReview => (60, 2, 1024, Priority::Normal),
        TaskType::ArtifactGeneration => (45, 2, 1024, Priority::Normal),
        TaskType::PrCreation => (20, 1, 256, Priority::Critical),
        TaskType::Custom(_) => (30, 1, 512, Priority::Normal),
    };
    TaskEstimate {
        duration: Duration::from_secs(secs),
        cpu,
        memory,
        priority,
    }
}

/// A task placed in a schedule.
#[derive(Clone, Debug, Serialize)]
pub struct ScheduledTask {
    pub task: Task,
    pub estimate: TaskEstimate,
    /// Tier weight plus a bonus per dependent
    pub priority_score: u32,
    /// Offset from the start of the run in the simulated plan
    #[serde(with = "conduct_core::duration_ms")]
    pub planned_start: Duration,
    /// Index of the simulated batch the task was planned into
    pub batch: usize,
    /// Direct dependencies, edge-declared ones included
    pub dependencies: Vec<TaskId>,
}

impl ScheduledTask {
    pub fn id(&self) -> &TaskId {
        &self.task.id
    }
}

/// Result of static planning.
#[derive(Clone, Debug, Serialize)]
pub struct Schedule {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    /// Tasks in planned order, batch by batch
    pub tasks: Vec<ScheduledTask>,
    pub batches: usize,
    /// Simulated makespan
    #[serde(with = "conduct_core::duration_ms")]
    pub total_time: Duration,
    /// Largest batch
    pub max_parallelism: usize,
    pub peak_cpu: u32,
    pub peak_memory: u64,
}

impl Schedule {
    pub fn task(&self, id: &TaskId) -> Option<&ScheduledTask> {
        self.tasks.iter().find(|t| &t.task.id == id)
    }

    /// Task ids grouped by batch.
    pub fn batch_ids(&self) -> Vec<Vec<TaskId>> {
        let mut batches = vec![Vec::new(); self.batches];
        for task in &self.tasks {
            batches[task.batch].push(task.task.id.clone());
        }
        batches
    }
}

/// Tasks handed out by one admission round.
#[derive(Clone, Debug, Default)]
pub struct Admission {
    pub tasks: Vec<ScheduledTask>,
    /// Ready tasks held back because resources ran out
    pub resource_blocked: usize,
}

struct RunState {
    schedule: Schedule,
    /// Indices into `schedule.tasks`, highest priority first
    admission_order: Vec<usize>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    active: HashMap<TaskId, Instant>,
}

impl RunState {
    fn is_settled(&self, id: &TaskId) -> bool {
        self.completed.contains(id) || self.failed.contains(id) || self.active.contains_key(id)
    }
}

/// Plans workflows and admits their tasks against a shared resource pool.
pub struct TaskScheduler {
    resources: Arc<ResourceManager>,
    resolver: DependencyResolver,
    estimates: Mutex<HashMap<TaskType, TaskEstimate>>,
    runs: Mutex<HashMap<ExecutionId, RunState>>,
    shut_down: AtomicBool,
}

impl TaskScheduler {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self {
            resources,
            resolver: DependencyResolver::new(),
            estimates: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Estimate for `task`: learned or built-in figures for its type,
    /// overridden by the `priority`, `cpu`, `memory` and
    /// `estimated_duration_ms` metadata keys.
    pub fn estimate_for(&self, task: &Task) -> TaskEstimate {
        let mut estimate = self
            .lock_estimates()
            .get(&task.task_type)
            .copied()
            .unwrap_or_else(|| default_estimate(&task.task_type));

        let meta = &task.metadata;
        if let Some(priority) = meta.get("priority").and_then(|v| v.as_str()).and_then(Priority::parse) {
            estimate.priority = priority;
        }
        if let Some(cpu) = meta.get("cpu").and_then(|v| v.as_u64()).and_then(|v| u32::try_from(v).ok()) {
            estimate.cpu = cpu;
        }
        if let Some(memory) = meta.get("memory").and_then(|v| v.as_u64()) {
            estimate.memory = memory;
        }
        if let Some(ms) = meta.get("estimated_duration_ms").and_then(|v| v.as_u64()) {
            estimate.duration = Duration::from_millis(ms);
        }
        estimate
    }

    /// Plans `workflow` for run `execution` and keeps the plan for
    /// admission.
    ///
    /// # Returns
    ///
    /// - `Ok(schedule)` on success
    /// - `Err(CoreError::CycleDetected)` if no task can ever become ready
    /// - `Err(CoreError::ExceedsCapacity)` if a task cannot fit even an
    ///   empty pool
    pub fn register_workflow(&self, execution: ExecutionId, workflow: &Workflow) -> Result<Schedule> {
        if self.is_shut_down() {
            return Err(CoreError::ShutDown("scheduler".to_string()));
        }
        if self.lock_runs().contains_key(&execution) {
            return Err(CoreError::InvalidWorkflow(format!(
                "execution {} is already scheduled",
                execution
            )));
        }

        let schedule = self.plan(execution, workflow)?;
        let mut admission_order: Vec<usize> = (0..schedule.tasks.len()).collect();
        admission_order.sort_by_key(|&i| {
            let t = &schedule.tasks[i];
            (Reverse(t.priority_score), t.planned_start, i)
        });

        debug!(
            %execution,
            workflow = %workflow.id,
            batches = schedule.batches,
            total_time = ?schedule.total_time,
            "workflow scheduled"
        );

        self.lock_runs().insert(
            execution,
            RunState {
                schedule: schedule.clone(),
                admission_order,
                completed: HashSet::new(),
                failed: HashSet::new(),
                active: HashMap::new(),
            },
        );
        Ok(schedule)
    }

    fn plan(&self, execution: ExecutionId, workflow: &Workflow) -> Result<Schedule> {
        let graph = self.resolver.build_graph(&workflow.tasks, &workflow.dependencies)?;
        let by_id: HashMap<&TaskId, &Task> = workflow.tasks.iter().map(|t| (&t.id, t)).collect();

        let mut entries = Vec::with_capacity(graph.len());
        for id in graph.order() {
            let Some(task) = by_id.get(id) else {
                continue;
            };
            let estimate = self.estimate_for(task);
            if !self.resources.fits_capacity(&estimate.demand()) {
                return Err(CoreError::ExceedsCapacity {
                    task: id.clone(),
                    cpu: estimate.cpu,
                    memory: estimate.memory,
                });
            }
            let dependents = u32::try_from(graph.dependents_of(id).len()).unwrap_or(u32::MAX);
            entries.push(ScheduledTask {
                task: task.fresh_copy(),
                estimate,
                priority_score: estimate.priority.weight().saturating_add(dependents.saturating_mul(DEPENDENT_BONUS)),
                planned_start: Duration::ZERO,
                batch: 0,
                dependencies: graph.dependencies_of(id),
            });
        }

        let mut remaining: Vec<usize> = (0..entries.len()).collect();
        let mut scheduled: HashSet<TaskId> = HashSet::with_capacity(entries.len());
        let mut planned = Vec::with_capacity(entries.len());
        let mut time = Duration::ZERO;
        let mut batches = 0;
        let (mut max_parallelism, mut peak_cpu, mut peak_memory) = (0, 0, 0);

        while !remaining.is_empty() {
            let mut ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| entries[i].dependencies.iter().all(|d| scheduled.contains(d)))
                .collect();
            let Some(&first) = remaining.first() else {
                break;
            };
            if ready.is_empty() {
                return Err(CoreError::CycleDetected(entries[first].task.id.clone()));
            }
            ready.sort_by_key(|&i| (Reverse(entries[i].estimate.priority), entries[i].estimate.duration, i));

            let mut simulated = self.resources.empty_usage();
            let mut batch = Vec::new();
            for i in ready.iter().copied() {
                if batch.len() == MAX_BATCH_SIZE {
                    break;
                }
                let demand = entries[i].estimate.demand();
                if self.resources.can_allocate_resources(&simulated, &demand) {
                    simulated = self.resources.simulate_allocation(&simulated, &demand);
                    batch.push(i);
                }
            }
            // Each batch starts from an empty pool and every demand passed
            // `fits_capacity`, so there is no later time step worth waiting for.
            if batch.is_empty() {
                let i = ready[0];
                return Err(CoreError::ExceedsCapacity {
                    task: entries[i].task.id.clone(),
                    cpu: entries[i].estimate.cpu,
                    memory: entries[i].estimate.memory,
                });
            }

            max_parallelism = max_parallelism.max(batch.len());
            peak_cpu = peak_cpu.max(simulated.used_cpu);
            peak_memory = peak_memory.max(simulated.used_memory);

            let step = batch
                .iter()
                .map(|&i| entries[i].estimate.duration)
                .min()
                .unwrap_or_default();
            for &i in &batch {
                let mut entry = entries[i].clone();
                entry.planned_start = time;
                entry.batch = batches;
                scheduled.insert(entry.task.id.clone());
                planned.push(entry);
            }
            remaining.retain(|i| !batch.contains(i));
            time += step;
            batches += 1;
        }

        let total_time = planned
            .iter()
            .map(|t: &ScheduledTask| t.planned_start + t.estimate.duration)
            .max()
            .unwrap_or_default();

        Ok(Schedule {
            execution_id: execution,
            workflow_id: workflow.id.clone(),
            tasks: planned,
            batches,
            total_time,
            max_parallelism,
            peak_cpu,
            peak_memory,
        })
    }

    /// Up to `max_tasks` tasks that may start now.
    pub fn get_next_tasks(&self, execution: ExecutionId, max_tasks: usize) -> Result<Vec<ScheduledTask>> {
        self.poll_ready(execution, max_tasks).map(|admission| admission.tasks)
    }

    /// Like [`get_next_tasks`](Self::get_next_tasks), also reporting how
    /// many ready tasks were held back for lack of resources.
    pub fn poll_ready(&self, execution: ExecutionId, max_tasks: usize) -> Result<Admission> {
        let runs = self.lock_runs();
        let run = runs.get(&execution).ok_or(CoreError::UnknownExecution(execution))?;

        let mut admission = Admission::default();
        let mut simulated = self.resources.usage();
        for &i in &run.admission_order {
            let candidate = &run.schedule.tasks[i];
            if run.is_settled(candidate.id()) {
                continue;
            }
            if !candidate.dependencies.iter().all(|d| run.completed.contains(d)) {
                continue;
            }
            if admission.tasks.len() >= max_tasks {
                break;
            }
            let demand = candidate.estimate.demand();
            if self.resources.can_allocate_resources(&simulated, &demand) {
                simulated = self.resources.simulate_allocation(&simulated, &demand);
                admission.tasks.push(candidate.clone());
            } else {
                admission.resource_blocked += 1;
            }
        }
        Ok(admission)
    }

    /// Reserves resources for a task that is about to run.
    ///
    /// Starting a task that is already active is a no-op.
    pub fn mark_task_started(&self, execution: ExecutionId, task: &TaskId) -> Result<()> {
        let mut runs = self.lock_runs();
        let run = runs.get_mut(&execution).ok_or(CoreError::UnknownExecution(execution))?;
        if run.active.contains_key(task) {
            return Ok(());
        }
        let scheduled = run
            .schedule
            .task(task)
            .ok_or_else(|| CoreError::InvalidWorkflow(format!("task {} is not part of the schedule", task)))?;

        self.resources
            .allocate_resources(AllocationKey::new(execution, task.clone()), scheduled.estimate.demand())?;
        run.active.insert(task.clone(), Instant::now());
        debug!(%execution, %task, "task started");
        Ok(())
    }

    /// Releases a finished task's resources and folds its observed
    /// duration into the estimate for its type.
    ///
    /// Returns the observed duration if the task was active.
    pub fn mark_task_completed(&self, execution: ExecutionId, task: &TaskId) -> Result<Option<Duration>> {
        let (task_type, observed) = {
            let mut runs = self.lock_runs();
            let run = runs.get_mut(&execution).ok_or(CoreError::UnknownExecution(execution))?;
            self.resources.release_resources(&AllocationKey::new(execution, task.clone()));
            run.completed.insert(task.clone());
            let observed = run.active.remove(task).map(|started| started.elapsed());
            let task_type = run.schedule.task(task).map(|t| t.task.task_type.clone());
            (task_type, observed)
        };

        if let (Some(task_type), Some(observed)) = (task_type, observed) {
            let mut estimates = self.lock_estimates();
            let entry = estimates
                .entry(task_type.clone())
                .or_insert_with(|| default_estimate(&task_type));
            entry.duration = entry.duration.mul_f64(1.0 - EMA_WEIGHT) + observed.mul_f64(EMA_WEIGHT);
        }
        Ok(observed)
    }

    /// Records a task as failed or cancelled and releases its resources.
    ///
    /// Tasks depending on it will never be admitted.
    pub fn mark_task_failed(&self, execution: ExecutionId, task: &TaskId) -> Result<()> {
        let mut runs = self.lock_runs();
        let run = runs.get_mut(&execution).ok_or(CoreError::UnknownExecution(execution))?;
        self.resources.release_resources(&AllocationKey::new(execution, task.clone()));
        run.active.remove(task);
        run.failed.insert(task.clone());
        Ok(())
    }

    /// Pending tasks that can never run because a dependency, directly or
    /// transitively, failed.
    pub fn unreachable_tasks(&self, execution: ExecutionId) -> Result<Vec<TaskId>> {
        let runs = self.lock_runs();
        let run = runs.get(&execution).ok_or(CoreError::UnknownExecution(execution))?;

        let mut doomed: HashSet<&TaskId> = run.failed.iter().collect();
        let mut unreachable = Vec::new();
        // Planned order lists every task after its dependencies.
        for candidate in &run.schedule.tasks {
            let id = candidate.id();
            if run.is_settled(id) {
                continue;
            }
            if candidate.dependencies.iter().any(|d| doomed.contains(d)) {
                doomed.insert(id);
                unreachable.push(id.clone());
            }
        }
        Ok(unreachable)
    }

    /// Tasks currently holding resources for a run.
    pub fn active_tasks(&self, execution: ExecutionId) -> Vec<TaskId> {
        let mut active: Vec<TaskId> = self
            .lock_runs()
            .get(&execution)
            .map(|run| run.active.keys().cloned().collect())
            .unwrap_or_default();
        active.sort();
        active
    }

    /// The plan for a run, if it is still scheduled.
    pub fn schedule(&self, execution: ExecutionId) -> Option<Schedule> {
        self.lock_runs().get(&execution).map(|run| run.schedule.clone())
    }

    pub fn is_scheduled(&self, execution: ExecutionId) -> bool {
        self.lock_runs().contains_key(&execution)
    }

    /// Drops a run's schedule and releases everything it holds.
    ///
    /// Returns the tasks whose resources were released.
    pub fn cancel_workflow_tasks(&self, execution: ExecutionId) -> Vec<TaskId> {
        let removed = self.lock_runs().remove(&execution);
        let released = self.resources.release_execution(execution);
        if removed.is_some() {
            debug!(%execution, released = released.len(), "schedule dropped");
        }
        released
    }

    /// Drops every schedule and releases all resources.
    ///
    /// Returns the number of runs that were still scheduled.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);
        let dropped = {
            let mut runs = self.lock_runs();
            let count = runs.len();
            runs.clear();
            count
        };
        self.resources.release_all();
        debug!(dropped, "scheduler shut down");
        dropped
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<ExecutionId, RunState>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_estimates(&self) -> MutexGuard<'_, HashMap<TaskType, TaskEstimate>> {
        self.estimates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduct_core::{Dependency, ResourcePoolConfig};
    use serde_json::json;

    fn scheduler(cpu: u32, memory: u64, slots: usize) -> TaskScheduler {
        TaskScheduler::new(Arc::new(ResourceManager::new(ResourcePoolConfig {
            total_cpu: cpu,
            total_memory: memory,
            max_concurrent_tasks: slots,
        })))
    }

    fn custom(id: &str) -> Task {
        Task::new(id, id, TaskType::Custom("step".into()))
    }

    fn workflow(tasks: Vec<Task>) -> Workflow {
        let mut wf = Workflow::new("wf", "Workflow");
        wf.tasks = tasks;
        wf
    }

    #[test]
    fn test_estimate_table_and_overrides() {
        let s = scheduler(8, 8192, 5);
        let review = Task::new("r", "Review", TaskType::CodeReview);
        assert_eq!(s.estimate_for(&review), default_estimate(&TaskType::CodeReview));

        let tuned = review
            .with_metadata("priority", json!("critical"))
            .with_metadata("cpu", json!(3))
            .with_metadata("memory", json!(128))
            .with_metadata("estimated_duration_ms", json!(1500));
        let estimate = s.estimate_for(&tuned);
        assert_eq!(estimate.priority, Priority::Critical);
        assert_eq!(estimate.cpu, 3);
        assert_eq!(estimate.memory, 128);
        assert_eq!(estimate.duration, Duration::from_millis(1500));
    }

    #[test]
    fn test_plan_batches_by_priority_then_duration() {
        let s = scheduler(8, 8192, 5);
        let wf = workflow(vec![
            Task::new("analyze", "Analyze", TaskType::IssueAnalysis),
            Task::new("fix", "Fix", TaskType::CodeResolution).depends_on("analyze"),
            Task::new("review", "Review", TaskType::CodeReview).depends_on("fix"),
            Task::new("docs", "Docs", TaskType::ArtifactGeneration).depends_on("fix"),
            Task::new("pr", "PR", TaskType::PrCreation).depends_on("review"),
        ]);

        let schedule = s.register_workflow(ExecutionId::new(), &wf).unwrap();

        assert_eq!(schedule.batches, 4);
        assert_eq!(
            schedule.batch_ids(),
            vec![
                vec![TaskId::new("analyze")],
                vec![TaskId::new("fix")],
                // same tier, shorter first
                vec![TaskId::new("docs"), TaskId::new("review")],
                vec![TaskId::new("pr")],
            ]
        );
        assert_eq!(schedule.max_parallelism, 2);
        assert_eq!(schedule.task(&TaskId::new("fix")).unwrap().planned_start, Duration::from_secs(30));
        // pr starts once the shorter docs step has elapsed
        assert_eq!(schedule.total_time, Duration::from_secs(30 + 120 + 45 + 20));
        // two dependents on fix
        assert_eq!(schedule.task(&TaskId::new("fix")).unwrap().priority_score, 30 + 10);
    }

    #[test]
    fn test_plan_caps_batch_size() {
        let s = scheduler(64, 65536, 10);
        let wf = workflow((0..7).map(|i| custom(&format!("t{}", i))).collect());

        let schedule = s.register_workflow(ExecutionId::new(), &wf).unwrap();

        assert_eq!(schedule.batches, 3);
        assert!(schedule.batch_ids().iter().all(|b| b.len() <= MAX_BATCH_SIZE));
        assert_eq!(schedule.max_parallelism, MAX_BATCH_SIZE);
    }

    #[test]
    fn test_plan_respects_pool() {
        let s = scheduler(4, 8192, 5);
        let wf = workflow((0..3).map(|i| custom(&format!("t{}", i)).with_metadata("cpu", json!(2))).collect());

        let schedule = s.register_workflow(ExecutionId::new(), &wf).unwrap();

        assert_eq!(schedule.batches, 2);
        assert_eq!(schedule.peak_cpu, 4);
    }

    #[test]
    fn test_plan_task_filling_pool_gets_own_batch() {
        let s = scheduler(4, 8192, 5);
        let wf = workflow(vec![
            custom("full").with_metadata("cpu", json!(4)),
            custom("small_a").with_metadata("cpu", json!(1)),
            custom("small_b").with_metadata("cpu", json!(1)),
        ]);

        let schedule = s.register_workflow(ExecutionId::new(), &wf).unwrap();

        assert_eq!(
            schedule.batch_ids(),
            vec![
                vec![TaskId::new("full")],
                vec![TaskId::new("small_a"), TaskId::new("small_b")],
            ]
        );
        assert_eq!(schedule.peak_cpu, 4);
    }

    #[test]
    fn test_register_rejects_cycle_and_oversized_task() {
        let s = scheduler(4, 1024, 2);
        let mut cyclic = workflow(vec![custom("a"), custom("b")]);
        cyclic.dependencies = vec![
            Dependency::finish_to_start("a", "b"),
            Dependency::finish_to_start("b", "a"),
        ];
        assert!(matches!(
            s.register_workflow(ExecutionId::new(), &cyclic),
            Err(CoreError::CycleDetected(_))
        ));

        let huge = workflow(vec![custom("big").with_metadata("cpu", json!(16))]);
        assert!(matches!(
            s.register_workflow(ExecutionId::new(), &huge),
            Err(CoreError::ExceedsCapacity { cpu: 16, .. })
        ));
    }

    #[test]
    fn test_admission_waits_for_dependencies() {
        let s = scheduler(8, 8192, 5);
        let exec = ExecutionId::new();
        let wf = workflow(vec![custom("a"), custom("b").depends_on("a"), custom("c").depends_on("a")]);
        s.register_workflow(exec, &wf).unwrap();

        let first = s.get_next_tasks(exec, 3).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id(), &TaskId::new("a"));

        s.mark_task_started(exec, &TaskId::new("a")).unwrap();
        assert!(s.get_next_tasks(exec, 3).unwrap().is_empty());

        s.mark_task_completed(exec, &TaskId::new("a")).unwrap();
        let next: Vec<TaskId> = s.get_next_tasks(exec, 3).unwrap().iter().map(|t| t.id().clone()).collect();
        assert_eq!(next, vec![TaskId::new("b"), TaskId::new("c")]);
        assert_eq!(s.get_next_tasks(exec, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_admission_counts_live_usage_cumulatively() {
        let s = scheduler(4, 8192, 5);
        let exec = ExecutionId::new();
        let wf = workflow((0..3).map(|i| custom(&format!("t{}", i)).with_metadata("cpu", json!(2))).collect());
        s.register_workflow(exec, &wf).unwrap();

        let admission = s.poll_ready(exec, 3).unwrap();
        assert_eq!(admission.tasks.len(), 2);
        assert_eq!(admission.resource_blocked, 1);

        for task in &admission.tasks {
            s.mark_task_started(exec, task.id()).unwrap();
        }
        let admission = s.poll_ready(exec, 3).unwrap();
        assert!(admission.tasks.is_empty());
        assert_eq!(admission.resource_blocked, 1);
        assert_eq!(s.active_tasks(exec).len(), 2);
    }

    #[test]
    fn test_failure_makes_dependents_unreachable() {
        let s = scheduler(8, 8192, 5);
        let exec = ExecutionId::new();
        let wf = workflow(vec![
            custom("a"),
            custom("b").depends_on("a"),
            custom("c").depends_on("b"),
            custom("d"),
        ]);
        s.register_workflow(exec, &wf).unwrap();

        s.mark_task_started(exec, &TaskId::new("a")).unwrap();
        s.mark_task_failed(exec, &TaskId::new("a")).unwrap();

        assert_eq!(
            s.unreachable_tasks(exec).unwrap(),
            vec![TaskId::new("b"), TaskId::new("c")]
        );
        let next: Vec<TaskId> = s.get_next_tasks(exec, 3).unwrap().iter().map(|t| t.id().clone()).collect();
        assert_eq!(next, vec![TaskId::new("d")]);
        assert!(s.resources().usage().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_refines_estimate() {
        let s = scheduler(8, 8192, 5);
        let exec = ExecutionId::new();
        s.register_workflow(exec, &workflow(vec![custom("a")])).unwrap();

        s.mark_task_started(exec, &TaskId::new("a")).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let observed = s.mark_task_completed(exec, &TaskId::new("a")).unwrap();

        assert_eq!(observed, Some(Duration::from_secs(10)));
        let learned = s.estimate_for(&custom("other")).duration;
        // 0.7 * 30s + 0.3 * 10s
        assert!((learned.as_secs_f64() - 24.0).abs() < 1e-6);
    }

    #[test]
    fn test_cancel_releases_and_drops_schedule() {
        let s = scheduler(8, 8192, 5);
        let exec = ExecutionId::new();
        s.register_workflow(exec, &workflow(vec![custom("a"), custom("b")])).unwrap();
        s.mark_task_started(exec, &TaskId::new("a")).unwrap();
        s.mark_task_started(exec, &TaskId::new("b")).unwrap();

        let mut released = s.cancel_workflow_tasks(exec);
        released.sort();

        assert_eq!(released, vec![TaskId::new("a"), TaskId::new("b")]);
        assert!(s.resources().usage().is_idle());
        assert!(!s.is_scheduled(exec));
        assert!(matches!(s.get_next_tasks(exec, 1), Err(CoreError::UnknownExecution(_))));
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let s = scheduler(8, 8192, 5);
        s.register_workflow(ExecutionId::new(), &workflow(vec![custom("a")])).unwrap();

        assert_eq!(s.shutdown(), 1);
        assert!(matches!(
            s.register_workflow(ExecutionId::new(), &workflow(vec![custom("a")])),
            Err(CoreError::ShutDown(_))
        ));
    }
}
