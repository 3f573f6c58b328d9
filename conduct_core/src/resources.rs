//! Fixed-size CPU / memory / concurrency pool accounting.
//!
//! [`ResourceManager`] is the only shared mutable state on the scheduling
//! path. Every check-then-allocate happens under one mutex, so concurrent
//! callers can never over-admit. The what-if helpers operate on
//! [`ResourceUsage`] snapshots and never touch the live pool.

use crate::error::{CoreError, Result};
use crate::types::{ExecutionId, Priority, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Capacity of the resource pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Total cpu units
    pub total_cpu: u32,
    /// Total memory in MB
    pub total_memory: u64,
    /// Maximum number of tasks holding resources at once
    pub max_concurrent_tasks: usize,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            total_cpu: 8,
            total_memory: 8192,
            max_concurrent_tasks: 5,
        }
    }
}

/// Resource demand of one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Cpu units
    pub cpu: u32,
    /// Memory in MB
    pub memory: u64,
    /// Priority tier used for ordering
    #[serde(default)]
    pub priority: Priority,
}

impl ResourceAllocation {
    pub fn new(cpu: u32, memory: u64, priority: Priority) -> Self {
        Self { cpu, memory, priority }
    }
}

/// Key under which an allocation is held: one task of one run.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AllocationKey {
    pub execution: ExecutionId,
    pub task: TaskId,
}

impl AllocationKey {
    pub fn new(execution: ExecutionId, task: impl Into<TaskId>) -> Self {
        Self {
            execution,
            task: task.into(),
        }
    }
}

/// Point-in-time view of pool usage.
///
/// Also used as the scratch state for what-if simulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used_cpu: u32,
    pub used_memory: u64,
    pub active_tasks: usize,
    pub total_cpu: u32,
    pub total_memory: u64,
    pub max_concurrent_tasks: usize,
}

impl ResourceUsage {
    /// Cpu units not yet allocated.
    pub fn available_cpu(&self) -> u32 {
        self.total_cpu.saturating_sub(self.used_cpu)
    }

    /// Memory not yet allocated.
    pub fn available_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.used_memory)
    }

    /// Returns true when nothing is allocated.
    pub fn is_idle(&self) -> bool {
        self.used_cpu == 0 && self.used_memory == 0 && self.active_tasks == 0
    }

    fn admits(&self, demand: &ResourceAllocation) -> bool {
        self.active_tasks < self.max_concurrent_tasks
            && demand.cpu <= self.available_cpu()
            && demand.memory <= self.available_memory()
    }
}

/// Fractions of each pool dimension currently in use, in `0.0..=1.0`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub slots: f64,
}

#[derive(Default)]
struct PoolState {
    used_cpu: u32,
    used_memory: u64,
    allocations: HashMap<AllocationKey, ResourceAllocation>,
}

/// Thread-safe resource pool.
///
/// # Example
///
/// ```ignore
/// let pool = ResourceManager::new(ResourcePoolConfig::default());
/// let key = AllocationKey::new(execution, "review");
/// pool.allocate_resources(key.clone(), ResourceAllocation::new(2, 1024, Priority::Normal))?;
/// // ... run the task ...
/// pool.release_resources(&key);
/// ```
pub struct ResourceManager {
    config: ResourcePoolConfig,
    state: Mutex<PoolState>,
}

impl ResourceManager {
    /// Creates an empty pool with the given capacity.
    pub fn new(config: ResourcePoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns the pool capacity.
    pub fn config(&self) -> &ResourcePoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, state: &PoolState) -> ResourceUsage {
        ResourceUsage {
            used_cpu: state.used_cpu,
            used_memory: state.used_memory,
            active_tasks: state.allocations.len(),
            total_cpu: self.config.total_cpu,
            total_memory: self.config.total_memory,
            max_concurrent_tasks: self.config.max_concurrent_tasks,
        }
    }

    /// Returns true if `demand` could be satisfied by the empty pool.
    ///
    /// A demand failing this check can never be admitted, no matter how
    /// long the caller waits.
    pub fn fits_capacity(&self, demand: &ResourceAllocation) -> bool {
        self.config.max_concurrent_tasks > 0
            && demand.cpu <= self.config.total_cpu
            && demand.memory <= self.config.total_memory
    }

    /// Returns true if `demand` can be allocated from the live pool now.
    pub fn are_resources_available(&self, demand: &ResourceAllocation) -> bool {
        let state = self.state();
        self.snapshot(&state).admits(demand)
    }

    /// Atomically checks availability and reserves `demand` under `key`.
    ///
    /// Allocating an already-held key is a no-op, so a retried admission
    /// never double-counts.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the resources are now held under `key`
    /// - `Err(CoreError::ExceedsCapacity)` if the demand can never fit
    /// - `Err(CoreError::InsufficientResources)` if the pool is currently full
    pub fn allocate_resources(&self, key: AllocationKey, demand: ResourceAllocation) -> Result<()> {
        if !self.fits_capacity(&demand) {
            return Err(CoreError::ExceedsCapacity {
                task: key.task,
                cpu: demand.cpu,
                memory: demand.memory,
            });
        }

        let mut state = self.state();
        if state.allocations.contains_key(&key) {
            return Ok(());
        }
        if !self.snapshot(&state).admits(&demand) {
            return Err(CoreError::InsufficientResources(format!(
                "task {} (cpu {}, memory {})",
                key.task, demand.cpu, demand.memory
            )));
        }

        state.used_cpu += demand.cpu;
        state.used_memory += demand.memory;
        debug!(
            execution = %key.execution,
            task = %key.task,
            cpu = demand.cpu,
            memory = demand.memory,
            "resources allocated"
        );
        state.allocations.insert(key, demand);
        Ok(())
    }

    /// Returns the resources held under `key` to the pool.
    ///
    /// Releasing an unknown or already-released key does nothing; counters
    /// saturate at zero.
    pub fn release_resources(&self, key: &AllocationKey) -> Option<ResourceAllocation> {
        let mut state = self.state();
        let released = state.allocations.remove(key)?;
        state.used_cpu = state.used_cpu.saturating_sub(released.cpu);
        state.used_memory = state.used_memory.saturating_sub(released.memory);
        debug!(execution = %key.execution, task = %key.task, "resources released");
        Some(released)
    }

    /// Releases every allocation held by one run.
    ///
    /// # Returns
    ///
    /// The ids of the tasks whose resources were released.
    pub fn release_execution(&self, execution: ExecutionId) -> Vec<TaskId> {
        let mut state = self.state();
        let keys: Vec<AllocationKey> = state
            .allocations
            .keys()
            .filter(|k| k.execution == execution)
            .cloned()
            .collect();

        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(alloc) = state.allocations.remove(&key) {
                state.used_cpu = state.used_cpu.saturating_sub(alloc.cpu);
                state.used_memory = state.used_memory.saturating_sub(alloc.memory);
                released.push(key.task);
            }
        }
        released
    }

    /// Drops every allocation.
    pub fn release_all(&self) {
        let mut state = self.state();
        *state = PoolState::default();
    }

    /// Returns the allocation held under `key`, if any.
    pub fn allocation(&self, key: &AllocationKey) -> Option<ResourceAllocation> {
        self.state().allocations.get(key).copied()
    }

    /// Returns a snapshot of live usage.
    pub fn usage(&self) -> ResourceUsage {
        let state = self.state();
        self.snapshot(&state)
    }

    /// Returns a snapshot of an empty pool, the starting point for
    /// what-if planning.
    pub fn empty_usage(&self) -> ResourceUsage {
        self.snapshot(&PoolState::default())
    }

    /// Fraction of each pool dimension currently in use.
    pub fn utilization(&self) -> Utilization {
        let usage = self.usage();
        Utilization {
            cpu: ratio(usage.used_cpu as f64, usage.total_cpu as f64),
            memory: ratio(usage.used_memory as f64, usage.total_memory as f64),
            slots: ratio(usage.active_tasks as f64, usage.max_concurrent_tasks as f64),
        }
    }

    /// What-if check: would `demand` fit on top of `simulated` usage?
    ///
    /// Pure; the live pool is not consulted.
    pub fn can_allocate_resources(&self, simulated: &ResourceUsage, demand: &ResourceAllocation) -> bool {
        simulated.admits(demand)
    }

    /// What-if allocation: returns `simulated` with `demand` added.
    ///
    /// Pure; callers should check
    /// [`can_allocate_resources`](Self::can_allocate_resources) first.
    pub fn simulate_allocation(&self, simulated: &ResourceUsage, demand: &ResourceAllocation) -> ResourceUsage {
        ResourceUsage {
            used_cpu: simulated.used_cpu.saturating_add(demand.cpu),
            used_memory: simulated.used_memory.saturating_add(demand.memory),
            active_tasks: simulated.active_tasks + 1,
            ..simulated.clone()
        }
    }
}

fn ratio(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (used / total).min(1.0)
    }
}
