//! Dependency resolution and cycle detection.
//!
//! Task-declared dependencies and finish-to-start edges are merged into a
//! petgraph `DiGraph` whose edges point from prerequisite to dependent.
//! Ordering is a depth-first topological sort with three-color marking:
//! meeting a node that is still being visited means the graph has a cycle.

use crate::error::{CoreError, Result};
use crate::task::{Dependency, Task};
use crate::types::TaskId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Validated, acyclic dependency graph of one workflow.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    order: Vec<TaskId>,
    depth: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    /// Task ids in dependency order: every task after all of its
    /// prerequisites.
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    /// Direct prerequisites of a task.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Length of the longest prerequisite chain leading to `id`.
    pub fn depth_of(&self, id: &TaskId) -> usize {
        self.depth.get(id).copied().unwrap_or(0)
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<TaskId> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].clone())
            .collect();
        // petgraph yields neighbors newest-first
        out.reverse();
        out
    }
}

/// Orders tasks so that each runs after its prerequisites.
#[derive(Clone, Copy, Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Merges task-declared and edge-declared dependencies.
    ///
    /// Only finish-to-start edges contribute. Duplicates are removed while
    /// keeping first-seen order.
    ///
    /// # Returns
    ///
    /// - `Ok(map)` from every task id to its prerequisites
    /// - `Err(CoreError::MissingDependency)` if an id is unknown
    pub fn dependency_map(&self, tasks: &[Task], dependencies: &[Dependency]) -> Result<HashMap<TaskId, Vec<TaskId>>> {
        let mut map: HashMap<TaskId, Vec<TaskId>> = tasks
            .iter()
            .map(|t| (t.id.clone(), Vec::new()))
            .collect();

        let declared = tasks.iter().flat_map(|t| {
            t.dependencies
                .iter()
                .map(move |d| (t.id.clone(), d.clone()))
        });
        let edges = dependencies
            .iter()
            .filter(|d| d.is_finish_to_start())
            .map(|d| (d.task.clone(), d.depends_on.clone()));

        for (task, dep) in declared.chain(edges) {
            if !map.contains_key(&dep) {
                return Err(CoreError::MissingDependency { task, dependency: dep });
            }
            let Some(deps) = map.get_mut(&task) else {
                return Err(CoreError::InvalidWorkflow(format!(
                    "dependency edge references unknown task {}",
                    task
                )));
            };
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Ok(map)
    }

    /// Builds and validates the dependency graph.
    ///
    /// # Returns
    ///
    /// - `Ok(graph)` for an acyclic task set
    /// - `Err(CoreError::CycleDetected)` naming a task on the cycle
    /// - `Err(CoreError::MissingDependency)` for an unknown id
    pub fn build_graph(&self, tasks: &[Task], dependencies: &[Dependency]) -> Result<DependencyGraph> {
        let map = self.dependency_map(tasks, dependencies)?;

        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if index.contains_key(&task.id) {
                return Err(CoreError::DuplicateTask(task.id.clone()));
            }
            let idx = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), idx);
        }
        for task in tasks {
            for dep in &map[&task.id] {
                graph.update_edge(index[dep], index[&task.id], ());
            }
        }

        let order = topological_order(tasks, &map)?;

        let mut depth: HashMap<TaskId, usize> = HashMap::with_capacity(order.len());
        for id in &order {
            let d = map[id]
                .iter()
                .map(|dep| depth.get(dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.clone(), d);
        }

        Ok(DependencyGraph {
            graph,
            index,
            order,
            depth,
        })
    }

    /// Returns the tasks in an order where every task follows all of its
    /// dependencies.
    ///
    /// A cycle fails the whole call; no partial order is returned.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let ordered = DependencyResolver::new().resolve_dependencies(&tasks, &[])?;
    /// for task in &ordered {
    ///     println!("{}", task.id);
    /// }
    /// ```
    pub fn resolve_dependencies(&self, tasks: &[Task], dependencies: &[Dependency]) -> Result<Vec<Task>> {
        let graph = self.build_graph(tasks, dependencies)?;
        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
        Ok(graph
            .order()
            .iter()
            .filter_map(|id| by_id.get(id).map(|t| (*t).clone()))
            .collect())
    }
}

/// Iterative three-color DFS, visiting roots in declaration order.
fn topological_order(tasks: &[Task], map: &HashMap<TaskId, Vec<TaskId>>) -> Result<Vec<TaskId>> {
    let mut marks: HashMap<&TaskId, Mark> = tasks.iter().map(|t| (&t.id, Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(tasks.len());

    for root in tasks {
        if marks.get(&root.id) != Some(&Mark::Unvisited) {
            continue;
        }
        // (node, index of next dependency to visit)
        let mut stack: Vec<(&TaskId, usize)> = vec![(&root.id, 0)];
        marks.insert(&root.id, Mark::Visiting);

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let deps = &map[node];
            if next < deps.len() {
                frame.1 += 1;
                let dep = &deps[next];
                match marks.get(dep).copied().unwrap_or(Mark::Unvisited) {
                    Mark::Visiting => return Err(CoreError::CycleDetected(dep.clone())),
                    Mark::Visited => {}
                    Mark::Unvisited => {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Visited);
                order.push(node.clone());
                stack.pop();
            }
        }
    }
    Ok(order)
}
