//! Dependency analysis for the task DAG
//!
//! Builds forward and reverse dependency graphs from a set of subtasks,
//! rejects cycles and dangling references, and derives the structural
//! information the scheduler relies on: topological layers, root-to-sink
//! paths, and per-task canonical paths.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::types::{Subtask, TaskId};

/// Result of analyzing a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Topological layers: `parallel_groups[0]` holds tasks with no
    /// predecessors, each later layer depends only on earlier ones.
    pub parallel_groups: Vec<Vec<TaskId>>,
    /// All simple root-to-sink paths, deduplicated, in discovery order.
    pub dependency_paths: Vec<Vec<TaskId>>,
    /// Canonical root-to-task path per task. Fan-in tasks merge the union
    /// of their predecessors so downstream planning sees full context.
    pub task_paths: HashMap<TaskId, Vec<TaskId>>,
    /// Longest dependency chain length (0 for independent tasks).
    pub max_depth: usize,
    /// Number of tasks with no dependencies.
    pub independent_tasks: usize,
}

/// Analyzes task dependencies and extracts execution structure.
#[derive(Debug)]
pub struct DependencyAnalyzer {
    /// Task IDs in Stage-1 ordinal order; keeps layer ordering stable
    order: Vec<TaskId>,
    /// task -> its dependencies
    deps: HashMap<TaskId, Vec<TaskId>>,
    /// task -> tasks that depend on it
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl DependencyAnalyzer {
    /// Build the analyzer from a set of subtasks. Fails when a dependency
    /// references a task that is not part of the set.
    pub fn new(subtasks: &[Subtask]) -> Result<Self, PlanError> {
        let order: Vec<TaskId> = subtasks.iter().map(|t| t.id.clone()).collect();
        let known: HashSet<&str> = order.iter().map(|id| id.as_str()).collect();

        let mut deps: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

        for task in subtasks {
            for dep in &task.dependencies {
                if !known.contains(dep.as_str()) {
                    return Err(PlanError::DanglingDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.id.clone());
            }
            deps.insert(task.id.clone(), task.dependencies.clone());
        }

        Ok(Self {
            order,
            deps,
            dependents,
        })
    }

    /// Analyze the graph: reject cycles, then derive layers, paths and depth.
    pub fn analyze(&self) -> Result<Analysis, PlanError> {
        if let Some(cycle) = self.find_cycle() {
            tracing::error!(cycle = ?cycle, "dependency cycle detected");
            return Err(PlanError::Cycle(cycle));
        }

        let parallel_groups = self.parallel_groups();
        let dependency_paths = self.dependency_paths();
        let task_paths = self.task_paths(&dependency_paths);
        let max_depth = self.max_depth();
        let independent_tasks = self
            .order
            .iter()
            .filter(|id| self.deps.get(*id).map(Vec::is_empty).unwrap_or(true))
            .count();

        tracing::debug!(
            tasks = self.order.len(),
            paths = dependency_paths.len(),
            groups = parallel_groups.len(),
            max_depth,
            "dependency analysis complete"
        );

        Ok(Analysis {
            parallel_groups,
            dependency_paths,
            task_paths,
            max_depth,
            independent_tasks,
        })
    }

    /// All transitive dependencies (ancestors) of a task.
    pub fn transitive_deps(&self, task_id: &str) -> HashSet<TaskId> {
        let mut all = HashSet::new();
        let mut queue: VecDeque<TaskId> =
            self.deps.get(task_id).cloned().unwrap_or_default().into();
        while let Some(dep) = queue.pop_front() {
            if all.insert(dep.clone()) {
                if let Some(next) = self.deps.get(&dep) {
                    queue.extend(next.iter().cloned());
                }
            }
        }
        all
    }

    /// All transitive dependents (descendants) of a task.
    pub fn transitive_dependents(&self, task_id: &str) -> HashSet<TaskId> {
        let mut all = HashSet::new();
        let mut queue: VecDeque<TaskId> = self
            .dependents
            .get(task_id)
            .cloned()
            .unwrap_or_default()
            .into();
        while let Some(dep) = queue.pop_front() {
            if all.insert(dep.clone()) {
                if let Some(next) = self.dependents.get(&dep) {
                    queue.extend(next.iter().cloned());
                }
            }
        }
        all
    }

    /// True iff every dependency of the task is in `completed`.
    pub fn is_ready(&self, task_id: &str, completed: &HashSet<TaskId>) -> bool {
        self.deps
            .get(task_id)
            .map(|deps| deps.iter().all(|d| completed.contains(d)))
            .unwrap_or(true)
    }

    /// Topological order over all tasks (Kahn), stable within layers.
    pub fn topological_order(&self) -> Vec<TaskId> {
        self.parallel_groups().into_iter().flatten().collect()
    }

    /// Three-color DFS over dependency edges. Returns the cycle path
    /// (repeated node at both ends) when a back edge is found.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<&str, Color> = self
            .order
            .iter()
            .map(|id| (id.as_str(), Color::White))
            .collect();
        let mut stack: Vec<TaskId> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            deps: &'a HashMap<TaskId, Vec<TaskId>>,
            color: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<TaskId>,
        ) -> Option<Vec<TaskId>> {
            color.insert(node, Color::Gray);
            stack.push(node.to_string());

            if let Some(children) = deps.get(node) {
                for child in children {
                    match color.get(child.as_str()).copied() {
                        Some(Color::Gray) => {
                            // Back edge: slice the stack from the repeated node
                            let start = stack.iter().position(|id| id == child).unwrap_or(0);
                            let mut cycle: Vec<TaskId> = stack[start..].to_vec();
                            cycle.push(child.clone());
                            return Some(cycle);
                        }
                        Some(Color::White) => {
                            if let Some(cycle) = visit(child, deps, color, stack) {
                                return Some(cycle);
                            }
                        }
                        _ => {}
                    }
                }
            }

            color.insert(node, Color::Black);
            stack.pop();
            None
        }

        for id in &self.order {
            if color.get(id.as_str()) == Some(&Color::White) {
                if let Some(cycle) = visit(id, &self.deps, &mut color, &mut stack) {
                    return Some(cycle);
                }
                stack.clear();
            }
        }
        None
    }

    /// Kahn's algorithm over in-degrees; each layer strips the ready set.
    /// Within a layer tasks keep their Stage-1 ordinal order.
    fn parallel_groups(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| {
                (
                    id.as_str(),
                    self.deps.get(id).map(Vec::len).unwrap_or(0),
                )
            })
            .collect();
        let mut remaining: HashSet<&str> = self.order.iter().map(|id| id.as_str()).collect();
        let mut groups = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<TaskId> = self
                .order
                .iter()
                .filter(|id| {
                    remaining.contains(id.as_str())
                        && in_degree.get(id.as_str()).copied() == Some(0)
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                // Unreachable once find_cycle has passed
                break;
            }

            for id in &ready {
                remaining.remove(id.as_str());
                if let Some(dependents) = self.dependents.get(id) {
                    for dependent in dependents {
                        if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
            groups.push(ready);
        }

        groups
    }

    /// Enumerate all simple root-to-sink paths, deduplicated.
    fn dependency_paths(&self) -> Vec<Vec<TaskId>> {
        let sinks: Vec<&TaskId> = self
            .order
            .iter()
            .filter(|id| {
                self.dependents
                    .get(*id)
                    .map(Vec::is_empty)
                    .unwrap_or(true)
            })
            .collect();

        let mut paths = Vec::new();
        let mut seen: HashSet<Vec<TaskId>> = HashSet::new();
        for sink in sinks {
            for path in self.trace_to_roots(sink) {
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }
        paths
    }

    /// All root-to-`task` paths, recursing through dependencies.
    fn trace_to_roots(&self, task_id: &str) -> Vec<Vec<TaskId>> {
        let deps = match self.deps.get(task_id) {
            Some(deps) if !deps.is_empty() => deps,
            _ => return vec![vec![task_id.to_string()]],
        };

        let mut all = Vec::new();
        for dep in deps {
            for mut path in self.trace_to_roots(dep) {
                path.push(task_id.to_string());
                all.push(path);
            }
        }
        all
    }

    /// Canonical path per task. Tasks on a single path use it as-is;
    /// fan-in tasks merge all predecessors in first-seen order.
    fn task_paths(&self, dependency_paths: &[Vec<TaskId>]) -> HashMap<TaskId, Vec<TaskId>> {
        let mut membership: HashMap<&str, Vec<&Vec<TaskId>>> = HashMap::new();
        for path in dependency_paths {
            for id in path {
                membership.entry(id.as_str()).or_default().push(path);
            }
        }

        let mut task_paths = HashMap::new();
        for (id, paths) in membership {
            let canonical = if paths.len() == 1 {
                (*paths[0]).clone()
            } else {
                let mut merged: Vec<TaskId> = Vec::new();
                for path in &paths {
                    let cut = path.iter().position(|t| t == id).unwrap_or(path.len());
                    for predecessor in &path[..cut] {
                        if !merged.contains(predecessor) {
                            merged.push(predecessor.clone());
                        }
                    }
                }
                merged.push(id.to_string());
                merged
            };
            task_paths.insert(id.to_string(), canonical);
        }
        task_paths
    }

    /// Longest chain, computed breadth-first over the topological order.
    fn max_depth(&self) -> usize {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        for id in &self.order {
            if self.deps.get(id).map(Vec::is_empty).unwrap_or(true) {
                depth.insert(id.as_str(), 0);
                queue.push_back(id.as_str());
            }
        }

        while let Some(id) = queue.pop_front() {
            let Some(dependents) = self.dependents.get(id) else {
                continue;
            };
            for dependent in dependents {
                let dep_depths: Vec<Option<usize>> = self
                    .deps
                    .get(dependent.as_str())
                    .map(|deps| {
                        deps.iter()
                            .map(|d| depth.get(d.as_str()).copied())
                            .collect()
                    })
                    .unwrap_or_default();
                if dep_depths.iter().all(Option::is_some) {
                    let max = dep_depths.into_iter().flatten().max().unwrap_or(0);
                    depth.insert(dependent.as_str(), max + 1);
                    queue.push_back(dependent.as_str());
                }
            }
        }

        depth.values().copied().max().unwrap_or(0)
    }
}
