//! Structural plan errors

use thiserror::Error;

use crate::types::TaskId;

/// Errors raised while validating a task graph. All of these are fatal to
/// the run before execution begins.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle; the path includes the
    /// repeated node at both ends (e.g. `t1 -> t2 -> t1`).
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<TaskId>),

    /// A task references a dependency that is not part of the plan.
    #[error("task '{task_id}' depends on unknown task '{dependency}'")]
    DanglingDependency { task_id: TaskId, dependency: TaskId },

    /// The decomposer produced no tasks at all.
    #[error("plan contains no tasks")]
    Empty,

    /// Every task in the plan failed agent mapping.
    #[error("plan contains no mappable tasks")]
    NoMappableTasks,
}
