//! Core type definitions for Prism
//!
//! - RawTask: unnormalized decomposer output
//! - Subtask: normalized, agent-bound unit of work
//! - Plan: validated Stage 1 output
//! - PathPlan: per-path Stage 2 output

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type alias for run IDs (timestamp-based strings)
pub type RunId = String;

/// Type alias for task IDs (`t1`, `t2`, ... after normalization)
pub type TaskId = String;

/// A raw task as produced by the decomposition collaborator, before
/// ID normalization and agent binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTask {
    /// Free-text description of the work
    pub description: String,
    /// Agent suggested by the decomposer (may be unknown)
    #[serde(default)]
    pub suggested_agent: Option<String>,
    /// Dependencies by raw ID or 1-based ordinal
    #[serde(default)]
    pub suggested_dependencies: Vec<String>,
}

impl RawTask {
    /// Create a raw task with only a description
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            suggested_agent: None,
            suggested_dependencies: Vec::new(),
        }
    }

    /// Set the suggested agent
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.suggested_agent = Some(agent.into());
        self
    }

    /// Set suggested dependencies
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.suggested_dependencies = deps;
        self
    }
}

/// A normalized subtask bound to exactly one agent (and, after Stage 2,
/// at most one tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique ID within the run (`t<ordinal>` form)
    pub id: TaskId,
    /// Free-text description, used for parameter extraction
    pub description: String,
    /// Resolved agent, or None when no agent matched
    #[serde(default)]
    pub agent_id: Option<String>,
    /// IDs of tasks that must complete successfully first
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Tool selected by Stage 2 (None until enrichment)
    #[serde(default)]
    pub tool_id: Option<String>,
    /// Extracted tool parameters (filled by Stage 2)
    #[serde(default)]
    pub params: Value,
    /// Whether the task could be mapped to an agent
    pub mappable: bool,
    /// Set when extracted parameters failed schema validation;
    /// the executor still attempts the task
    #[serde(default)]
    pub needs_review: bool,
}

impl Subtask {
    /// Create a new mappable subtask
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            agent_id: None,
            dependencies: Vec::new(),
            tool_id: None,
            params: Value::Null,
            mappable: true,
            needs_review: false,
        }
    }

    /// Bind an agent
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Add dependencies
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Select a tool
    pub fn with_tool(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }

    /// Set extracted parameters
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Mark the task as unmappable (kept for dependency accounting only)
    pub fn unmappable(mut self) -> Self {
        self.mappable = false;
        self.agent_id = None;
        self
    }
}

/// Validated Stage 1 output: the task DAG plus its structural analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub run_id: RunId,
    pub query: String,
    pub subtasks: Vec<Subtask>,
    /// Topological layers; tasks in one layer may run concurrently
    pub parallel_groups: Vec<Vec<TaskId>>,
    /// All root-to-sink paths, the unit of Stage 2 isolation
    pub dependency_paths: Vec<Vec<TaskId>>,
    /// Canonical root-to-task path per task (fan-in merges all predecessors)
    pub task_paths: HashMap<TaskId, Vec<TaskId>>,
    pub max_depth: usize,
}

impl Plan {
    /// Look up a subtask by ID
    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|t| t.id == id)
    }

    /// Iterate over mappable subtasks
    pub fn mappable(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.iter().filter(|t| t.mappable)
    }

    /// Number of tasks that could not be mapped to any agent
    pub fn unmappable_count(&self) -> usize {
        self.subtasks.iter().filter(|t| !t.mappable).count()
    }
}

/// Stage 2 output for one dependency path: the path's subtasks enriched
/// with tool selections and extracted parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPlan {
    /// Path identifier (`path_1`, `path_2`, ...)
    pub path_id: String,
    /// Task IDs on this path, root first
    pub task_ids: Vec<TaskId>,
    /// Enriched copies of the mappable subtasks on this path
    pub subtasks: Vec<Subtask>,
    /// Unique agents on this path
    pub agents: Vec<String>,
    /// Tool IDs loaded for this path
    pub tools_loaded: Vec<String>,
}
