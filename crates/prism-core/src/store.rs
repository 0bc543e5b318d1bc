//! Task store contract
//!
//! Durable record of per-task execution metadata and outputs, keyed by
//! `(run_id, task_id)`. Implementations live in the prism-stores crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{RunId, TaskId};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// `start_task` was called twice for the same `(run_id, task_id)`
    #[error("task '{task_id}' already started for run '{run_id}'")]
    AlreadyStarted { run_id: RunId, task_id: TaskId },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Task lifecycle status. Transitions are monotonic:
/// `Running -> Success` or `Running -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    /// Stable string form used by storage backends
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse the stable string form
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// One row of the `worker_runs` relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRunRecord {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub agent_id: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    /// Weak reference to the published artifact (filesystem path)
    pub artifact_ref: Option<String>,
}

/// One row of the `task_outputs` relation. Exactly one per successful task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputRecord {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub agent_id: String,
    pub output: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Planning-table row: Stage 1 structure, enriched by Stage 2 with tools
/// and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub task_id: TaskId,
    pub agent_id: Option<String>,
    pub agent_description: String,
    /// Canonical root-to-task path
    pub dependency_path: Vec<TaskId>,
    pub tools: Vec<String>,
    pub tool_params: Value,
}

/// Aggregated view of a run's worker rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub running: usize,
    pub agents_used: Vec<String>,
    pub avg_duration_ms: Option<f64>,
    pub total_duration_ms: Option<f64>,
}

/// Durable, concurrently accessible task store. All operations are atomic.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `running` row. Fails with `AlreadyStarted` when the
    /// `(run_id, task_id)` pair exists.
    async fn start_task(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Transition a running task to `success`.
    async fn complete_task(
        &self,
        run_id: &str,
        task_id: &str,
        duration_ms: i64,
        artifact_ref: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Transition a running task to `failed`.
    async fn fail_task(
        &self,
        run_id: &str,
        task_id: &str,
        duration_ms: i64,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Record a task as failed without ever starting it (upstream skips,
    /// cancellations). Inserts a terminal `failed` row in one step.
    async fn record_failure(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Insert one output row. Must be called after `complete_task`.
    async fn store_output(
        &self,
        run_id: &str,
        task_id: &str,
        agent_id: &str,
        output: &Value,
        metadata: &Value,
    ) -> Result<(), StoreError>;

    /// Latest output for a task, if any.
    async fn get_output(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskOutputRecord>, StoreError>;

    /// All outputs for a run, oldest first.
    async fn all_outputs(&self, run_id: &str) -> Result<Vec<TaskOutputRecord>, StoreError>;

    /// Status of a single task.
    async fn task_status(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskStatus>, StoreError>;

    /// True iff every listed dependency has status `success`.
    async fn are_dependencies_complete(
        &self,
        run_id: &str,
        dependency_ids: &[TaskId],
    ) -> Result<bool, StoreError>;

    /// Aggregate summary over the run's worker rows.
    async fn run_summary(&self, run_id: &str) -> Result<RunSummary, StoreError>;

    /// All failed worker rows for a run.
    async fn failed_tasks(&self, run_id: &str) -> Result<Vec<WorkerRunRecord>, StoreError>;

    /// Insert a Stage 1 planning row.
    async fn insert_plan_row(&self, run_id: &str, record: &PlanRecord) -> Result<(), StoreError>;

    /// Enrich a planning row with Stage 2 tools and parameters.
    async fn update_plan_tools(
        &self,
        run_id: &str,
        task_id: &str,
        tools: &[String],
        tool_params: &Value,
    ) -> Result<(), StoreError>;

    /// Planning table for a run, in insertion order.
    async fn plan_rows(&self, run_id: &str) -> Result<Vec<PlanRecord>, StoreError>;
}
