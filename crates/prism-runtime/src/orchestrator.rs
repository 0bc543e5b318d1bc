//! Orchestrator: the two-stage planning and execution pipeline
//!
//! `run(query, options)` drives: Stage 1 planning -> planning-table
//! persistence -> Stage 2 per-path tool discovery -> execution-plan
//! generation -> parallel worker execution -> consolidation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use prism_core::agent::AgentRegistry;
use prism_core::error::PlanError;
use prism_core::store::{PlanRecord, StoreError, TaskStore};
use prism_core::tool::{ToolError, ToolLoader};
use prism_core::types::{Plan, RunId};
use prism_planners::backend::{PlannerBackend, ValidationReport};
use prism_planners::stage1::{path_or_self, Stage1Planner};
use prism_planners::stage2::Stage2Planner;
use prism_stores::{ArtifactBus, BusError};

use crate::coder::Coder;
use crate::config::EngineConfig;
use crate::executor::{ExecutorConfig, ExecutorError, WorkerExecutor, WorkerHost};
use crate::runner::Runner;

const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";
const SCRIPTS_SUBDIR: &str = "scripts";

/// Orchestrator errors. These abort the run; per-task failures do not.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("artifact bus error: {0}")]
    Bus(#[from] BusError),
    #[error("tool loader error: {0}")]
    Tool(#[from] ToolError),
}

impl From<ExecutorError> for OrchestratorError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Store(e) => OrchestratorError::Store(e),
            ExecutorError::Plan(e) => OrchestratorError::Plan(e),
        }
    }
}

/// Per-run options; unset fields fall back to the engine config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_subtasks: Option<usize>,
    pub skip_validation: Option<bool>,
    pub max_parallel: Option<usize>,
    pub task_timeout_ms: Option<u64>,
    pub cancellation: Option<CancellationToken>,
}

/// Run metadata returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub unmappable_tasks: usize,
    pub agents_used: Vec<String>,
    pub script_refs: Vec<String>,
}

/// Final result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub query: String,
    pub answer: String,
    pub data_by_agent: BTreeMap<String, Vec<Value>>,
    pub summary_stats: Value,
    pub validation: Option<ValidationReport>,
    pub metadata: RunMetadata,
}

/// The engine entry point. One instance serves one run at a time;
/// concurrent runs use distinct run ids and contend only on the store.
pub struct OrchestratorAgent {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    loader: Arc<ToolLoader>,
    host: Arc<WorkerHost>,
    store: Arc<dyn TaskStore>,
    bus: Arc<ArtifactBus>,
    backend: Option<Arc<dyn PlannerBackend>>,
}

impl OrchestratorAgent {
    pub fn new(
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        loader: Arc<ToolLoader>,
        host: Arc<WorkerHost>,
        store: Arc<dyn TaskStore>,
        bus: Arc<ArtifactBus>,
    ) -> Self {
        Self {
            config,
            registry,
            loader,
            host,
            store,
            bus,
            backend: None,
        }
    }

    /// Attach the LLM collaborator for decomposition, answer composition,
    /// and validation.
    pub fn with_backend(mut self, backend: Arc<dyn PlannerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Timestamp-based run identifier: `YYYYMMDDhhmmss_<6-hex>`.
    pub fn generate_run_id() -> RunId {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..6])
    }

    /// Execute the full pipeline for one query.
    pub async fn run(
        &self,
        query: &str,
        options: RunOptions,
    ) -> Result<RunResult, OrchestratorError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = Self::generate_run_id();
        let cancellation = options.cancellation.clone().unwrap_or_default();

        tracing::info!(run_id = %run_id, query = %query, "run started");

        match self.run_inner(&run_id, query, &options, cancellation).await {
            Ok(mut result) => {
                result.metadata.started_at = started_at;
                result.metadata.duration_ms = start.elapsed().as_millis() as i64;
                self.write_run_log(&run_id, query, "success", &result.metadata, None)
                    .await?;
                tracing::info!(
                    run_id = %run_id,
                    duration_ms = result.metadata.duration_ms,
                    successful = result.metadata.successful_tasks,
                    failed = result.metadata.failed_tasks,
                    "run complete"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "run failed");
                let metadata = RunMetadata {
                    started_at,
                    duration_ms: start.elapsed().as_millis() as i64,
                    total_tasks: 0,
                    successful_tasks: 0,
                    failed_tasks: 0,
                    unmappable_tasks: 0,
                    agents_used: Vec::new(),
                    script_refs: Vec::new(),
                };
                // Best-effort failure log; the original error wins
                let _ = self
                    .write_run_log(&run_id, query, "failed", &metadata, Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        run_id: &str,
        query: &str,
        options: &RunOptions,
        cancellation: CancellationToken,
    ) -> Result<RunResult, OrchestratorError> {
        // Stage 1: decomposition, agent mapping, dependency analysis.
        // Cycles and dangling deps abort here, before any store write.
        let max_subtasks = options.max_subtasks.unwrap_or(self.config.max_subtasks);
        let mut stage1 = Stage1Planner::new(self.registry.clone());
        if let Some(backend) = &self.backend {
            stage1 = stage1.with_backend(backend.clone());
        }
        let plan = stage1.plan(run_id, query, max_subtasks).await?;

        if plan.mappable().count() == 0 {
            return Err(PlanError::NoMappableTasks.into());
        }

        self.persist_planning_table(run_id, &plan).await?;

        // Stage 2: per-path tool discovery, isolated per instance
        let planners = Stage2Planner::for_paths(&plan.dependency_paths);
        let mut path_plans = Vec::with_capacity(planners.len());
        for planner in &planners {
            let path_plan = planner.enrich(&plan.subtasks, &self.loader)?;
            tracing::info!(
                run_id,
                path = %path_plan.path_id,
                tools = path_plan.tools_loaded.len(),
                tasks = path_plan.subtasks.len(),
                "path enriched"
            );
            path_plans.push(path_plan);
        }

        for path_plan in &path_plans {
            for task in &path_plan.subtasks {
                let tools: Vec<String> = task.tool_id.iter().cloned().collect();
                let tool_params = match &task.tool_id {
                    Some(tool_id) => {
                        let mut map = serde_json::Map::new();
                        map.insert(tool_id.clone(), task.params.clone());
                        Value::Object(map)
                    }
                    None => json!({}),
                };
                self.store
                    .update_plan_tools(run_id, &task.id, &tools, &tool_params)
                    .await?;
            }
        }

        // Coder: pure execution plans, persisted for the audit trail
        let coder = Coder::new();
        let mut exec_plans = Vec::with_capacity(path_plans.len());
        let mut script_refs = Vec::with_capacity(path_plans.len());
        for path_plan in &path_plans {
            let exec_plan = coder.plan_path(path_plan, run_id);
            let script_ref = self
                .bus
                .write_document(
                    ORCHESTRATOR_AGENT_ID,
                    SCRIPTS_SUBDIR,
                    &format!("{run_id}_{}.json", exec_plan.path_id),
                    &serde_json::to_value(&exec_plan)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                )
                .await?;
            script_refs.push(script_ref.display().to_string());
            exec_plans.push(exec_plan);
        }

        // Execution
        let executor = WorkerExecutor::new(
            self.store.clone(),
            self.bus.clone(),
            self.host.clone(),
        )
        .with_config(ExecutorConfig {
            max_parallel: options
                .max_parallel
                .unwrap_or_else(|| self.config.effective_max_parallel()),
            task_timeout: std::time::Duration::from_millis(
                options.task_timeout_ms.unwrap_or(self.config.task_timeout_ms),
            ),
            dependency_wait_timeout: std::time::Duration::from_millis(
                self.config.dependency_wait_timeout_ms,
            ),
            poll_interval: std::time::Duration::from_millis(self.config.poll_interval_ms),
        });
        let report = executor.execute(&plan, &exec_plans, cancellation).await?;

        // Consolidation
        let skip_validation = options
            .skip_validation
            .unwrap_or(self.config.skip_validation);
        let mut runner = Runner::new(self.store.clone());
        if let Some(backend) = &self.backend {
            runner = runner.with_backend(backend.clone());
        }
        let consolidated = runner.consolidate(run_id, query, skip_validation).await?;

        let metadata = RunMetadata {
            started_at: Utc::now(),
            duration_ms: 0,
            total_tasks: plan.subtasks.len(),
            successful_tasks: consolidated.summary.successful,
            failed_tasks: consolidated.summary.failed,
            unmappable_tasks: plan.unmappable_count(),
            agents_used: consolidated.summary.agents_used.clone(),
            script_refs,
        };

        tracing::debug!(
            run_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "execution report folded into result"
        );

        Ok(RunResult {
            run_id: run_id.to_string(),
            query: query.to_string(),
            answer: consolidated.answer,
            data_by_agent: consolidated.data_by_agent,
            summary_stats: consolidated.summary_stats,
            validation: consolidated.validation,
            metadata,
        })
    }

    /// Persist the Stage 1 view of the plan into the planning table.
    async fn persist_planning_table(
        &self,
        run_id: &str,
        plan: &Plan,
    ) -> Result<(), OrchestratorError> {
        for task in &plan.subtasks {
            let agent_description = task
                .agent_id
                .as_deref()
                .and_then(|id| self.registry.get(id))
                .map(|a| a.description.clone())
                .unwrap_or_default();
            let record = PlanRecord {
                task_id: task.id.clone(),
                agent_id: task.agent_id.clone(),
                agent_description,
                dependency_path: path_or_self(plan, &task.id),
                tools: Vec::new(),
                tool_params: json!({}),
            };
            self.store.insert_plan_row(run_id, &record).await?;
        }
        Ok(())
    }

    async fn write_run_log(
        &self,
        run_id: &str,
        query: &str,
        status: &str,
        metadata: &RunMetadata,
        error: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let mut log = json!({
            "run_id": run_id,
            "query": query,
            "status": status,
            "timestamp": Utc::now().to_rfc3339(),
            "duration_ms": metadata.duration_ms,
            "total_tasks": metadata.total_tasks,
            "successful_tasks": metadata.successful_tasks,
            "failed_tasks": metadata.failed_tasks,
            "agents_used": metadata.agents_used,
        });
        if let Some(error) = error {
            log["error"] = json!(error);
        }
        self.bus
            .write_log(ORCHESTRATOR_AGENT_ID, run_id, &log)
            .await?;
        Ok(())
    }
}
