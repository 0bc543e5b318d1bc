//! Worker executor
//!
//! Drives execution plans to completion with dependency-aware parallelism.
//! A single dispatcher owns the run: it launches tasks whose dependencies
//! are visible as successful in the task store, bounds concurrency with a
//! shared pool, and brackets every invocation with task-store and
//! artifact-bus writes. Failures are contained to the failing task and its
//! transitive dependents; sibling paths keep running.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use prism_core::agent::{AgentError, AgentOutput, InvocationContext, WorkerAgent};
use prism_core::analyzer::DependencyAnalyzer;
use prism_core::error::PlanError;
use prism_core::store::{StoreError, TaskStore};
use prism_core::types::{Plan, TaskId};
use prism_stores::{ArtifactBus, ArtifactMetadata, ArtifactPayload};

use crate::coder::{ExecutionPlan, ExecutionStep};

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_DEPENDENCY_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Executor errors. Per-task failures are recorded, not raised; these are
/// infrastructure failures that abort the run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
}

/// Registry of worker agent implementations, keyed by agent id.
#[derive(Default)]
pub struct WorkerHost {
    workers: HashMap<String, Arc<dyn WorkerAgent>>,
}

impl WorkerHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its own agent id
    pub fn register(&mut self, worker: Arc<dyn WorkerAgent>) {
        self.workers
            .insert(worker.agent_id().to_string(), worker);
    }

    /// Look up a worker implementation
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn WorkerAgent>> {
        self.workers.get(agent_id).cloned()
    }
}

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_parallel: usize,
    pub task_timeout: Duration,
    pub dependency_wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            dependency_wait_timeout: DEFAULT_DEPENDENCY_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Outcome of the whole run: terminal state per task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<(TaskId, String)>,
}

enum InvokeOutcome {
    Success(AgentOutput),
    Timeout,
    Cancelled,
    Error(String),
}

type InFlight =
    FuturesUnordered<Pin<Box<dyn Future<Output = (ExecutionStep, Duration, InvokeOutcome)> + Send>>>;

/// Dependency-aware parallel executor with dual persistence.
pub struct WorkerExecutor {
    store: Arc<dyn TaskStore>,
    bus: Arc<ArtifactBus>,
    host: Arc<WorkerHost>,
    config: ExecutorConfig,
}

impl WorkerExecutor {
    pub fn new(store: Arc<dyn TaskStore>, bus: Arc<ArtifactBus>, host: Arc<WorkerHost>) -> Self {
        Self {
            store,
            bus,
            host,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute all paths' plans for a run. Overlapping paths never start a
    /// task twice; each `(run_id, task_id)` is claimed exactly once.
    pub async fn execute(
        &self,
        plan: &Plan,
        exec_plans: &[ExecutionPlan],
        cancellation: CancellationToken,
    ) -> Result<ExecutionReport, ExecutorError> {
        let run_id = plan.run_id.as_str();
        let analyzer = DependencyAnalyzer::new(&plan.subtasks)?;

        // Union of all paths' steps, first occurrence wins
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut steps: Vec<ExecutionStep> = Vec::new();
        for exec_plan in exec_plans {
            for step in &exec_plan.steps {
                if seen.insert(step.task_id.clone()) {
                    steps.push(step.clone());
                }
            }
        }

        let mut completed: HashSet<TaskId> = HashSet::new();
        let mut failed: HashMap<TaskId, String> = HashMap::new();

        // Tasks downstream of an unmappable task can never become ready
        let unmappable: HashSet<&str> = plan
            .subtasks
            .iter()
            .filter(|t| !t.mappable)
            .map(|t| t.id.as_str())
            .collect();
        let mut pending: Vec<ExecutionStep> = Vec::new();
        for step in steps {
            let blocked = analyzer
                .transitive_deps(&step.task_id)
                .into_iter()
                .find(|dep| unmappable.contains(dep.as_str()));
            match blocked {
                Some(dep) => {
                    let cause = format!("unmappable dependency: {dep}");
                    self.store
                        .record_failure(run_id, &step.task_id, &step.agent_id, &cause)
                        .await?;
                    failed.insert(step.task_id, cause);
                }
                None => pending.push(step),
            }
        }

        tracing::info!(
            run_id,
            tasks = pending.len(),
            max_parallel = self.config.max_parallel,
            "worker execution started"
        );

        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut wait_since: HashMap<TaskId, Instant> = HashMap::new();

        loop {
            if cancellation.is_cancelled() && !pending.is_empty() {
                for step in pending.drain(..) {
                    self.store
                        .record_failure(run_id, &step.task_id, &step.agent_id, "cancelled")
                        .await?;
                    failed.insert(step.task_id, "cancelled".to_string());
                }
            }

            self.propagate_failures(run_id, &mut pending, &mut failed)
                .await?;

            // Launch every ready task up to the pool limit
            let mut index = 0;
            while index < pending.len() && in_flight.len() < self.config.max_parallel {
                let ready = self
                    .store
                    .are_dependencies_complete(run_id, &pending[index].dependencies)
                    .await?;

                if ready {
                    let step = pending.remove(index);
                    wait_since.remove(&step.task_id);
                    self.launch(run_id, step, &cancellation, &mut in_flight, &mut failed)
                        .await?;
                } else {
                    let since = wait_since
                        .entry(pending[index].task_id.clone())
                        .or_insert_with(Instant::now);
                    if since.elapsed() > self.config.dependency_wait_timeout {
                        let step = pending.remove(index);
                        let cause = "dependency wait timeout";
                        tracing::error!(run_id, task = %step.task_id, "dependency wait timed out");
                        self.store
                            .record_failure(run_id, &step.task_id, &step.agent_id, cause)
                            .await?;
                        failed.insert(step.task_id, cause.to_string());
                    } else {
                        index += 1;
                    }
                }
            }

            if in_flight.is_empty() {
                if pending.is_empty() {
                    break;
                }
                // Waiting on dependencies owned elsewhere; poll the store
                sleep(self.config.poll_interval).await;
                continue;
            }

            tokio::select! {
                Some((step, elapsed, outcome)) = in_flight.next() => {
                    self.settle(run_id, &plan.query, step, elapsed, outcome, &mut completed, &mut failed)
                        .await?;
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        let mut report = ExecutionReport {
            completed: completed.into_iter().collect(),
            failed: failed.into_iter().collect(),
        };
        report.completed.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(
            run_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "worker execution finished"
        );
        Ok(report)
    }

    /// Record `upstream failure` for every pending task with a failed
    /// dependency, cascading until a fixpoint.
    async fn propagate_failures(
        &self,
        run_id: &str,
        pending: &mut Vec<ExecutionStep>,
        failed: &mut HashMap<TaskId, String>,
    ) -> Result<(), ExecutorError> {
        loop {
            let mut changed = false;
            let mut still_pending = Vec::with_capacity(pending.len());
            for step in pending.drain(..) {
                let upstream = step
                    .dependencies
                    .iter()
                    .find(|dep| failed.contains_key(*dep))
                    .cloned();
                match upstream {
                    Some(dep) => {
                        let cause = format!("upstream failure: {dep}");
                        tracing::warn!(run_id, task = %step.task_id, %dep, "skipping dependent task");
                        self.store
                            .record_failure(run_id, &step.task_id, &step.agent_id, &cause)
                            .await?;
                        failed.insert(step.task_id, cause);
                        changed = true;
                    }
                    None => still_pending.push(step),
                }
            }
            *pending = still_pending;
            if !changed {
                return Ok(());
            }
        }
    }

    async fn launch(
        &self,
        run_id: &str,
        step: ExecutionStep,
        cancellation: &CancellationToken,
        in_flight: &mut InFlight,
        failed: &mut HashMap<TaskId, String>,
    ) -> Result<(), ExecutorError> {
        let Some(worker) = self.host.get(&step.agent_id) else {
            let cause = format!("no worker registered for agent '{}'", step.agent_id);
            self.store
                .record_failure(run_id, &step.task_id, &step.agent_id, &cause)
                .await?;
            failed.insert(step.task_id, cause);
            return Ok(());
        };

        match self
            .store
            .start_task(run_id, &step.task_id, &step.agent_id, Utc::now())
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyStarted { .. }) => {
                // Another executor sharing this run id claimed the task;
                // dependents will observe its completion through the store
                tracing::debug!(run_id, task = %step.task_id, "task claimed elsewhere");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            run_id,
            task = %step.task_id,
            agent = %step.agent_id,
            tool = step.tool_id.as_deref().unwrap_or("-"),
            needs_review = step.needs_review,
            "task started"
        );

        let ctx = InvocationContext::new(run_id, step.task_id.as_str())
            .with_cancellation(cancellation.child_token());
        let token = cancellation.clone();
        let timeout = self.config.task_timeout;

        in_flight.push(Box::pin(async move {
            let started = Instant::now();
            let tool_id = step.tool_id.clone();
            let params = step.params.clone();
            let outcome = tokio::select! {
                _ = token.cancelled() => InvokeOutcome::Cancelled,
                result = tokio::time::timeout(
                    timeout,
                    worker.invoke(tool_id.as_deref(), params, ctx),
                ) => match result {
                    Ok(Ok(output)) => InvokeOutcome::Success(output),
                    Ok(Err(AgentError::Cancelled)) => InvokeOutcome::Cancelled,
                    Ok(Err(e)) => InvokeOutcome::Error(e.to_string()),
                    Err(_) => InvokeOutcome::Timeout,
                },
            };
            (step, started.elapsed(), outcome)
        }));
        Ok(())
    }

    async fn settle(
        &self,
        run_id: &str,
        query: &str,
        step: ExecutionStep,
        elapsed: Duration,
        outcome: InvokeOutcome,
        completed: &mut HashSet<TaskId>,
        failed: &mut HashMap<TaskId, String>,
    ) -> Result<(), ExecutorError> {
        let duration_ms = elapsed.as_millis() as i64;
        match outcome {
            InvokeOutcome::Success(output) => {
                match self.publish(run_id, query, &step, &output).await {
                    Ok((artifact_ref, metadata)) => {
                        self.store
                            .complete_task(run_id, &step.task_id, duration_ms, Some(&artifact_ref))
                            .await?;
                        self.store
                            .store_output(
                                run_id,
                                &step.task_id,
                                &step.agent_id,
                                &Value::Array(output.data),
                                &metadata,
                            )
                            .await?;
                        tracing::info!(
                            run_id,
                            task = %step.task_id,
                            agent = %step.agent_id,
                            duration_ms,
                            "task completed"
                        );
                        completed.insert(step.task_id);
                    }
                    Err(cause) => {
                        tracing::error!(run_id, task = %step.task_id, %cause, "artifact publish failed");
                        self.store
                            .fail_task(run_id, &step.task_id, duration_ms, &cause)
                            .await?;
                        failed.insert(step.task_id, cause);
                    }
                }
            }
            InvokeOutcome::Timeout => {
                tracing::error!(run_id, task = %step.task_id, duration_ms, "task timed out");
                self.store
                    .fail_task(run_id, &step.task_id, duration_ms, "timeout")
                    .await?;
                failed.insert(step.task_id, "timeout".to_string());
            }
            InvokeOutcome::Cancelled => {
                self.store
                    .fail_task(run_id, &step.task_id, duration_ms, "cancelled")
                    .await?;
                failed.insert(step.task_id, "cancelled".to_string());
            }
            InvokeOutcome::Error(cause) => {
                tracing::error!(run_id, task = %step.task_id, %cause, "task failed");
                self.store
                    .fail_task(run_id, &step.task_id, duration_ms, &cause)
                    .await?;
                failed.insert(step.task_id, cause);
            }
        }
        Ok(())
    }

    /// Publish the worker output as an artifact; on success returns the
    /// artifact ref and the metadata stored alongside the output row.
    async fn publish(
        &self,
        run_id: &str,
        query: &str,
        step: &ExecutionStep,
        output: &AgentOutput,
    ) -> Result<(String, Value), String> {
        let meta_query = output
            .metadata
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or(query);
        let version = output
            .metadata
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("1.0");

        let payload = ArtifactPayload {
            data: output.data.clone(),
            metadata: ArtifactMetadata {
                query: meta_query.to_string(),
                timestamp: Utc::now(),
                row_count: output.data.len(),
                agent: step.agent_id.clone(),
                version: version.to_string(),
            },
        };

        let artifact_ref = self
            .bus
            .publish(&step.agent_id, &payload)
            .await
            .map_err(|e| format!("artifact publish failed: {e}"))?;
        let metadata = serde_json::to_value(&payload.metadata)
            .map_err(|e| format!("artifact metadata encoding failed: {e}"))?;

        tracing::debug!(
            run_id,
            task = %step.task_id,
            artifact = %artifact_ref.display(),
            "artifact published"
        );
        Ok((artifact_ref.display().to_string(), metadata))
    }
}
