//! Stage 1 planner: decomposition, normalization, agent mapping
//!
//! Turns a natural-language query into a validated, agent-mapped DAG.
//! Stage 1 fixes structure and agent binding only; parameter filling is
//! Stage 2's job.

use std::sync::Arc;

use regex::Regex;

use prism_core::agent::AgentRegistry;
use prism_core::analyzer::DependencyAnalyzer;
use prism_core::error::PlanError;
use prism_core::types::{Plan, RawTask, Subtask, TaskId};

use crate::backend::PlannerBackend;

/// Stage 1 planner. Holds the agent registry and an optional decomposition
/// collaborator; without one (or when it is unavailable) planning falls
/// back to a deterministic single-task plan.
pub struct Stage1Planner {
    registry: Arc<AgentRegistry>,
    backend: Option<Arc<dyn PlannerBackend>>,
}

impl Stage1Planner {
    /// Create a planner without an LLM collaborator
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            backend: None,
        }
    }

    /// Attach the decomposition collaborator
    pub fn with_backend(mut self, backend: Arc<dyn PlannerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Create a task decomposition plan for a query.
    pub async fn plan(
        &self,
        run_id: &str,
        query: &str,
        max_subtasks: usize,
    ) -> Result<Plan, PlanError> {
        let raw_tasks = self.decompose(query, max_subtasks).await;
        if raw_tasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut subtasks = normalize(&raw_tasks, max_subtasks);
        self.map_agents(&mut subtasks);

        let analyzer = DependencyAnalyzer::new(&subtasks)?;
        let analysis = analyzer.analyze()?;

        let mappable = subtasks.iter().filter(|t| t.mappable).count();
        tracing::info!(
            run_id,
            total_tasks = subtasks.len(),
            mappable,
            paths = analysis.dependency_paths.len(),
            max_depth = analysis.max_depth,
            "stage 1 plan created"
        );

        Ok(Plan {
            run_id: run_id.to_string(),
            query: query.to_string(),
            subtasks,
            parallel_groups: analysis.parallel_groups,
            dependency_paths: analysis.dependency_paths,
            task_paths: analysis.task_paths,
            max_depth: analysis.max_depth,
        })
    }

    async fn decompose(&self, query: &str, max_subtasks: usize) -> Vec<RawTask> {
        if let Some(backend) = &self.backend {
            match backend.decompose(query, &self.registry, max_subtasks).await {
                Ok(tasks) if !tasks.is_empty() => return tasks,
                Ok(_) => {
                    tracing::warn!("decomposer returned no tasks, using single-task fallback");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "decomposer unavailable, using single-task fallback");
                }
            }
        }
        // Deterministic fallback: the whole query as one task, keyword-mapped
        vec![RawTask::new(query)]
    }

    /// Bind each subtask to an agent. A valid suggestion wins; otherwise the
    /// registry scores keyword overlap. Zero overlap marks the task
    /// unmappable but keeps its id valid for dependency accounting.
    fn map_agents(&self, subtasks: &mut [Subtask]) {
        for task in subtasks.iter_mut() {
            let suggested = task
                .agent_id
                .take()
                .map(|a| a.to_lowercase().replace('-', "_"));

            if let Some(agent_id) = suggested.filter(|a| self.registry.contains(a)) {
                tracing::debug!(task = %task.id, agent = %agent_id, "using suggested agent");
                task.agent_id = Some(agent_id);
                continue;
            }

            match self.registry.best_match(&task.description) {
                Some((agent, score)) => {
                    tracing::debug!(
                        task = %task.id,
                        agent = %agent.agent_id,
                        score,
                        "agent mapped by keyword overlap"
                    );
                    task.agent_id = Some(agent.agent_id.clone());
                }
                None => {
                    tracing::warn!(task = %task.id, "no agent matched, marking unmappable");
                    task.mappable = false;
                }
            }
        }
    }
}

/// Normalize raw tasks: cap the count, assign `t<ordinal>` ids in
/// decomposition order, and rewrite dependency references (ordinals or
/// id-shaped strings) onto the new ids. Self-references are dropped;
/// anything unresolvable is kept verbatim for the analyzer to reject.
fn normalize(raw_tasks: &[RawTask], max_subtasks: usize) -> Vec<Subtask> {
    let capped = &raw_tasks[..raw_tasks.len().min(max_subtasks.max(1))];
    let id_shape = Regex::new(r"^(?i)(?:t|task[_-]?)?(\d+)$").unwrap();

    let mut subtasks = Vec::with_capacity(capped.len());
    for (index, raw) in capped.iter().enumerate() {
        let id: TaskId = format!("t{}", index + 1);

        let mut dependencies: Vec<TaskId> = Vec::new();
        for dep in &raw.suggested_dependencies {
            let resolved = id_shape
                .captures(dep.trim())
                .and_then(|caps| caps[1].parse::<usize>().ok())
                .map(|ordinal| format!("t{ordinal}"))
                .unwrap_or_else(|| dep.trim().to_string());
            if resolved != id && !dependencies.contains(&resolved) {
                dependencies.push(resolved);
            }
        }

        let mut task = Subtask::new(id, raw.description.clone()).with_dependencies(dependencies);
        task.agent_id = raw.suggested_agent.clone();
        subtasks.push(task);
    }
    subtasks
}

/// Canonical dependency path for a task, defaulting to the task itself when
/// the analyzer produced no entry.
pub fn path_or_self(plan: &Plan, task_id: &str) -> Vec<TaskId> {
    plan.task_paths
        .get(task_id)
        .cloned()
        .unwrap_or_else(|| vec![task_id.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use prism_core::agent::AgentDescriptor;
    use prism_core::store::TaskOutputRecord;
    use serde_json::Value;

    use crate::backend::{PlannerUnavailable, ValidationReport};

    fn registry() -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry.register(
            AgentDescriptor::new("market_data", "SQL market data").with_keywords(&[
                "sql",
                "market data",
                "price",
                "symbol",
                "futures",
                "options",
            ]),
        );
        registry.register(
            AgentDescriptor::new("prediction_search", "prediction markets").with_keywords(&[
                "prediction",
                "forecast",
                "probability",
                "odds",
                "polymarket",
            ]),
        );
        Arc::new(registry)
    }

    struct StaticBackend {
        tasks: Vec<RawTask>,
    }

    #[async_trait]
    impl PlannerBackend for StaticBackend {
        async fn decompose(
            &self,
            _query: &str,
            _registry: &AgentRegistry,
            _max_subtasks: usize,
        ) -> Result<Vec<RawTask>, PlannerUnavailable> {
            Ok(self.tasks.clone())
        }

        async fn compose_answer(
            &self,
            _query: &str,
            _digest: &Value,
        ) -> Result<String, PlannerUnavailable> {
            Err(PlannerUnavailable("static".to_string()))
        }

        async fn validate(
            &self,
            _query: &str,
            _answer: &str,
            _outputs: &[TaskOutputRecord],
        ) -> Result<ValidationReport, PlannerUnavailable> {
            Err(PlannerUnavailable("static".to_string()))
        }
    }

    struct DownBackend;

    #[async_trait]
    impl PlannerBackend for DownBackend {
        async fn decompose(
            &self,
            _query: &str,
            _registry: &AgentRegistry,
            _max_subtasks: usize,
        ) -> Result<Vec<RawTask>, PlannerUnavailable> {
            Err(PlannerUnavailable("connection refused".to_string()))
        }

        async fn compose_answer(
            &self,
            _query: &str,
            _digest: &Value,
        ) -> Result<String, PlannerUnavailable> {
            Err(PlannerUnavailable("connection refused".to_string()))
        }

        async fn validate(
            &self,
            _query: &str,
            _answer: &str,
            _outputs: &[TaskOutputRecord],
        ) -> Result<ValidationReport, PlannerUnavailable> {
            Err(PlannerUnavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fallback_produces_single_task_plan() {
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(DownBackend));
        let plan = planner
            .plan("r1", "show ZN futures prices", 5)
            .await
            .expect("plan");

        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.subtasks[0].id, "t1");
        assert_eq!(plan.subtasks[0].agent_id.as_deref(), Some("market_data"));
        assert_eq!(plan.parallel_groups, vec![vec!["t1".to_string()]]);
        assert_eq!(plan.dependency_paths, vec![vec!["t1".to_string()]]);
    }

    #[tokio::test]
    async fn test_normalization_rewrites_ordinal_dependencies() {
        let backend = StaticBackend {
            tasks: vec![
                RawTask::new("fetch market data prices").with_agent("market_data"),
                RawTask::new("fetch prediction odds").with_agent("prediction_search"),
                RawTask::new("compare price against odds")
                    .with_agent("market_data")
                    .with_dependencies(vec!["1".to_string(), "task_2".to_string()]),
            ],
        };
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(backend));
        let plan = planner.plan("r1", "compare", 5).await.expect("plan");

        assert_eq!(
            plan.get("t3").expect("t3").dependencies,
            vec!["t1".to_string(), "t2".to_string()]
        );
        assert_eq!(plan.max_depth, 1);
    }

    #[tokio::test]
    async fn test_unknown_suggestion_falls_back_to_keywords() {
        let backend = StaticBackend {
            tasks: vec![RawTask::new("probability of rate cut").with_agent("nonexistent-agent")],
        };
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(backend));
        let plan = planner.plan("r1", "odds", 5).await.expect("plan");
        assert_eq!(
            plan.subtasks[0].agent_id.as_deref(),
            Some("prediction_search")
        );
    }

    #[tokio::test]
    async fn test_zero_overlap_marks_unmappable() {
        let backend = StaticBackend {
            tasks: vec![
                RawTask::new("fetch market data prices"),
                RawTask::new("water the office plants"),
            ],
        };
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(backend));
        let plan = planner.plan("r1", "q", 5).await.expect("plan");

        assert!(plan.subtasks[0].mappable);
        assert!(!plan.subtasks[1].mappable);
        assert_eq!(plan.unmappable_count(), 1);
    }

    #[tokio::test]
    async fn test_cycle_is_fatal() {
        let backend = StaticBackend {
            tasks: vec![
                RawTask::new("market data step one")
                    .with_agent("market_data")
                    .with_dependencies(vec!["2".to_string()]),
                RawTask::new("market data step two")
                    .with_agent("market_data")
                    .with_dependencies(vec!["1".to_string()]),
            ],
        };
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(backend));
        match planner.plan("r1", "q", 5).await {
            Err(PlanError::Cycle(cycle)) => {
                assert!(cycle.contains(&"t1".to_string()));
                assert!(cycle.contains(&"t2".to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_subtasks_caps_decomposition() {
        let backend = StaticBackend {
            tasks: (0..10)
                .map(|i| RawTask::new(format!("market data slice {i}")).with_agent("market_data"))
                .collect(),
        };
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(backend));
        let plan = planner.plan("r1", "q", 3).await.expect("plan");
        assert_eq!(plan.subtasks.len(), 3);
    }

    #[tokio::test]
    async fn test_independent_tasks_share_one_parallel_group() {
        let backend = StaticBackend {
            tasks: vec![
                RawTask::new("bitcoin prediction markets").with_agent("prediction_search"),
                RawTask::new("bitcoin market data").with_agent("market_data"),
            ],
        };
        let planner = Stage1Planner::new(registry()).with_backend(Arc::new(backend));
        let plan = planner.plan("r1", "bitcoin", 5).await.expect("plan");

        assert_eq!(
            plan.parallel_groups,
            vec![vec!["t1".to_string(), "t2".to_string()]]
        );
        assert_eq!(plan.dependency_paths.len(), 2);
    }
}
