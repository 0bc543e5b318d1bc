//! Coder: per-path execution plan generation
//!
//! The execution plan is a pure data structure; it carries no code. For
//! each path the coder emits the ordered invocation steps, each paired with
//! the dependency ids the dispatcher must observe as successful in the
//! task store before starting the step.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use prism_core::types::{PathPlan, RunId, TaskId};

/// One agent invocation within an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub task_id: TaskId,
    pub agent_id: String,
    pub tool_id: Option<String>,
    pub params: Value,
    /// Full dependency list; checked against the task store before start
    pub dependencies: Vec<TaskId>,
    /// Dependencies satisfied outside this path's earlier steps; these are
    /// the cross-path waits
    pub wait_for: Vec<TaskId>,
    pub needs_review: bool,
}

/// Ordered execution plan for one dependency path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub run_id: RunId,
    pub path_id: String,
    pub steps: Vec<ExecutionStep>,
}

/// Turns enriched path plans into execution plans.
#[derive(Debug, Default)]
pub struct Coder;

impl Coder {
    pub fn new() -> Self {
        Self
    }

    /// Build the execution plan for one path. Steps keep the path's
    /// topological order; `wait_for` lists the dependencies that earlier
    /// steps of this path do not already cover.
    pub fn plan_path(&self, path_plan: &PathPlan, run_id: &str) -> ExecutionPlan {
        let mut earlier: Vec<&str> = Vec::new();
        let mut steps = Vec::with_capacity(path_plan.subtasks.len());

        for task in &path_plan.subtasks {
            let wait_for: Vec<TaskId> = task
                .dependencies
                .iter()
                .filter(|dep| !earlier.contains(&dep.as_str()))
                .cloned()
                .collect();

            steps.push(ExecutionStep {
                task_id: task.id.clone(),
                agent_id: task.agent_id.clone().unwrap_or_default(),
                tool_id: task.tool_id.clone(),
                params: task.params.clone(),
                dependencies: task.dependencies.clone(),
                wait_for,
                needs_review: task.needs_review,
            });
            earlier.push(task.id.as_str());
        }

        tracing::debug!(
            run_id,
            path = %path_plan.path_id,
            steps = steps.len(),
            "execution plan generated"
        );

        ExecutionPlan {
            run_id: run_id.to_string(),
            path_id: path_plan.path_id.clone(),
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::types::Subtask;
    use serde_json::json;

    fn path_plan() -> PathPlan {
        PathPlan {
            path_id: "path_1".to_string(),
            task_ids: vec!["t1".to_string(), "t2".to_string(), "t4".to_string()],
            subtasks: vec![
                Subtask::new("t1", "root")
                    .with_agent("market_data")
                    .with_tool("run_query")
                    .with_params(json!({"limit": 1})),
                Subtask::new("t2", "mid")
                    .with_agent("market_data")
                    .with_dependencies(vec!["t1".to_string()]),
                // Diamond merge: t4 also depends on t3 from the sibling path
                Subtask::new("t4", "leaf")
                    .with_agent("prediction_search")
                    .with_dependencies(vec!["t2".to_string(), "t3".to_string()]),
            ],
            agents: vec!["market_data".to_string(), "prediction_search".to_string()],
            tools_loaded: vec!["run_query".to_string()],
        }
    }

    #[test]
    fn test_steps_keep_path_order() {
        let plan = Coder::new().plan_path(&path_plan(), "r1");
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t4"]);
        assert_eq!(plan.run_id, "r1");
    }

    #[test]
    fn test_wait_for_covers_only_cross_path_dependencies() {
        let plan = Coder::new().plan_path(&path_plan(), "r1");
        assert!(plan.steps[0].wait_for.is_empty());
        // t1 runs earlier in the same path
        assert!(plan.steps[1].wait_for.is_empty());
        // t3 lives on the sibling path, t2 does not
        assert_eq!(plan.steps[2].wait_for, vec!["t3".to_string()]);
        assert_eq!(
            plan.steps[2].dependencies,
            vec!["t2".to_string(), "t3".to_string()]
        );
    }

    #[test]
    fn test_plan_serializes_as_pure_data() {
        let plan = Coder::new().plan_path(&path_plan(), "r1");
        let value = serde_json::to_value(&plan).expect("encode");
        assert_eq!(value["path_id"], "path_1");
        assert_eq!(value["steps"][0]["task_id"], "t1");
        let decoded: ExecutionPlan = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded.steps.len(), 3);
    }
}
