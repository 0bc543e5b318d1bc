//! Stage 2 planner: per-path tool selection and parameter extraction
//!
//! One instance per dependency path. The instance only loads tools for the
//! agents on its own path (the context isolation point) and never touches
//! subtasks outside the path.

use prism_core::tool::{ToolDescriptor, ToolError, ToolLoader};
use prism_core::types::{PathPlan, Subtask, TaskId};

use crate::extract::ExtractorKind;

/// Stage 2 planner for one dependency path.
pub struct Stage2Planner {
    path_id: String,
    task_ids: Vec<TaskId>,
}

impl Stage2Planner {
    /// Create a planner for one path.
    pub fn new(path_id: impl Into<String>, task_ids: Vec<TaskId>) -> Self {
        Self {
            path_id: path_id.into(),
            task_ids,
        }
    }

    /// One isolated instance per dependency path, ids `path_1..path_n`.
    pub fn for_paths(paths: &[Vec<TaskId>]) -> Vec<Self> {
        paths
            .iter()
            .enumerate()
            .map(|(i, path)| Self::new(format!("path_{}", i + 1), path.clone()))
            .collect()
    }

    /// Path identifier
    pub fn path_id(&self) -> &str {
        &self.path_id
    }

    /// Enrich this path's subtasks with tool selections and extracted
    /// parameters. Schema mismatches set `needs_review` and never fail the
    /// path.
    pub fn enrich(
        &self,
        all_subtasks: &[Subtask],
        loader: &ToolLoader,
    ) -> Result<PathPlan, ToolError> {
        // Only this path's mappable tasks, in path order
        let path_tasks: Vec<&Subtask> = self
            .task_ids
            .iter()
            .filter_map(|id| all_subtasks.iter().find(|t| &t.id == id))
            .filter(|t| t.mappable)
            .collect();

        let mut agents: Vec<String> = Vec::new();
        for task in &path_tasks {
            if let Some(agent) = &task.agent_id {
                if !agents.contains(agent) {
                    agents.push(agent.clone());
                }
            }
        }

        let agent_refs: Vec<&str> = agents.iter().map(String::as_str).collect();
        let descriptors = loader.tools_for(&agent_refs)?;
        let tools_loaded: Vec<String> = descriptors.iter().map(|d| d.tool_id.clone()).collect();

        tracing::info!(
            path = %self.path_id,
            tasks = path_tasks.len(),
            agents = agents.len(),
            tools = tools_loaded.len(),
            "stage 2 enrichment started"
        );

        let mut enriched = Vec::with_capacity(path_tasks.len());
        for task in path_tasks {
            enriched.push(enrich_task(task, &descriptors));
        }

        Ok(PathPlan {
            path_id: self.path_id.clone(),
            task_ids: self.task_ids.clone(),
            subtasks: enriched,
            agents,
            tools_loaded,
        })
    }
}

fn enrich_task(task: &Subtask, descriptors: &[ToolDescriptor]) -> Subtask {
    let mut enriched = task.clone();
    let Some(agent_id) = &task.agent_id else {
        enriched.needs_review = true;
        return enriched;
    };

    let agent_tools: Vec<&ToolDescriptor> = descriptors
        .iter()
        .filter(|d| &d.agent_id == agent_id)
        .collect();

    let selected = select_tool(&task.description, &agent_tools);
    let params = ExtractorKind::for_agent(agent_id).extract(&task.description);

    match selected {
        Some(descriptor) => {
            enriched.tool_id = Some(descriptor.tool_id.clone());
            if !params_match_schema(&params, descriptor) {
                tracing::warn!(
                    task = %task.id,
                    tool = %descriptor.tool_id,
                    "extracted params do not satisfy tool schema, flagging for review"
                );
                enriched.needs_review = true;
            }
        }
        None => {
            tracing::warn!(task = %task.id, agent = %agent_id, "no tool available for agent");
            enriched.needs_review = true;
        }
    }
    enriched.params = params;
    enriched
}

/// Select a tool for a task: a single tool wins outright, otherwise the
/// highest keyword overlap between the description and the tool's id plus
/// schema field names. Ties keep allow-list order.
fn select_tool<'a>(
    description: &str,
    agent_tools: &[&'a ToolDescriptor],
) -> Option<&'a ToolDescriptor> {
    match agent_tools {
        [] => None,
        [only] => Some(*only),
        many => {
            let lower = description.to_lowercase();
            let mut best: Option<(&'a ToolDescriptor, usize)> = None;
            for descriptor in many.iter().copied() {
                let mut score = 0;
                for word in descriptor.tool_id.split('_') {
                    if !word.is_empty() && lower.contains(&word.to_lowercase()) {
                        score += 1;
                    }
                }
                for field in &descriptor.input_schema {
                    if lower.contains(&field.name.to_lowercase()) {
                        score += 1;
                    }
                }
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((descriptor, score));
                }
            }
            best.map(|(d, _)| d)
        }
    }
}

/// Best-effort schema check: every extracted key must name a schema field of
/// a compatible type, and required fields must be present.
fn params_match_schema(params: &serde_json::Value, descriptor: &ToolDescriptor) -> bool {
    let Some(object) = params.as_object() else {
        return descriptor.input_schema.is_empty();
    };

    for (key, value) in object {
        match descriptor.field(key) {
            Some(field) => {
                if !value.is_null() && !field.kind.accepts(value) {
                    return false;
                }
            }
            None => return false,
        }
    }

    descriptor
        .input_schema
        .iter()
        .filter(|f| f.required)
        .all(|f| object.get(&f.name).map(|v| !v.is_null()).unwrap_or(false))
}
