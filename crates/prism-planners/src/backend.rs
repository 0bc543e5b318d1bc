//! Planner collaborator contract
//!
//! The engine consumes a narrow backend interface for the three LLM-shaped
//! jobs: query decomposition, answer composition, and answer validation.
//! Any failure surfaces as `PlannerUnavailable` so callers can fall back to
//! deterministic behavior.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use prism_core::agent::AgentRegistry;
use prism_core::store::TaskOutputRecord;
use prism_core::types::RawTask;

use crate::llm::{extract_json, LlmClient, LlmRequest};

/// The collaborator could not produce a usable result. Callers fall back to
/// the deterministic path (single-task plan, templated answer, local-only
/// validation).
#[derive(Debug, Clone, Error)]
#[error("planner collaborator unavailable: {0}")]
pub struct PlannerUnavailable(pub String);

/// Validation verdict for a consolidated answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    /// 0.0 ..= 1.0
    pub completeness_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    /// A passing report with no findings
    pub fn passing(score: f64) -> Self {
        Self {
            valid: true,
            completeness_score: score.clamp(0.0, 1.0),
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

/// Planner collaborator contract.
#[async_trait]
pub trait PlannerBackend: Send + Sync {
    /// Decompose a query into an ordered list of raw tasks.
    async fn decompose(
        &self,
        query: &str,
        registry: &AgentRegistry,
        max_subtasks: usize,
    ) -> Result<Vec<RawTask>, PlannerUnavailable>;

    /// Compose a natural-language answer from the consolidation digest.
    async fn compose_answer(&self, query: &str, digest: &Value)
        -> Result<String, PlannerUnavailable>;

    /// Judge whether the answer satisfies the query given the raw outputs.
    async fn validate(
        &self,
        query: &str,
        answer: &str,
        outputs: &[TaskOutputRecord],
    ) -> Result<ValidationReport, PlannerUnavailable>;
}

/// Config for the LLM-backed planner collaborator.
#[derive(Debug, Clone)]
pub struct LlmBackendConfig {
    pub model: String,
    pub temperature: f32,
}

impl Default for LlmBackendConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
        }
    }
}

/// LLM-backed planner collaborator.
pub struct LlmPlannerBackend<C: LlmClient> {
    client: C,
    config: LlmBackendConfig,
}

impl<C: LlmClient> LlmPlannerBackend<C> {
    pub fn new(client: C, config: LlmBackendConfig) -> Self {
        Self { client, config }
    }

    fn request(&self, system: String, user: String) -> LlmRequest {
        LlmRequest {
            system,
            user,
            model: self.config.model.clone(),
            temperature: self.config.temperature,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DecomposeJson {
    #[serde(default)]
    subtasks: Vec<RawTaskJson>,
}

#[derive(Debug, Deserialize)]
struct RawTaskJson {
    description: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    dependencies: Vec<Value>,
}

fn decompose_system_prompt(registry: &AgentRegistry, max_subtasks: usize) -> String {
    let mut system = String::new();
    system.push_str(
        "You are the task decomposition component of an analytical query engine.\n\
         Split the user's query into independent subtasks and assign each to one\n\
         of the available worker agents.\n\n",
    );
    system.push_str("Available agents:\n");
    for agent in registry.iter() {
        system.push_str(&format!(
            "- {}: {} (keywords: {})\n",
            agent.agent_id,
            agent.description,
            agent.keywords.join(", ")
        ));
    }
    system.push_str(&format!(
        "\nRules:\n\
         1) Return ONLY one JSON object: {{\"subtasks\": [{{\"description\": \"...\", \
         \"agent\": \"agent_id\", \"dependencies\": []}}]}}.\n\
         2) At most {max_subtasks} subtasks; prefer fewer.\n\
         3) Do NOT split a single filter/lookup into multiple subtasks.\n\
         4) dependencies reference earlier subtasks by 1-based position.\n\
         5) Only use the listed agent ids; omit agent when unsure.\n",
    ));
    system
}

#[async_trait]
impl<C: LlmClient> PlannerBackend for LlmPlannerBackend<C> {
    async fn decompose(
        &self,
        query: &str,
        registry: &AgentRegistry,
        max_subtasks: usize,
    ) -> Result<Vec<RawTask>, PlannerUnavailable> {
        let system = decompose_system_prompt(registry, max_subtasks);
        let user = format!("Query:\n{query}\n\nReturn JSON only.");
        let output = self
            .client
            .complete(self.request(system, user))
            .await
            .map_err(|e| PlannerUnavailable(e.to_string()))?;

        let json = extract_json(&output)
            .ok_or_else(|| PlannerUnavailable("decomposer output contained no JSON".to_string()))?;
        let parsed: DecomposeJson = serde_json::from_str(&json)
            .map_err(|e| PlannerUnavailable(format!("bad decomposer JSON: {e}")))?;

        tracing::info!(
            subtasks = parsed.subtasks.len(),
            model = %self.config.model,
            "decomposer returned raw tasks"
        );

        Ok(parsed
            .subtasks
            .into_iter()
            .map(|raw| RawTask {
                description: raw.description,
                suggested_agent: raw.agent,
                suggested_dependencies: raw
                    .dependencies
                    .into_iter()
                    .filter_map(|dep| match dep {
                        Value::String(s) => Some(s),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn compose_answer(
        &self,
        query: &str,
        digest: &Value,
    ) -> Result<String, PlannerUnavailable> {
        let system = "You are the consolidation component of an analytical query engine.\n\
                      Write a concise, factual answer to the user's query using ONLY the\n\
                      worker results provided. Mention notable failures. Plain text only."
            .to_string();
        let user = format!("Query:\n{query}\n\nWorker results digest:\n{digest}");
        let answer = self
            .client
            .complete(self.request(system, user))
            .await
            .map_err(|e| PlannerUnavailable(e.to_string()))?;
        let trimmed = answer.trim();
        if trimmed.is_empty() {
            return Err(PlannerUnavailable("empty answer from model".to_string()));
        }
        Ok(trimmed.to_string())
    }

    async fn validate(
        &self,
        query: &str,
        answer: &str,
        outputs: &[TaskOutputRecord],
    ) -> Result<ValidationReport, PlannerUnavailable> {
        let system = "You validate whether an answer satisfies an analytical query.\n\
                      Return ONLY one JSON object:\n\
                      {\"valid\": true, \"completeness_score\": 0.0, \"issues\": [], \"suggestions\": []}"
            .to_string();
        let outputs_digest: Vec<&Value> = outputs.iter().map(|o| &o.output).collect();
        let user = format!(
            "Query:\n{query}\n\nAnswer:\n{answer}\n\nWorker outputs:\n{}",
            serde_json::to_string(&outputs_digest)
                .map_err(|e| PlannerUnavailable(e.to_string()))?
        );

        let output = self
            .client
            .complete(self.request(system, user))
            .await
            .map_err(|e| PlannerUnavailable(e.to_string()))?;
        let json = extract_json(&output)
            .ok_or_else(|| PlannerUnavailable("validator output contained no JSON".to_string()))?;
        let mut report: ValidationReport = serde_json::from_str(&json)
            .map_err(|e| PlannerUnavailable(format!("bad validator JSON: {e}")))?;
        report.completeness_score = report.completeness_score.clamp(0.0, 1.0);
        Ok(report)
    }
}
