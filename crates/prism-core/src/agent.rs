//! Agent registry and worker invocation contract
//!
//! Agents are named worker capabilities with a fixed tool allow-list.
//! The registry is populated once at engine start and read-only afterwards;
//! registration order is the tie-breaker for keyword mapping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tool::ToolError;
use crate::types::{RunId, TaskId};

/// A registered worker capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent name, e.g. `market_data`
    pub agent_id: String,
    /// Keyword hints used for task-to-agent mapping
    pub keywords: Vec<String>,
    /// Human-readable description (shown to the decomposer)
    pub description: String,
    /// Ordered input field names the agent expects
    pub input_params: Vec<String>,
    /// Tool allow-list; invoking anything else is rejected
    pub supported_tools: Vec<String>,
}

impl AgentDescriptor {
    /// Create a descriptor with an ID and description
    pub fn new(agent_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            keywords: Vec::new(),
            description: description.into(),
            input_params: Vec::new(),
            supported_tools: Vec::new(),
        }
    }

    /// Set keyword hints
    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Set expected input field names
    pub fn with_input_params(mut self, params: &[&str]) -> Self {
        self.input_params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set the tool allow-list
    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.supported_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Registration-ordered agent registry. Immutable after engine start.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentDescriptor>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Later registrations with a duplicate ID are ignored.
    pub fn register(&mut self, descriptor: AgentDescriptor) {
        if self.get(&descriptor.agent_id).is_none() {
            self.agents.push(descriptor);
        }
    }

    /// Look up an agent by ID
    pub fn get(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    /// Whether an agent is registered
    pub fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }

    /// Agent IDs in registration order
    pub fn ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.agent_id.as_str()).collect()
    }

    /// Iterate descriptors in registration order
    pub fn iter(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.iter()
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Score every agent by keyword overlap with the description and return
    /// the best non-zero match. Matching is case-insensitive on word
    /// boundaries; ties go to the earlier registration.
    pub fn best_match(&self, description: &str) -> Option<(&AgentDescriptor, usize)> {
        let haystack = description.to_lowercase();
        let mut best: Option<(&AgentDescriptor, usize)> = None;

        for agent in &self.agents {
            let score = agent
                .keywords
                .iter()
                .filter(|k| contains_word(&haystack, &k.to_lowercase()))
                .count();
            if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((agent, score));
            }
        }
        best
    }
}

/// Word-boundary substring check: `needle` must not be flanked by
/// alphanumeric characters in `haystack`. Both sides are expected to be
/// lowercase already.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(offset) = haystack[search_from..].find(needle) {
        let start = search_from + offset;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        // Advance past the first char of the match, not one byte
        search_from = start
            + needle
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
    }
    false
}

/// Correlation context handed to an agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Session correlation token (`YYYYMMDDhhmmss_<6-hex>`)
    pub session_id: String,
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    /// Create a context with a fresh session ID
    pub fn new(run_id: impl Into<RunId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            session_id: generate_session_id(Utc::now()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Generate a session identifier: `YYYYMMDDhhmmss_<6-hex-chars>`.
pub fn generate_session_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d%H%M%S"), &suffix[..6])
}

/// Output every agent invocation must return: a list of records plus
/// descriptive metadata. Mirrors the artifact payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub data: Vec<Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl AgentOutput {
    /// Create an output from records
    pub fn new(data: Vec<Value>) -> Self {
        Self {
            data,
            metadata: Value::Null,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Agent invocation errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("agent invocation failed: {0}")]
    Invocation(String),

    #[error("invocation cancelled")]
    Cancelled,
}

/// Worker agent contract. Agents never touch the Task Store or Artifact
/// Bus directly; persistence is engine-only.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// The agent's registry ID
    fn agent_id(&self) -> &str;

    /// Invoke the agent with an optional tool selection and extracted
    /// parameters. Must honor `ctx.cancellation` at I/O boundaries.
    async fn invoke(
        &self,
        tool_id: Option<&str>,
        params: Value,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register(
            AgentDescriptor::new("market_data", "SQL market data")
                .with_keywords(&["sql", "market data", "price", "symbol", "options"]),
        );
        registry.register(
            AgentDescriptor::new("prediction_search", "prediction markets")
                .with_keywords(&["prediction", "forecast", "probability", "odds"]),
        );
        registry
    }

    #[test]
    fn test_best_match_scores_keyword_overlap() {
        let registry = registry();
        let (agent, score) = registry
            .best_match("query the market data price for ZN")
            .expect("match");
        assert_eq!(agent.agent_id, "market_data");
        assert!(score >= 2);
    }

    #[test]
    fn test_best_match_requires_word_boundaries() {
        let registry = registry();
        // "pricey" must not match the "price" keyword
        assert!(registry.best_match("a pricey restaurant").is_none());
        assert!(registry.best_match("the price today").is_some());
    }

    #[test]
    fn test_best_match_tie_goes_to_registration_order() {
        let mut registry = AgentRegistry::new();
        registry
            .register(AgentDescriptor::new("first", "a").with_keywords(&["bitcoin"]));
        registry
            .register(AgentDescriptor::new("second", "b").with_keywords(&["bitcoin"]));

        let (agent, _) = registry.best_match("bitcoin analysis").expect("match");
        assert_eq!(agent.agent_id, "first");
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let mut registry = AgentRegistry::new();
        registry.register(AgentDescriptor::new("a", "original"));
        registry.register(AgentDescriptor::new("a", "replacement"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").map(|a| a.description.as_str()), Some("original"));
    }

    #[test]
    fn test_session_id_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 9).unwrap();
        let id = generate_session_id(now);
        let (stamp, suffix) = id.split_once('_').expect("separator");
        assert_eq!(stamp, "20240305143009");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
