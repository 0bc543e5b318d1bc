//! Tool descriptors, registry and the lazy tool loader
//!
//! Tools are the only way an agent touches external data. Each tool is
//! registered once at engine start with a typed input schema; the loader
//! hands descriptors to Stage 2 on demand (per dependency path) and
//! enforces each agent's allow-list on invocation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::{AgentRegistry, InvocationContext};

/// Simple field types supported by tool input schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Bool,
    List(Box<FieldKind>),
    Map,
}

impl FieldKind {
    /// Whether a JSON value conforms to this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::List(inner) => value
                .as_array()
                .map(|items| items.iter().all(|v| inner.accepts(v)))
                .unwrap_or(false),
            FieldKind::Map => value.is_object(),
        }
    }
}

/// A named, typed input field of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    /// Create a required field
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    /// Create an optional field
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Side-effect class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    Pure,
    ReadsExternal,
    WritesExternal,
}

/// Static description of a tool: identity, owner, and input schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool_id: String,
    /// Agent that owns this tool
    pub agent_id: String,
    pub description: String,
    pub input_schema: Vec<FieldSpec>,
    pub side_effect: SideEffect,
}

impl ToolDescriptor {
    /// Create a descriptor
    pub fn new(
        tool_id: impl Into<String>,
        agent_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            agent_id: agent_id.into(),
            description: description.into(),
            input_schema: Vec::new(),
            side_effect: SideEffect::Pure,
        }
    }

    /// Set the input schema
    pub fn with_schema(mut self, fields: Vec<FieldSpec>) -> Self {
        self.input_schema = fields;
        self
    }

    /// Set the side-effect class
    pub fn with_side_effect(mut self, side_effect: SideEffect) -> Self {
        self.side_effect = side_effect;
        self
    }

    /// Look up a schema field by name
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.input_schema.iter().find(|f| f.name == name)
    }
}

/// Tool errors
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    Unknown(String),

    #[error("tool '{tool_id}' is not in the allow-list of agent '{agent_id}'")]
    Unauthorized { tool_id: String, agent_id: String },

    #[error("tool '{tool_id}' failed: {cause}")]
    Invocation { tool_id: String, cause: String },

    #[error("internal tool registry error: {0}")]
    Internal(String),
}

/// A callable tool. Implementations live behind the registry; the engine
/// only ever sees descriptors and `invoke`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static descriptor for this tool
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with extracted parameters
    async fn invoke(&self, params: &Value, ctx: &InvocationContext) -> Result<Value, ToolError>;
}

/// Registration-ordered tool registry. Immutable after engine start.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its descriptor's `tool_id`
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let id = tool.descriptor().tool_id;
        if !self.tools.contains_key(&id) {
            self.order.push(id.clone());
            self.tools.insert(id, tool);
        }
    }

    /// Get a tool by ID
    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }

    /// Tool IDs in registration order
    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }
}

/// Lazy, cached tool loader.
///
/// Descriptors are materialized per agent on first request so a Stage 2
/// instance only ever sees the tools of the agents on its own path. The
/// cache is write-once per agent and read-only afterwards.
pub struct ToolLoader {
    agents: Arc<AgentRegistry>,
    tools: Arc<ToolRegistry>,
    cache: RwLock<HashMap<String, Vec<ToolDescriptor>>>,
}

impl ToolLoader {
    /// Create a loader over the process-scoped registries
    pub fn new(agents: Arc<AgentRegistry>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            agents,
            tools,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load (cached) tool descriptors for a set of agents, preserving
    /// allow-list order and deduplicating across agents.
    pub fn tools_for(&self, agent_ids: &[&str]) -> Result<Vec<ToolDescriptor>, ToolError> {
        let mut seen: Vec<String> = Vec::new();
        let mut union: Vec<ToolDescriptor> = Vec::new();

        for agent_id in agent_ids {
            if seen.iter().any(|s| s == agent_id) {
                continue;
            }
            seen.push(agent_id.to_string());

            let descriptors = self.load_agent(agent_id)?;
            for descriptor in descriptors {
                if !union.iter().any(|d| d.tool_id == descriptor.tool_id) {
                    union.push(descriptor);
                }
            }
        }
        Ok(union)
    }

    /// Descriptor for a single tool, if registered.
    pub fn descriptor(&self, tool_id: &str) -> Option<ToolDescriptor> {
        self.tools.get(tool_id).map(|t| t.descriptor())
    }

    /// Invoke a tool on behalf of an agent. Enforces the agent's allow-list.
    pub async fn invoke(
        &self,
        agent_id: &str,
        tool_id: &str,
        params: &Value,
        ctx: &InvocationContext,
    ) -> Result<Value, ToolError> {
        let allowed = self
            .agents
            .get(agent_id)
            .map(|a| a.supported_tools.iter().any(|t| t == tool_id))
            .unwrap_or(false);
        if !allowed {
            return Err(ToolError::Unauthorized {
                tool_id: tool_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }

        let tool = self
            .tools
            .get(tool_id)
            .ok_or_else(|| ToolError::Unknown(tool_id.to_string()))?;

        tracing::debug!(agent = agent_id, tool = tool_id, "invoking tool");
        tool.invoke(params, ctx).await
    }

    fn load_agent(&self, agent_id: &str) -> Result<Vec<ToolDescriptor>, ToolError> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|e| ToolError::Internal(e.to_string()))?;
            if let Some(descriptors) = cache.get(agent_id) {
                return Ok(descriptors.clone());
            }
        }

        let mut descriptors = Vec::new();
        if let Some(agent) = self.agents.get(agent_id) {
            for tool_id in &agent.supported_tools {
                match self.tools.get(tool_id) {
                    Some(tool) => descriptors.push(tool.descriptor()),
                    None => {
                        tracing::warn!(
                            agent = agent_id,
                            tool = %tool_id,
                            "allow-listed tool not found in registry"
                        );
                    }
                }
            }
        }

        let mut cache = self
            .cache
            .write()
            .map_err(|e| ToolError::Internal(e.to_string()))?;
        cache.insert(agent_id.to_string(), descriptors.clone());
        tracing::debug!(agent = agent_id, tools = descriptors.len(), "tools loaded");
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentDescriptor;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool {
        descriptor: ToolDescriptor,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            self.descriptor.clone()
        }

        async fn invoke(
            &self,
            params: &Value,
            _ctx: &InvocationContext,
        ) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(params.clone())
        }
    }

    fn fixture() -> (ToolLoader, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut agents = AgentRegistry::new();
        agents.register(
            AgentDescriptor::new("market_data", "sql agent").with_tools(&["run_query"]),
        );
        agents.register(
            AgentDescriptor::new("prediction_search", "prediction agent")
                .with_tools(&["search_markets"]),
        );

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool {
            descriptor: ToolDescriptor::new("run_query", "market_data", "run a SQL template")
                .with_schema(vec![
                    FieldSpec::required("template", FieldKind::String),
                    FieldSpec::optional("limit", FieldKind::Integer),
                ])
                .with_side_effect(SideEffect::ReadsExternal),
            calls: calls.clone(),
        }));
        tools.register(Arc::new(EchoTool {
            descriptor: ToolDescriptor::new(
                "search_markets",
                "prediction_search",
                "search prediction markets",
            )
            .with_schema(vec![
                FieldSpec::required("query", FieldKind::String),
                FieldSpec::optional("limit", FieldKind::Integer),
            ])
            .with_side_effect(SideEffect::ReadsExternal),
            calls: calls.clone(),
        }));

        (
            ToolLoader::new(Arc::new(agents), Arc::new(tools)),
            calls,
        )
    }

    #[test]
    fn test_tools_for_loads_only_requested_agents() {
        let (loader, _) = fixture();
        let descriptors = loader.tools_for(&["market_data"]).expect("load");
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].tool_id, "run_query");
    }

    #[test]
    fn test_tools_for_unions_and_deduplicates() {
        let (loader, _) = fixture();
        let descriptors = loader
            .tools_for(&["market_data", "prediction_search", "market_data"])
            .expect("load");
        let ids: Vec<&str> = descriptors.iter().map(|d| d.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["run_query", "search_markets"]);
    }

    #[tokio::test]
    async fn test_invoke_enforces_allow_list() {
        let (loader, _) = fixture();
        let ctx = InvocationContext::new("run-1", "t1");

        let err = loader
            .invoke("market_data", "search_markets", &json!({}), &ctx)
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, ToolError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_invoke_unknown_agent_is_unauthorized() {
        let (loader, _) = fixture();
        let ctx = InvocationContext::new("run-1", "t1");
        let err = loader
            .invoke("ghost", "run_query", &json!({}), &ctx)
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, ToolError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_invoke_routes_to_implementation() {
        let (loader, calls) = fixture();
        let ctx = InvocationContext::new("run-1", "t1");
        let out = loader
            .invoke("market_data", "run_query", &json!({"template": "by_symbol"}), &ctx)
            .await
            .expect("invoke");
        assert_eq!(out["template"], "by_symbol");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_field_kind_accepts() {
        assert!(FieldKind::Integer.accepts(&json!(3)));
        assert!(!FieldKind::Integer.accepts(&json!(3.5)));
        assert!(FieldKind::Number.accepts(&json!(3.5)));
        assert!(FieldKind::List(Box::new(FieldKind::Number)).accepts(&json!([1, 2.5])));
        assert!(!FieldKind::List(Box::new(FieldKind::String)).accepts(&json!([1])));
        assert!(FieldKind::Map.accepts(&json!({"a": 1})));
    }
}
