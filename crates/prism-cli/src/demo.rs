//! Demo registries and canned worker agents.
//!
//! Production deployments register their own workers behind the
//! `WorkerAgent` seam; these stubs exist so the CLI exercises the whole
//! pipeline without external services.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use prism_core::agent::{
    AgentDescriptor, AgentError, AgentOutput, AgentRegistry, InvocationContext, WorkerAgent,
};
use prism_core::tool::{
    FieldKind, FieldSpec, SideEffect, Tool, ToolDescriptor, ToolError, ToolRegistry,
};
use prism_runtime::WorkerHost;

pub fn agent_registry() -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    registry.register(
        AgentDescriptor::new(
            "market_data",
            "Market data agent for futures and options. Runs parameterised SQL templates \
             over the market_data table for prices, volumes and related fields.",
        )
        .with_keywords(&[
            "sql",
            "market data",
            "database",
            "query",
            "price",
            "bid",
            "ask",
            "symbol",
            "futures",
            "options",
        ])
        .with_input_params(&["template", "params", "columns", "limit"])
        .with_tools(&["run_query"]),
    );
    registry.register(
        AgentDescriptor::new(
            "prediction_search",
            "Prediction market agent. Searches markets by topic and returns prices, \
             probabilities and volumes.",
        )
        .with_keywords(&[
            "prediction",
            "prediction market",
            "forecast",
            "probability",
            "odds",
            "betting",
            "sentiment",
            "trend",
        ])
        .with_input_params(&["query", "session_id", "limit"])
        .with_tools(&["search_markets"]),
    );
    Arc::new(registry)
}

pub fn tool_registry() -> Arc<ToolRegistry> {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(DemoTool::new(
        ToolDescriptor::new("run_query", "market_data", "Run a parameterised SQL template")
            .with_schema(vec![
                FieldSpec::required("template", FieldKind::String),
                FieldSpec::required("params", FieldKind::Map),
                FieldSpec::optional("columns", FieldKind::List(Box::new(FieldKind::String))),
                FieldSpec::optional("limit", FieldKind::Integer),
                FieldSpec::optional("order_by_column", FieldKind::String),
                FieldSpec::optional("order_by_direction", FieldKind::String),
            ])
            .with_side_effect(SideEffect::ReadsExternal),
    )));
    tools.register(Arc::new(DemoTool::new(
        ToolDescriptor::new("search_markets", "prediction_search", "Search prediction markets")
            .with_schema(vec![
                FieldSpec::required("query", FieldKind::String),
                FieldSpec::optional("limit", FieldKind::Integer),
                FieldSpec::optional("session_id", FieldKind::String),
            ])
            .with_side_effect(SideEffect::ReadsExternal),
    )));
    Arc::new(tools)
}

pub fn worker_host() -> Arc<WorkerHost> {
    let mut host = WorkerHost::new();
    host.register(Arc::new(DemoMarketDataAgent));
    host.register(Arc::new(DemoPredictionAgent));
    Arc::new(host)
}

struct DemoTool {
    descriptor: ToolDescriptor,
}

impl DemoTool {
    fn new(descriptor: ToolDescriptor) -> Self {
        Self { descriptor }
    }
}

#[async_trait]
impl Tool for DemoTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, params: &Value, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        Ok(params.clone())
    }
}

struct DemoMarketDataAgent;

#[async_trait]
impl WorkerAgent for DemoMarketDataAgent {
    fn agent_id(&self) -> &str {
        "market_data"
    }

    async fn invoke(
        &self,
        _tool_id: Option<&str>,
        params: Value,
        _ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(3)
            .min(3) as usize;
        let rows: Vec<Value> = [
            json!({"symbol": "ZN", "price": 112.52, "file_date": "2025-07-30"}),
            json!({"symbol": "ZN", "price": 112.67, "file_date": "2025-07-31"}),
            json!({"symbol": "ZN.C", "price": 0.84, "file_date": "2025-08-01"}),
        ]
        .into_iter()
        .take(limit)
        .collect();

        Ok(AgentOutput::new(rows)
            .with_metadata(json!({"query": params.get("template"), "version": "1.0"})))
    }
}

struct DemoPredictionAgent;

#[async_trait]
impl WorkerAgent for DemoPredictionAgent {
    fn agent_id(&self) -> &str {
        "prediction_search"
    }

    async fn invoke(
        &self,
        _tool_id: Option<&str>,
        params: Value,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        let topic = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(AgentOutput::new(vec![
            json!({"market": format!("{topic} by year end"), "probability": 0.62, "volume": 125000.0}),
            json!({"market": format!("{topic} next quarter"), "probability": 0.31, "volume": 48000.0}),
        ])
        .with_metadata(json!({"query": topic, "session_id": ctx.session_id, "version": "1.0"})))
    }
}
