//! Runner: result consolidation
//!
//! Reads every recorded task output for a run, buckets by agent, computes
//! summary statistics, produces a natural-language answer (via the LLM
//! collaborator when configured, templated otherwise), and optionally
//! validates the answer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use prism_core::store::{RunSummary, StoreError, TaskStore};
use prism_planners::backend::{PlannerBackend, ValidationReport};
use prism_planners::extract::ExtractorKind;
use prism_planners::validate::AnswerValidator;

/// Consolidated view of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedResult {
    pub query: String,
    pub answer: String,
    /// Agent id -> list of task output documents
    pub data_by_agent: BTreeMap<String, Vec<Value>>,
    pub summary_stats: Value,
    pub validation: Option<ValidationReport>,
    pub summary: RunSummary,
}

/// Consolidates recorded outputs into one answer.
pub struct Runner {
    store: Arc<dyn TaskStore>,
    backend: Option<Arc<dyn PlannerBackend>>,
}

impl Runner {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            backend: None,
        }
    }

    /// Attach the LLM collaborator used for answer composition and
    /// validation.
    pub fn with_backend(mut self, backend: Arc<dyn PlannerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Consolidate all results for a run.
    pub async fn consolidate(
        &self,
        run_id: &str,
        query: &str,
        skip_validation: bool,
    ) -> Result<ConsolidatedResult, StoreError> {
        let outputs = self.store.all_outputs(run_id).await?;
        let summary = self.store.run_summary(run_id).await?;
        let failed = self.store.failed_tasks(run_id).await?;

        tracing::info!(
            run_id,
            outputs = outputs.len(),
            failed = failed.len(),
            "consolidation started"
        );

        let mut data_by_agent: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for output in &outputs {
            data_by_agent
                .entry(output.agent_id.clone())
                .or_default()
                .push(output.output.clone());
        }

        let summary_stats = compute_summary_stats(&data_by_agent);
        let answer = self
            .compose_answer(query, &data_by_agent, &summary_stats, &summary)
            .await;

        let validation = if skip_validation {
            None
        } else {
            let mut validator = AnswerValidator::new();
            if let Some(backend) = &self.backend {
                validator = validator.with_backend(backend.clone());
            }
            Some(validator.validate(query, &answer, &outputs, &summary).await)
        };

        Ok(ConsolidatedResult {
            query: query.to_string(),
            answer,
            data_by_agent,
            summary_stats,
            validation,
            summary,
        })
    }

    async fn compose_answer(
        &self,
        query: &str,
        data_by_agent: &BTreeMap<String, Vec<Value>>,
        summary_stats: &Value,
        summary: &RunSummary,
    ) -> String {
        if let Some(backend) = &self.backend {
            let digest = json!({
                "summary_stats": summary_stats,
                "tasks": {
                    "total": summary.total_tasks,
                    "successful": summary.successful,
                    "failed": summary.failed,
                },
                "agents": summary.agents_used,
            });
            match backend.compose_answer(query, &digest).await {
                Ok(answer) => return answer,
                Err(e) => {
                    tracing::warn!(error = %e, "answer composition unavailable, using template");
                }
            }
        }
        template_answer(query, data_by_agent, summary_stats, summary)
    }
}

/// Deterministic templated answer: one bullet per agent with its row count
/// and salient summary fields.
fn template_answer(
    query: &str,
    data_by_agent: &BTreeMap<String, Vec<Value>>,
    summary_stats: &Value,
    summary: &RunSummary,
) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Query: {query}"));
    lines.push(format!(
        "Executed {} tasks: {} successful, {} failed.",
        summary.total_tasks, summary.successful, summary.failed
    ));

    for agent_id in data_by_agent.keys() {
        let stats = &summary_stats[agent_id];
        let row_count = stats["row_count"].as_u64().unwrap_or(0);
        let mut line = format!("- {agent_id}: {row_count} rows");

        if let (Some(min), Some(max)) = (stats["min_price"].as_f64(), stats["max_price"].as_f64())
        {
            line.push_str(&format!(", price range {min:.2} to {max:.2}"));
        }
        if let Some(avg) = stats["avg_price"].as_f64() {
            line.push_str(&format!(", average price {avg:.2}"));
        }
        if let Some(probability) = stats["avg_probability"].as_f64() {
            line.push_str(&format!(", average probability {probability:.2}"));
        }
        if let Some(volume) = stats["total_volume"].as_f64() {
            line.push_str(&format!(", total volume {volume:.0}"));
        }
        lines.push(line);
    }

    if summary.failed > 0 {
        lines.push(format!("Warning: {} task(s) failed.", summary.failed));
    }
    lines.join("\n")
}

/// Per-agent statistics over the flattened output rows. Market-data agents
/// report price aggregates; prediction agents report probability and
/// volume aggregates.
fn compute_summary_stats(data_by_agent: &BTreeMap<String, Vec<Value>>) -> Value {
    let mut stats = Map::new();
    for (agent_id, outputs) in data_by_agent {
        let rows: Vec<&Value> = outputs
            .iter()
            .flat_map(|output| match output {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .collect();

        let mut agent_stats = Map::new();
        agent_stats.insert("row_count".to_string(), json!(rows.len()));

        match ExtractorKind::for_agent(agent_id) {
            ExtractorKind::SqlMarket => {
                let prices: Vec<f64> = rows
                    .iter()
                    .filter_map(|r| r.get("price").and_then(Value::as_f64))
                    .collect();
                if !prices.is_empty() {
                    let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let avg = prices.iter().sum::<f64>() / prices.len() as f64;
                    agent_stats.insert("min_price".to_string(), json!(min));
                    agent_stats.insert("max_price".to_string(), json!(max));
                    agent_stats.insert("avg_price".to_string(), json!(avg));
                }
            }
            ExtractorKind::PredictionSearch => {
                let probabilities: Vec<f64> = rows
                    .iter()
                    .filter_map(|r| r.get("probability").and_then(Value::as_f64))
                    .collect();
                if !probabilities.is_empty() {
                    let avg = probabilities.iter().sum::<f64>() / probabilities.len() as f64;
                    agent_stats.insert("avg_probability".to_string(), json!(avg));
                }
                let volume: f64 = rows
                    .iter()
                    .filter_map(|r| r.get("volume").and_then(Value::as_f64))
                    .sum();
                if volume > 0.0 {
                    agent_stats.insert("total_volume".to_string(), json!(volume));
                }
            }
            ExtractorKind::Generic => {}
        }

        stats.insert(agent_id.clone(), Value::Object(agent_stats));
    }
    Value::Object(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prism_stores::InMemoryTaskStore;

    async fn seeded_store() -> Arc<InMemoryTaskStore> {
        let store = Arc::new(InMemoryTaskStore::new());
        store
            .start_task("r1", "t1", "market_data", Utc::now())
            .await
            .expect("start t1");
        store
            .complete_task("r1", "t1", 10, None)
            .await
            .expect("complete t1");
        store
            .store_output(
                "r1",
                "t1",
                "market_data",
                &json!([
                    {"symbol": "ZN", "price": 112.5},
                    {"symbol": "ZN", "price": 112.9}
                ]),
                &json!({"row_count": 2}),
            )
            .await
            .expect("output t1");

        store
            .start_task("r1", "t2", "prediction_search", Utc::now())
            .await
            .expect("start t2");
        store
            .complete_task("r1", "t2", 20, None)
            .await
            .expect("complete t2");
        store
            .store_output(
                "r1",
                "t2",
                "prediction_search",
                &json!([
                    {"market": "btc-2025", "probability": 0.6, "volume": 1000.0},
                    {"market": "btc-2026", "probability": 0.4, "volume": 3000.0}
                ]),
                &json!({"row_count": 2}),
            )
            .await
            .expect("output t2");
        store
    }

    #[tokio::test]
    async fn test_consolidation_buckets_by_agent_and_computes_stats() {
        let store = seeded_store().await;
        let runner = Runner::new(store);
        let result = runner
            .consolidate("r1", "bitcoin market data and predictions", false)
            .await
            .expect("consolidate");

        assert_eq!(result.data_by_agent.len(), 2);
        assert!(result.data_by_agent.contains_key("market_data"));
        assert!(result.data_by_agent.contains_key("prediction_search"));

        let md = &result.summary_stats["market_data"];
        assert_eq!(md["row_count"], 2);
        assert_eq!(md["min_price"], 112.5);
        assert_eq!(md["max_price"], 112.9);

        let ps = &result.summary_stats["prediction_search"];
        assert_eq!(ps["avg_probability"], 0.5);
        assert_eq!(ps["total_volume"], 4000.0);

        assert!(result.answer.contains("market_data"));
        assert!(result.validation.is_some());
    }

    #[tokio::test]
    async fn test_consolidation_is_idempotent_on_data() {
        let store = seeded_store().await;
        let runner = Runner::new(store);
        let first = runner
            .consolidate("r1", "bitcoin", true)
            .await
            .expect("first");
        let second = runner
            .consolidate("r1", "bitcoin", true)
            .await
            .expect("second");

        assert_eq!(first.data_by_agent, second.data_by_agent);
        assert_eq!(first.summary_stats, second.summary_stats);
    }

    #[tokio::test]
    async fn test_skip_validation_omits_report() {
        let store = seeded_store().await;
        let runner = Runner::new(store);
        let result = runner
            .consolidate("r1", "bitcoin", true)
            .await
            .expect("consolidate");
        assert!(result.validation.is_none());
    }

    #[tokio::test]
    async fn test_empty_run_produces_empty_answer_shell() {
        let store: Arc<InMemoryTaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = Runner::new(store);
        let result = runner
            .consolidate("missing", "anything", true)
            .await
            .expect("consolidate");

        assert!(result.data_by_agent.is_empty());
        assert_eq!(result.summary.total_tasks, 0);
        assert!(result.answer.contains("Executed 0 tasks"));
    }
}
