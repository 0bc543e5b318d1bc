//! Prism CLI: run one analytical query end-to-end.
//!
//! Ships with demo worker agents backed by canned data so the pipeline is
//! runnable offline; point `--config` at a YAML file and set
//! `OPENAI_API_KEY` to plan with a real LLM collaborator.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use prism_core::tool::ToolLoader;
use prism_planners::{HttpLlmClient, HttpLlmClientConfig, LlmBackendConfig, LlmPlannerBackend};
use prism_runtime::{load_config, EngineConfig, OrchestratorAgent, RunOptions};
use prism_stores::{ArtifactBus, SqliteTaskStore};

#[derive(Debug, Parser)]
#[command(name = "prism", version, about = "Two-stage planner and DAG execution engine")]
struct Cli {
    /// Natural-language analytical query
    query: String,

    /// Engine config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace directory when no config file is given
    #[arg(long, default_value = ".prism")]
    workspace: PathBuf,

    /// Maximum number of subtasks
    #[arg(long)]
    max_subtasks: Option<usize>,

    /// Skip answer validation
    #[arg(long)]
    skip_validation: bool,

    /// Chat-completions model for the planner collaborator
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Print the full result as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::new(&cli.workspace),
    };

    let registry = demo::agent_registry();
    let tools = demo::tool_registry();
    let loader = Arc::new(ToolLoader::new(registry.clone(), tools));
    let host = demo::worker_host();

    let store = Arc::new(
        SqliteTaskStore::connect(&config.db_path())
            .await
            .context("opening task store")?,
    );
    let bus = Arc::new(ArtifactBus::new(&config.workspace));

    let mut orchestrator =
        OrchestratorAgent::new(config, registry, loader, host, store, bus);

    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        let client = HttpLlmClient::new(HttpLlmClientConfig {
            api_key: Some(api_key),
            ..HttpLlmClientConfig::default()
        })
        .context("building LLM client")?;
        let backend = LlmPlannerBackend::new(
            client,
            LlmBackendConfig {
                model: cli.model.clone(),
                ..LlmBackendConfig::default()
            },
        );
        orchestrator = orchestrator.with_backend(Arc::new(backend));
        tracing::info!(model = %cli.model, "LLM planner collaborator enabled");
    } else {
        tracing::info!("OPENAI_API_KEY not set, using deterministic fallback planning");
    }

    let options = RunOptions {
        max_subtasks: cli.max_subtasks,
        skip_validation: Some(cli.skip_validation),
        ..RunOptions::default()
    };

    let result = orchestrator.run(&cli.query, options).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("run_id: {}", result.run_id);
    println!();
    println!("{}", result.answer);
    println!();
    println!(
        "tasks: {} total, {} successful, {} failed, {} unmappable ({} ms)",
        result.metadata.total_tasks,
        result.metadata.successful_tasks,
        result.metadata.failed_tasks,
        result.metadata.unmappable_tasks,
        result.metadata.duration_ms,
    );
    if let Some(validation) = &result.validation {
        println!(
            "validation: {} (completeness {:.0}%)",
            if validation.valid { "passed" } else { "failed" },
            validation.completeness_score * 100.0
        );
        for issue in &validation.issues {
            println!("  issue: {issue}");
        }
    }
    Ok(())
}
