//! # Prism Runtime
//!
//! Wires the planning stages to execution:
//! - Coder: turns path plans into pure execution-plan data
//! - WorkerExecutor: dependency-aware parallel dispatch with dual persistence
//! - Runner: consolidation of recorded outputs into one answer
//! - OrchestratorAgent: the `run(query, options)` entry point

pub mod coder;
pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod runner;

pub use coder::{Coder, ExecutionPlan, ExecutionStep};
pub use config::{load_config, ConfigError, EngineConfig};
pub use executor::{ExecutionReport, ExecutorConfig, ExecutorError, WorkerExecutor, WorkerHost};
pub use orchestrator::{OrchestratorAgent, OrchestratorError, RunMetadata, RunOptions, RunResult};
pub use runner::{ConsolidatedResult, Runner};
