//! # Prism Core
//!
//! Core building blocks for the Prism engine:
//! - Domain types: subtasks, plans, dependency paths
//! - DependencyAnalyzer: DAG validation and structural analysis
//! - AgentRegistry / ToolRegistry: process-scoped capability registries
//! - TaskStore trait: durable task lifecycle and output storage
//!
//! Note: Store implementations live in the prism-stores crate.

pub mod agent;
pub mod analyzer;
pub mod error;
pub mod store;
pub mod tool;
pub mod types;

pub use agent::{
    generate_session_id, AgentDescriptor, AgentError, AgentOutput, AgentRegistry,
    InvocationContext, WorkerAgent,
};
pub use analyzer::{Analysis, DependencyAnalyzer};
pub use error::PlanError;
pub use store::{
    PlanRecord, RunSummary, StoreError, TaskOutputRecord, TaskStatus, TaskStore, WorkerRunRecord,
};
pub use tool::{
    FieldKind, FieldSpec, SideEffect, Tool, ToolDescriptor, ToolError, ToolLoader, ToolRegistry,
};
pub use types::{PathPlan, Plan, RawTask, RunId, Subtask, TaskId};

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;
