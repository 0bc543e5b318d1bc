//! # Prism Stores
//!
//! Storage implementations for the Prism engine:
//! - TaskStore implementations (SQLite, in-memory)
//! - ArtifactBus: content-addressed filesystem store for task outputs

mod artifact_bus;
mod memory;
mod sqlite;

pub use artifact_bus::{ArtifactBus, ArtifactMetadata, ArtifactPayload, BusError, Manifest};
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

// Re-export core store contract for convenience
pub use prism_core::store::{
    PlanRecord, RunSummary, StoreError, TaskOutputRecord, TaskStatus, TaskStore, WorkerRunRecord,
};
