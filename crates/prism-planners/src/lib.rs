//! # Prism Planners
//!
//! The two planning stages of the engine plus their collaborators:
//! - Stage 1: query decomposition, task normalization, agent mapping
//! - Stage 2: per-path tool selection and parameter extraction
//! - PlannerBackend: the LLM collaborator contract (with HTTP client)
//! - AnswerValidator: consolidated-answer validation

pub mod backend;
pub mod extract;
pub mod llm;
pub mod stage1;
pub mod stage2;
pub mod validate;

pub use backend::{
    LlmBackendConfig, LlmPlannerBackend, PlannerBackend, PlannerUnavailable, ValidationReport,
};
pub use extract::ExtractorKind;
pub use llm::{HttpLlmClient, HttpLlmClientConfig, LlmClient, LlmError, LlmRequest, MockLlmClient};
pub use stage1::Stage1Planner;
pub use stage2::Stage2Planner;
pub use validate::AnswerValidator;
