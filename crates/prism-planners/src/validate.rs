//! Answer validation
//!
//! Combines the collaborator's verdict with deterministic local checks.
//! When the collaborator is unavailable the local checks stand alone.

use std::collections::HashSet;
use std::sync::Arc;

use prism_core::store::{RunSummary, TaskOutputRecord};

use crate::backend::{PlannerBackend, ValidationReport};

const MIN_ANSWER_CHARS: usize = 50;
const MIN_KEYWORD_OVERLAP: f64 = 0.3;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were",
];

/// Validates consolidated answers.
pub struct AnswerValidator {
    backend: Option<Arc<dyn PlannerBackend>>,
}

impl AnswerValidator {
    /// Local-checks-only validator
    pub fn new() -> Self {
        Self { backend: None }
    }

    /// Attach the AI collaborator
    pub fn with_backend(mut self, backend: Arc<dyn PlannerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Validate an answer against the query and the recorded outputs.
    pub async fn validate(
        &self,
        query: &str,
        answer: &str,
        outputs: &[TaskOutputRecord],
        summary: &RunSummary,
    ) -> ValidationReport {
        let mut report = match &self.backend {
            Some(backend) => match backend.validate(query, answer, outputs).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(error = %e, "AI validation unavailable, using local checks only");
                    ValidationReport::passing(0.5)
                }
            },
            None => ValidationReport::passing(0.5),
        };

        self.apply_local_checks(&mut report, query, answer, outputs, summary);

        if report.valid {
            tracing::info!(score = report.completeness_score, "validation passed");
        } else {
            tracing::warn!(issues = ?report.issues, "validation failed");
        }
        report
    }

    fn apply_local_checks(
        &self,
        report: &mut ValidationReport,
        query: &str,
        answer: &str,
        outputs: &[TaskOutputRecord],
        summary: &RunSummary,
    ) {
        if answer.len() < MIN_ANSWER_CHARS {
            report
                .issues
                .push(format!("answer is very short (< {MIN_ANSWER_CHARS} characters)"));
            report
                .suggestions
                .push("ensure worker agents returned sufficient data".to_string());
        }

        if summary.failed > 0 {
            report
                .issues
                .push(format!("{} task(s) failed to execute", summary.failed));
            report
                .suggestions
                .push("review worker failure records for errors".to_string());
            report.valid = false;
            if summary.failed == summary.total_tasks && summary.total_tasks > 0 {
                report.issues.push("all tasks failed, no results obtained".to_string());
                report.completeness_score = 0.0;
            }
        }

        if outputs.is_empty() {
            report.issues.push("no worker outputs available".to_string());
            report.valid = false;
            report.completeness_score = 0.0;
        }

        let overlap = keyword_overlap(query, answer);
        if let Some(overlap) = overlap {
            if overlap < MIN_KEYWORD_OVERLAP {
                report.issues.push(format!(
                    "low keyword overlap between query and answer ({:.0}%)",
                    overlap * 100.0
                ));
                report
                    .suggestions
                    .push("answer may not be addressing the query directly".to_string());
            }
        }
    }
}

impl Default for AnswerValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fraction of non-stop-word query terms that appear in the answer.
/// None when the query carries no content words.
fn keyword_overlap(query: &str, answer: &str) -> Option<f64> {
    let terms = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
            .map(|w| w.to_string())
            .collect()
    };

    let query_terms = terms(query);
    if query_terms.is_empty() {
        return None;
    }
    let answer_terms = terms(answer);
    let shared = query_terms.intersection(&answer_terms).count();
    Some(shared as f64 / query_terms.len() as f64)
}
