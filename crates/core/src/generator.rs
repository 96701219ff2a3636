//! The Generator contract consumed by the worker.
//!
//! A generator performs one generate-and-evaluate cycle per call. It is free to
//! retry its own transient failures internally; whatever it finally returns is
//! treated by the worker as the outcome of that iteration.

use crate::log_line::LogSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// What the generator suggests should happen after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Continue,
    Complete,
}

/// Structured result of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
}

impl IterationOutcome {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            recommendation: None,
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            recommendation: None,
        }
    }

    pub fn with_recommendation(mut self, recommendation: Recommendation) -> Self {
        self.recommendation = Some(recommendation);
        self
    }
}

/// The workspace as seen by a single iteration.
#[derive(Debug, Clone)]
pub struct WorkspaceState {
    pub path: PathBuf,
    pub generation_id: String,
    pub iteration: u32,
}

/// One finished iteration as remembered for later prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub outcome: IterationOutcome,
    /// Free-text feedback attached by a human when deciding on this iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Everything accumulated so far in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorContext {
    pub initial_prompt: String,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
}

impl PriorContext {
    pub fn new(initial_prompt: impl Into<String>) -> Self {
        Self {
            initial_prompt: initial_prompt.into(),
            history: Vec::new(),
        }
    }

    pub fn record(&mut self, iteration: u32, outcome: IterationOutcome, feedback: Option<String>) {
        self.history.push(IterationRecord {
            iteration,
            outcome,
            feedback,
        });
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.history.last()
    }

    /// Builds the default next prompt: the original request followed by a
    /// digest of earlier iterations and any feedback given on them.
    pub fn compose_prompt(&self) -> String {
        if self.history.is_empty() {
            return self.initial_prompt.clone();
        }
        let mut prompt = self.initial_prompt.clone();
        prompt.push_str("\n\n# Previous iterations\n");
        for record in &self.history {
            let status = if record.outcome.success {
                "succeeded"
            } else {
                "failed"
            };
            let _ = writeln!(
                prompt,
                "- iteration {} {}: {}",
                record.iteration, status, record.outcome.summary
            );
            if let Some(feedback) = &record.feedback {
                let _ = writeln!(prompt, "  feedback: {feedback}");
            }
        }
        prompt
    }

    /// Human-readable dump used for `/context` introspection.
    pub fn render(&self) -> String {
        let mut out = format!("prompt: {}\niterations: {}\n", self.initial_prompt, self.history.len());
        for record in &self.history {
            let _ = writeln!(
                out,
                "[{}] success={} {}",
                record.iteration, record.outcome.success, record.outcome.summary
            );
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// The iteration could not be completed; the session may still go on.
    #[error("Iteration failed: {0}")]
    Failed(String),
    /// The workspace or generator is unusable; the session cannot go on.
    #[error("Fatal generator failure: {0}")]
    Fatal(String),
    #[error("Iteration was cancelled")]
    Cancelled,
}

impl GeneratorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GeneratorError::Fatal(_))
    }
}

/// Defines the contract for anything that can run generation iterations.
///
/// Both operations may be slow, must honour `cancel`, and may fail.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Runs one iteration, streaming its output into `logs` as it is produced.
    async fn run_iteration(
        &self,
        prompt: &str,
        workspace: &WorkspaceState,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<IterationOutcome, GeneratorError>;

    /// Computes the prompt for the next iteration.
    async fn next_prompt(&self, context: &PriorContext) -> Result<String, GeneratorError> {
        Ok(context.compose_prompt())
    }
}
