//! A deterministic [`Generator`] for tests and dry runs.
//!
//! Each call to `run_iteration` consumes the next scripted step. Once the
//! script is exhausted every further iteration succeeds and recommends
//! completion.

use crate::generator::{Generator, GeneratorError, IterationOutcome, Recommendation, WorkspaceState};
use crate::log_line::{LogLine, LogSink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum ScriptedResult {
    Outcome(IterationOutcome),
    Failed(String),
    Fatal(String),
}

/// One scripted iteration.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub logs: Vec<LogLine>,
    /// Time spent "working" after the logs are emitted.
    pub duration: Duration,
    pub result: ScriptedResult,
}

impl ScriptedStep {
    pub fn outcome(outcome: IterationOutcome) -> Self {
        Self {
            logs: Vec::new(),
            duration: Duration::ZERO,
            result: ScriptedResult::Outcome(outcome),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            logs: Vec::new(),
            duration: Duration::ZERO,
            result: ScriptedResult::Failed(reason.into()),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            logs: Vec::new(),
            duration: Duration::ZERO,
            result: ScriptedResult::Fatal(reason.into()),
        }
    }

    pub fn with_logs<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.logs.extend(lines.into_iter().map(LogLine::stdout));
        self
    }

    pub fn taking(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<ScriptedStep>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn next_step(&self) -> ScriptedStep {
        self.steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front())
            .unwrap_or_else(|| {
                ScriptedStep::outcome(
                    IterationOutcome::success("nothing left to do")
                        .with_recommendation(Recommendation::Complete),
                )
            })
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn run_iteration(
        &self,
        prompt: &str,
        _workspace: &WorkspaceState,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<IterationOutcome, GeneratorError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let step = self.next_step();

        for line in step.logs {
            if cancel.is_cancelled() {
                return Err(GeneratorError::Cancelled);
            }
            logs.emit(line).await;
        }

        if !step.duration.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(step.duration) => {}
                _ = cancel.cancelled() => return Err(GeneratorError::Cancelled),
            }
        }

        match step.result {
            ScriptedResult::Outcome(outcome) => Ok(outcome),
            ScriptedResult::Failed(reason) => Err(GeneratorError::Failed(reason)),
            ScriptedResult::Fatal(reason) => Err(GeneratorError::Fatal(reason)),
        }
    }
}
