//! Drives one generation session: the iteration loop, decision prompts and
//! the terminal message.
//!
//! The controller never touches the socket. It queues frames on the
//! connection's outbound channel and learns about connectivity and inbound
//! messages through [`LinkEvent`]s. All `Session` state changes happen on the
//! controller's own task.

use super::connection::{ConnectionLink, LinkEvent, Outbound, SessionPhase};
use super::decision::{self, GateAction};
use super::logs::{LogStats, LogStreamHandle};
use super::protocol::{DecisionChoice, Message, Mode};
use crate::error::WorkerError;
use crate::store::{SessionSnapshot, SessionStore};
use chrono::Utc;
use genloop_core::{
    Generator, GeneratorError, IterationOutcome, LogSink, PriorContext, WorkspaceState,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long a cancelled generator may take to wind down.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Init,
    Ready,
    Iterating,
    AwaitingDecision,
    Complete,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Aborted
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Init => "INIT",
            SessionStatus::Ready => "READY",
            SessionStatus::Iterating => "ITERATING",
            SessionStatus::AwaitingDecision => "AWAITING_DECISION",
            SessionStatus::Complete => "COMPLETE",
            SessionStatus::Failed => "FAILED",
            SessionStatus::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// The state of one generation request.
#[derive(Debug, Clone)]
pub struct Session {
    generation_id: String,
    workspace_path: PathBuf,
    mode: Mode,
    prompt: String,
    iteration: u32,
    status: SessionStatus,
    context: PriorContext,
    restored: bool,
}

impl Session {
    pub fn new(
        generation_id: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
        mode: Mode,
        prompt: impl Into<String>,
    ) -> Self {
        let prompt = prompt.into();
        Self {
            generation_id: generation_id.into(),
            workspace_path: workspace_path.into(),
            mode,
            context: PriorContext::new(prompt.clone()),
            prompt,
            iteration: 0,
            status: SessionStatus::Init,
            restored: false,
        }
    }

    /// Rebuilds a session from a saved snapshot. The snapshot's mode wins.
    pub fn from_snapshot(snapshot: SessionSnapshot, workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            generation_id: snapshot.generation_id,
            workspace_path: workspace_path.into(),
            mode: snapshot.mode,
            prompt: snapshot.prompt,
            iteration: snapshot.iteration,
            status: SessionStatus::Init,
            context: snapshot.context,
            restored: true,
        }
    }

    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn context(&self) -> &PriorContext {
        &self.context
    }

    /// Whether this session was resumed from a snapshot.
    pub fn restored(&self) -> bool {
        self.restored
    }

    fn transition(&mut self, next: SessionStatus) {
        if self.status != next {
            debug!(from = %self.status, to = %next, iteration = self.iteration, "Session status changed");
            self.status = next;
        }
    }
}

/// What to do when a decision prompt goes unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionDefault {
    Continue,
    Abort,
}

impl fmt::Display for DecisionDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionDefault::Continue => write!(f, "continue"),
            DecisionDefault::Abort => write!(f, "abort"),
        }
    }
}

impl FromStr for DecisionDefault {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "continue" => Ok(DecisionDefault::Continue),
            "abort" => Ok(DecisionDefault::Abort),
            other => Err(format!("'{other}' is not one of continue, abort")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_iterations: u32,
    pub generation_timeout: Duration,
    pub decision_timeout: Duration,
    pub decision_default: DecisionDefault,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            generation_timeout: Duration::from_secs(3600),
            decision_timeout: Duration::from_secs(300),
            decision_default: DecisionDefault::Abort,
        }
    }
}

/// How a finished session went.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub generation_id: String,
    pub status: SessionStatus,
    /// Iterations that reached `iteration_complete`.
    pub iterations: u32,
    pub summary: Option<String>,
    pub error: Option<WorkerError>,
    pub logs: LogStats,
}

enum Ending {
    Complete(String),
    Failed(WorkerError),
    /// `discard` drops the saved snapshot: the session is over for good.
    Aborted { error: WorkerError, discard: bool },
}

impl From<WorkerError> for Ending {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Cancelled(_) | WorkerError::NonRetryable(_) => Ending::Aborted {
                error: err,
                discard: false,
            },
            other => Ending::Failed(other),
        }
    }
}

/// What the gate (or the human) decided after an iteration.
enum Verdict {
    Continue { feedback: Option<String> },
    Complete { feedback: Option<String>, by_user: bool },
    Abort(WorkerError),
}

struct Decision {
    choice: DecisionChoice,
    feedback: Option<String>,
}

pub struct SessionController {
    session: Session,
    settings: SessionSettings,
    generator: Arc<dyn Generator>,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Receiver<LinkEvent>,
    logs: Option<LogSink>,
    log_handle: Option<LogStreamHandle>,
    store: Option<SessionStore>,
    cancel: CancellationToken,
    connected: bool,
    /// Iteration of the decision prompt awaiting an answer, if any.
    outstanding: Option<u32>,
    completed: u32,
}

impl SessionController {
    pub fn new(
        session: Session,
        settings: SessionSettings,
        generator: Arc<dyn Generator>,
        link: ConnectionLink,
        logs: LogSink,
        log_handle: LogStreamHandle,
        cancel: CancellationToken,
    ) -> Self {
        let ConnectionLink {
            outbound, events, ..
        } = link;
        Self {
            session,
            settings,
            generator,
            outbound,
            events,
            logs: Some(logs),
            log_handle: Some(log_handle),
            store: None,
            cancel,
            connected: false,
            outstanding: None,
            completed: 0,
        }
    }

    /// Persists a snapshot after every iteration.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Runs the session to a terminal state and sends its terminal message.
    #[instrument(
        name = "session",
        skip_all,
        fields(generation_id = %self.session.generation_id, mode = %self.session.mode)
    )]
    pub async fn run(mut self) -> SessionReport {
        info!(iteration = self.session.iteration, restored = self.session.restored, "Session starting");
        let ending = self.drive().await;
        self.finish(ending).await
    }

    async fn drive(&mut self) -> Ending {
        if let Err(err) = self.await_link().await {
            return err.into();
        }
        self.session.transition(SessionStatus::Ready);
        if self.session.restored {
            let session_id = self.session.generation_id.clone();
            self.send(Message::SessionLoaded {
                generation_id: session_id.clone(),
                session_id,
            })
            .await;
        }

        loop {
            if self.cancel.is_cancelled() {
                return WorkerError::Cancelled("session cancelled".to_string()).into();
            }
            let iteration = self.session.iteration;
            if iteration >= self.settings.max_iterations {
                info!(iteration, "Iteration budget already spent");
                return self.end_at_budget();
            }
            if let Err(err) = self.await_link().await {
                return err.into();
            }

            self.session.transition(SessionStatus::Iterating);
            self.set_phase(SessionPhase::Generating).await;
            info!(iteration, "Starting iteration");

            let prompt = self.next_prompt().await;
            let outcome = match self.run_generator(&prompt).await {
                Ok(outcome) => outcome,
                Err(err) => return err.into(),
            };
            info!(iteration, success = outcome.success, recommendation = ?outcome.recommendation, "Iteration finished");
            if let Some(handle) = &self.log_handle {
                handle.flush().await;
            }

            let verdict = match decision::decide(
                self.session.mode,
                &outcome,
                iteration,
                self.settings.max_iterations,
            ) {
                GateAction::AutoContinue => Verdict::Continue { feedback: None },
                GateAction::AutoComplete => Verdict::Complete {
                    feedback: None,
                    by_user: false,
                },
                GateAction::AskUser => match self.ask_user(iteration, &outcome).await {
                    Ok(verdict) => verdict,
                    Err(err) => return err.into(),
                },
            };

            self.send(Message::IterationComplete {
                generation_id: self.session.generation_id.clone(),
                iteration,
                outcome: outcome.clone(),
            })
            .await;
            self.completed += 1;

            match verdict {
                Verdict::Continue { feedback } => {
                    self.session.context.record(iteration, outcome, feedback);
                    if decision::budget_exhausted(iteration, self.settings.max_iterations) {
                        info!(iteration, "Continue requested but the iteration budget is spent");
                        return self.end_at_budget();
                    }
                    self.session.iteration += 1;
                    self.save_snapshot().await;
                }
                Verdict::Complete { feedback, by_user } => {
                    let summary = outcome.summary.clone();
                    let success = outcome.success;
                    self.session.context.record(iteration, outcome, feedback);
                    return if success || by_user {
                        Ending::Complete(summary)
                    } else {
                        Ending::Failed(WorkerError::Generator(format!(
                            "final iteration failed: {summary}"
                        )))
                    };
                }
                Verdict::Abort(err) => {
                    self.session.context.record(iteration, outcome, None);
                    return Ending::Aborted {
                        error: err,
                        discard: true,
                    };
                }
            }
        }
    }

    /// Ends a session whose budget is spent, judged by its last outcome.
    fn end_at_budget(&self) -> Ending {
        match self.session.context.last() {
            Some(record) if record.outcome.success => {
                Ending::Complete(record.outcome.summary.clone())
            }
            Some(record) => Ending::Failed(WorkerError::Generator(format!(
                "iteration budget spent; last iteration failed: {}",
                record.outcome.summary
            ))),
            None => Ending::Failed(WorkerError::Generator(
                "iteration budget spent before any iteration ran".to_string(),
            )),
        }
    }

    async fn next_prompt(&self) -> String {
        if self.session.context.history.is_empty() {
            return self.session.prompt.clone();
        }
        match self.generator.next_prompt(&self.session.context).await {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "Generator could not compute the next prompt; using the default");
                self.session.context.compose_prompt()
            }
        }
    }

    /// Runs one generator call, servicing link events while it works.
    async fn run_generator(&mut self, prompt: &str) -> Result<IterationOutcome, WorkerError> {
        let logs = self
            .logs
            .clone()
            .ok_or_else(|| WorkerError::Generator("log sink already closed".to_string()))?;
        let workspace = WorkspaceState {
            path: self.session.workspace_path.clone(),
            generation_id: self.session.generation_id.clone(),
            iteration: self.session.iteration,
        };
        let iteration_cancel = self.cancel.child_token();
        let generator = Arc::clone(&self.generator);
        let run = generator.run_iteration(prompt, &workspace, logs, iteration_cancel.clone());
        tokio::pin!(run);
        let deadline = tokio::time::sleep(self.settings.generation_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut run => {
                    return match result {
                        Ok(outcome) => Ok(outcome),
                        Err(GeneratorError::Failed(reason)) => {
                            warn!(%reason, "Iteration failed");
                            Ok(IterationOutcome::failure(reason))
                        }
                        Err(e) => Err(e.into()),
                    };
                }
                _ = &mut deadline => {
                    iteration_cancel.cancel();
                    warn!(timeout = ?self.settings.generation_timeout, "Generation timed out");
                    // Let the generator run its cancel path so it releases the log sink.
                    if tokio::time::timeout(CANCEL_GRACE, &mut run).await.is_err() {
                        warn!(grace = ?CANCEL_GRACE, "Generator ignored cancellation; dropping it");
                    }
                    return Ok(IterationOutcome::failure(format!(
                        "generation timed out after {:?}",
                        self.settings.generation_timeout
                    )));
                }
                event = self.events.recv() => {
                    self.handle_event(event)?;
                }
            }
        }
    }

    /// Sends a decision prompt and waits for its answer or the timeout.
    async fn ask_user(
        &mut self,
        iteration: u32,
        outcome: &IterationOutcome,
    ) -> Result<Verdict, WorkerError> {
        self.await_link().await?;
        self.session.transition(SessionStatus::AwaitingDecision);
        self.set_phase(SessionPhase::AwaitingDecision).await;
        self.outstanding = Some(iteration);
        self.send(Message::DecisionPrompt {
            generation_id: self.session.generation_id.clone(),
            iteration,
            summary: outcome.summary.clone(),
            options: DecisionChoice::offered(),
        })
        .await;
        info!(iteration, "Awaiting decision");

        // The timer only runs while the server can actually see the prompt.
        let mut remaining = self.settings.decision_timeout;
        let verdict = loop {
            let was_connected = self.connected;
            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(remaining), if was_connected => {
                    break Ok(self.decision_timed_out(iteration));
                }
                event = self.events.recv() => {
                    if was_connected {
                        remaining = remaining.saturating_sub(started.elapsed());
                    }
                    let decision = match self.handle_event(event) {
                        Ok(Some(decision)) => decision,
                        Ok(None) => continue,
                        Err(err) => break Err(err),
                    };
                    match decision.choice {
                        DecisionChoice::Continue => {
                            info!(iteration, "User chose to continue");
                            break Ok(Verdict::Continue { feedback: decision.feedback });
                        }
                        DecisionChoice::Complete => {
                            info!(iteration, "User chose to complete");
                            break Ok(Verdict::Complete { feedback: decision.feedback, by_user: true });
                        }
                        DecisionChoice::Abort => {
                            info!(iteration, "User chose to abort");
                            break Ok(Verdict::Abort(WorkerError::NonRetryable(format!(
                                "aborted by user at iteration {iteration}"
                            ))));
                        }
                        DecisionChoice::Context => {
                            self.send(Message::ContextDisplay {
                                generation_id: self.session.generation_id.clone(),
                                context: self.session.context.render(),
                            })
                            .await;
                        }
                        DecisionChoice::Unknown => {
                            warn!(iteration, "Ignoring decision response with an unknown choice");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    break Err(WorkerError::Cancelled("cancelled while awaiting a decision".to_string()));
                }
            }
        };
        self.outstanding = None;
        verdict
    }

    fn decision_timed_out(&self, iteration: u32) -> Verdict {
        let timeout = self.settings.decision_timeout;
        warn!(
            iteration,
            ?timeout,
            default = %self.settings.decision_default,
            "Decision timed out; applying the default"
        );
        match self.settings.decision_default {
            DecisionDefault::Continue => Verdict::Continue { feedback: None },
            DecisionDefault::Abort => Verdict::Abort(WorkerError::NonRetryable(format!(
                "decision for iteration {iteration} timed out after {timeout:?}"
            ))),
        }
    }

    /// Waits until the connection is up, servicing link events meanwhile.
    async fn await_link(&mut self) -> Result<(), WorkerError> {
        while !self.connected {
            tokio::select! {
                event = self.events.recv() => {
                    self.handle_event(event)?;
                }
                _ = self.cancel.cancelled() => {
                    return Err(WorkerError::Cancelled("cancelled while waiting for the connection".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Applies one link event. Returns a decision when it answers the
    /// outstanding prompt.
    fn handle_event(&mut self, event: Option<LinkEvent>) -> Result<Option<Decision>, WorkerError> {
        let Some(event) = event else {
            return Err(WorkerError::Connection("connection task ended".to_string()));
        };
        match event {
            LinkEvent::Up { resumed } => {
                self.connected = true;
                if resumed {
                    info!(iteration = self.session.iteration, "Connection restored; session resumes");
                }
            }
            LinkEvent::Down(err) => {
                self.connected = false;
                warn!(error = %err, iteration = self.session.iteration, "Connection lost; session suspended");
            }
            LinkEvent::Failed(err) => return Err(err),
            LinkEvent::Closed => {
                self.connected = false;
                if self.cancel.is_cancelled() {
                    return Err(WorkerError::Cancelled("connection closed on cancellation".to_string()));
                }
                return Err(WorkerError::Connection("connection closed unexpectedly".to_string()));
            }
            LinkEvent::Inbound(message) => return self.handle_inbound(message),
        }
        Ok(None)
    }

    fn handle_inbound(&mut self, message: Message) -> Result<Option<Decision>, WorkerError> {
        let kind = message.type_name();
        match message {
            Message::DecisionResponse {
                iteration,
                choice,
                feedback,
                ..
            } => {
                if self.outstanding == Some(iteration) {
                    return Ok(Some(Decision { choice, feedback }));
                }
                warn!(
                    iteration,
                    outstanding = ?self.outstanding,
                    ?choice,
                    "Ignoring decision response that matches no outstanding prompt"
                );
            }
            Message::Error { kind, message, .. } => {
                let err = WorkerError::from_remote(kind, message);
                if matches!(err, WorkerError::NonRetryable(_)) {
                    error!(error = %err, "Server reported a non-retryable error");
                    return Err(err);
                }
                warn!(error = %err, "Server reported an error");
            }
            Message::SessionLoaded { session_id, .. }
            | Message::SessionSaved { session_id, .. }
            | Message::SessionCleared { session_id, .. } => {
                info!(kind, %session_id, "Server session event");
            }
            Message::Ready { .. } => debug!("Ignoring extra `ready`"),
            _ => warn!(kind, "Ignoring unexpected server message"),
        }
        Ok(None)
    }

    async fn set_phase(&self, phase: SessionPhase) {
        let item = Outbound::Phase {
            phase,
            iteration: self.session.iteration,
        };
        if self.outbound.send(item).await.is_err() {
            debug!(?phase, "Connection queue closed; phase not recorded");
        }
    }

    async fn send(&self, message: Message) -> bool {
        let kind = message.type_name();
        match self.outbound.send(Outbound::Frame(message)).await {
            Ok(()) => true,
            Err(_) => {
                warn!(kind, "Connection queue closed; dropping message");
                false
            }
        }
    }

    /// The session as it stands at the start of its current iteration.
    fn snapshot(&self, next_log_sequence: u64) -> SessionSnapshot {
        let mut context = self.session.context.clone();
        context
            .history
            .retain(|record| record.iteration < self.session.iteration);
        SessionSnapshot {
            generation_id: self.session.generation_id.clone(),
            mode: self.session.mode,
            prompt: self.session.prompt.clone(),
            iteration: self.session.iteration,
            next_log_sequence,
            context,
            saved_at: Utc::now(),
        }
    }

    async fn save_snapshot(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let next_log_sequence = self
            .log_handle
            .as_ref()
            .map(LogStreamHandle::next_sequence)
            .unwrap_or_default();
        match store.save(&self.snapshot(next_log_sequence)) {
            Ok(()) => {
                let session_id = self.session.generation_id.clone();
                self.send(Message::SessionSaved {
                    generation_id: session_id.clone(),
                    session_id,
                })
                .await;
            }
            Err(e) => warn!(error = %e, "Failed to save session snapshot"),
        }
    }

    /// Records where log sequencing stopped so a resumed session never
    /// reuses a number the server has already seen.
    fn keep_snapshot(&self, next_log_sequence: u64) {
        let Some(store) = &self.store else {
            return;
        };
        match store.save(&self.snapshot(next_log_sequence)) {
            Ok(()) => debug!(
                iteration = self.session.iteration,
                next_log_sequence,
                "Kept session snapshot for resumption"
            ),
            Err(e) => warn!(error = %e, "Failed to keep session snapshot"),
        }
    }

    async fn finish(mut self, ending: Ending) -> SessionReport {
        let generation_id = self.session.generation_id.clone();
        let (status, terminal, summary, error, clear) = match ending {
            Ending::Complete(summary) => (
                SessionStatus::Complete,
                Message::AllWorkComplete {
                    generation_id: generation_id.clone(),
                    summary: summary.clone(),
                },
                Some(summary),
                None,
                true,
            ),
            Ending::Failed(err) => (
                SessionStatus::Failed,
                error_frame(&generation_id, &err),
                None,
                Some(err),
                false,
            ),
            Ending::Aborted { error, discard } => (
                SessionStatus::Aborted,
                error_frame(&generation_id, &error),
                None,
                Some(error),
                discard,
            ),
        };
        self.session.transition(status);
        match &error {
            Some(err) => warn!(status = %status, error = %err, "Session ended"),
            None => info!(status = %status, iterations = self.completed, "Session ended"),
        }

        // Closing the sink lets the drain hand over the last log lines.
        self.logs = None;
        let logs = match self.log_handle.take() {
            Some(handle) => handle.finish().await,
            None => LogStats::default(),
        };

        if !clear {
            self.keep_snapshot(logs.next_sequence);
        } else if let Some(store) = &self.store {
            match store.clear() {
                Ok(true) => {
                    self.send(Message::SessionCleared {
                        generation_id: generation_id.clone(),
                        session_id: generation_id.clone(),
                    })
                    .await;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to clear session snapshot"),
            }
        }

        if !self.send(terminal).await {
            error!(status = %status, "Terminal message could not be delivered: connection is gone");
        }
        if self.outbound.send(Outbound::Close).await.is_err() {
            debug!("Connection already closed");
        }

        SessionReport {
            generation_id,
            status,
            iterations: self.completed,
            summary,
            error,
            logs,
        }
    }
}

fn error_frame(generation_id: &str, err: &WorkerError) -> Message {
    Message::Error {
        generation_id: generation_id.to_string(),
        kind: err.kind(),
        message: err.to_string(),
    }
}
