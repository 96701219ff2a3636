//! A [`Generator`] that shells out to an external command per iteration.
//!
//! The command runs inside the workspace with the prompt and iteration exposed
//! as environment variables. Its stdout and stderr are forwarded line by line.
//! A line of the form `GENLOOP_RECOMMENDATION: continue|complete` on stdout
//! sets the outcome's recommendation and is not forwarded.
//!
//! The command runs in its own process group. Anything it leaves behind is
//! killed when the iteration ends, so no stray process holds the log pipes.

use crate::generator::{Generator, GeneratorError, IterationOutcome, Recommendation, WorkspaceState};
use crate::log_line::{LogLine, LogSink, LogStreamKind};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECOMMENDATION_MARKER: &str = "GENLOOP_RECOMMENDATION:";
/// How long output may stay open after the command itself has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

pub struct CommandGenerator {
    shell: String,
    command: String,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            shell: "sh".to_string(),
            command: command.into(),
        }
    }

    /// Runs the command through `shell -c` instead of `sh -c`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

fn parse_marker(line: &str) -> Option<Recommendation> {
    let value = line.trim().strip_prefix(RECOMMENDATION_MARKER)?.trim();
    match value.to_lowercase().as_str() {
        "continue" => Some(Recommendation::Continue),
        "complete" => Some(Recommendation::Complete),
        _ => None,
    }
}

#[derive(Default)]
struct StreamSummary {
    last_line: Option<String>,
    recommendation: Option<Recommendation>,
}

async fn forward_lines<R>(reader: R, stream: LogStreamKind, logs: LogSink, summary: &mut StreamSummary)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stream == LogStreamKind::Stdout {
                    if let Some(recommendation) = parse_marker(&line) {
                        summary.recommendation = Some(recommendation);
                        continue;
                    }
                }
                if !line.trim().is_empty() {
                    summary.last_line = Some(line.clone());
                }
                if !logs.emit(LogLine::new(stream, line)).await {
                    debug!(%stream, "Log consumer gone; discarding further output.");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%stream, error = %e, "Failed to read generator output");
                break;
            }
        }
    }
}

/// Kills every process left in the command's process group when dropped.
///
/// Covers grandchildren that would otherwise keep the output pipes open after
/// the iteration ends, is cancelled, or its future is dropped.
struct ProcessGroup(Option<u32>);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.0 {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn isolate(command: &mut Command) {
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) only sends a signal; an already empty group yields ESRCH.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

#[async_trait]
impl Generator for CommandGenerator {
    async fn run_iteration(
        &self,
        prompt: &str,
        workspace: &WorkspaceState,
        logs: LogSink,
        cancel: CancellationToken,
    ) -> Result<IterationOutcome, GeneratorError> {
        if !workspace.path.is_dir() {
            return Err(GeneratorError::Fatal(format!(
                "workspace {} is not a directory",
                workspace.path.display()
            )));
        }

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&workspace.path)
            .env("GENLOOP_PROMPT", prompt)
            .env("GENLOOP_ITERATION", workspace.iteration.to_string())
            .env("GENLOOP_GENERATION_ID", &workspace.generation_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate(&mut command);
        let mut child = command
            .spawn()
            .map_err(|e| GeneratorError::Fatal(format!("failed to spawn generator: {e}")))?;
        let _group = ProcessGroup(child.id());
        info!(iteration = workspace.iteration, command = %self.command, "Generator command started");

        // The readers live inside this future, so dropping it releases the log sink.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_summary = StreamSummary::default();
        let mut err_summary = StreamSummary::default();
        let mut output = Box::pin(async {
            let stdout_logs = logs.clone();
            tokio::join!(
                async {
                    if let Some(pipe) = stdout {
                        forward_lines(pipe, LogStreamKind::Stdout, stdout_logs, &mut out_summary).await;
                    }
                },
                async {
                    if let Some(pipe) = stderr {
                        forward_lines(pipe, LogStreamKind::Stderr, logs, &mut err_summary).await;
                    }
                },
            );
        });

        let mut status = None;
        let mut drained = false;
        let mut drain_deadline = Instant::now();
        while status.is_none() || !drained {
            tokio::select! {
                exited = child.wait(), if status.is_none() => {
                    let exited = exited
                        .map_err(|e| GeneratorError::Failed(format!("failed to wait for generator: {e}")))?;
                    drain_deadline = Instant::now() + OUTPUT_GRACE;
                    status = Some(exited);
                }
                _ = &mut output, if !drained => drained = true,
                _ = tokio::time::sleep_until(drain_deadline), if status.is_some() && !drained => {
                    warn!("Generator output still open after exit; stopping leftover processes");
                    break;
                }
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill cancelled generator command");
                    }
                    return Err(GeneratorError::Cancelled);
                }
            }
        }
        drop(output);
        let Some(status) = status else {
            return Err(GeneratorError::Failed("generator exited without a status".to_string()));
        };

        let mut outcome = if status.success() {
            IterationOutcome::success(
                out_summary
                    .last_line
                    .unwrap_or_else(|| "generator command succeeded".to_string()),
            )
        } else {
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            IterationOutcome::failure(format!("generator command exited with {code}"))
        };
        outcome.recommendation = out_summary.recommendation;
        debug!(stderr_last = ?err_summary.last_line, "Generator command finished");
        Ok(outcome)
    }
}
