//! Log lines produced by a generator while an iteration runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStreamKind::Stdout => write!(f, "stdout"),
            LogStreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// A single captured line, not yet sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub stream: LogStreamKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(stream: LogStreamKind, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(LogStreamKind::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(LogStreamKind::Stderr, text)
    }
}

/// Producer handle for generator output.
///
/// Backed by a bounded channel with a single consumer (the worker's log
/// streamer). Cloning the sink is cheap; the consumer sees end-of-stream once
/// every clone has been dropped.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogLine>,
}

impl LogSink {
    /// Creates a sink and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogLine>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Forwards a line. Returns `false` when the consumer has gone away.
    pub async fn emit(&self, line: LogLine) -> bool {
        self.tx.send(line).await.is_ok()
    }

    pub async fn stdout(&self, text: impl Into<String>) -> bool {
        self.emit(LogLine::stdout(text)).await
    }

    pub async fn stderr(&self, text: impl Into<String>) -> bool {
        self.emit(LogLine::stderr(text)).await
    }
}
