//! Defines the WebSocket message protocol between the worker and the orchestration server.
//!
//! Every frame is a JSON object carrying a `type` discriminator and the
//! `generation_id` it belongs to. Decoding ignores fields it does not know so
//! newer servers can add them freely, but fails when a field required by the
//! frame's `type` is missing or has the wrong shape. Frames whose `type` is
//! unknown decode to [`Frame::Unrecognized`] so the receive loop can skip them.

use chrono::{DateTime, Utc};
use genloop_core::{IterationOutcome, LogStreamKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Protocol version spoken by this worker.
pub const PROTOCOL_VERSION: u32 = 1;

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Human-in-the-loop interaction mode, fixed for the lifetime of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Autonomous,
    ConfirmFirst,
    Interactive,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Autonomous => write!(f, "autonomous"),
            Mode::ConfirmFirst => write!(f, "confirm_first"),
            Mode::Interactive => write!(f, "interactive"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "autonomous" => Ok(Mode::Autonomous),
            "confirm_first" | "confirm-first" => Ok(Mode::ConfirmFirst),
            "interactive" => Ok(Mode::Interactive),
            other => Err(format!(
                "'{other}' is not one of autonomous, confirm_first, interactive"
            )),
        }
    }
}

/// A choice offered in, or returned for, a decision prompt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionChoice {
    Continue,
    Complete,
    Abort,
    /// Introspection request; answered with `context_display`.
    #[serde(rename = "/context")]
    Context,
    #[serde(other)]
    Unknown,
}

impl DecisionChoice {
    /// Choices offered with every decision prompt.
    pub fn offered() -> Vec<DecisionChoice> {
        vec![
            DecisionChoice::Continue,
            DecisionChoice::Complete,
            DecisionChoice::Abort,
        ]
    }
}

/// Classification carried by `error` frames.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionError,
    RetryableError,
    NonRetryableError,
    TimeoutError,
    GeneratorError,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// Messages exchanged over the session connection, in both directions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Begins a session, or resumes one when `generation_id` is already known
    /// to the server. Sent first on every (re)connection.
    StartGeneration {
        generation_id: String,
        mode: Mode,
        prompt: String,
        workspace_path: String,
        #[serde(default = "default_protocol_version")]
        protocol_version: u32,
        /// The iteration the worker is on when resuming.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    /// Handshake acknowledgement from the server.
    Ready {
        generation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },
    /// Asks the remote human to decide how to proceed.
    DecisionPrompt {
        generation_id: String,
        iteration: u32,
        summary: String,
        options: Vec<DecisionChoice>,
    },
    /// The human's answer to the outstanding prompt.
    DecisionResponse {
        generation_id: String,
        iteration: u32,
        choice: DecisionChoice,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    /// One sequenced generator log line.
    Log {
        generation_id: String,
        sequence: u64,
        text: String,
        stream: LogStreamKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        /// Lines lost before this one since the previous delivery.
        #[serde(
            rename = "droppedCount",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        dropped_count: Option<u64>,
    },
    /// End of one generate-and-evaluate cycle.
    IterationComplete {
        generation_id: String,
        iteration: u32,
        outcome: IterationOutcome,
    },
    /// Terminal success.
    AllWorkComplete {
        generation_id: String,
        summary: String,
    },
    /// Fatal or reportable failure.
    Error {
        generation_id: String,
        kind: ErrorKind,
        message: String,
    },
    SessionLoaded {
        generation_id: String,
        session_id: String,
    },
    SessionSaved {
        generation_id: String,
        session_id: String,
    },
    SessionCleared {
        generation_id: String,
        session_id: String,
    },
    /// Result of a `/context` introspection request.
    ContextDisplay {
        generation_id: String,
        context: String,
    },
}

/// Every `type` value this worker understands.
pub const KNOWN_TYPES: &[&str] = &[
    "start_generation",
    "ready",
    "decision_prompt",
    "decision_response",
    "log",
    "iteration_complete",
    "all_work_complete",
    "error",
    "session_loaded",
    "session_saved",
    "session_cleared",
    "context_display",
];

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::StartGeneration { .. } => "start_generation",
            Message::Ready { .. } => "ready",
            Message::DecisionPrompt { .. } => "decision_prompt",
            Message::DecisionResponse { .. } => "decision_response",
            Message::Log { .. } => "log",
            Message::IterationComplete { .. } => "iteration_complete",
            Message::AllWorkComplete { .. } => "all_work_complete",
            Message::Error { .. } => "error",
            Message::SessionLoaded { .. } => "session_loaded",
            Message::SessionSaved { .. } => "session_saved",
            Message::SessionCleared { .. } => "session_cleared",
            Message::ContextDisplay { .. } => "context_display",
        }
    }

    pub fn generation_id(&self) -> &str {
        match self {
            Message::StartGeneration { generation_id, .. }
            | Message::Ready { generation_id, .. }
            | Message::DecisionPrompt { generation_id, .. }
            | Message::DecisionResponse { generation_id, .. }
            | Message::Log { generation_id, .. }
            | Message::IterationComplete { generation_id, .. }
            | Message::AllWorkComplete { generation_id, .. }
            | Message::Error { generation_id, .. }
            | Message::SessionLoaded { generation_id, .. }
            | Message::SessionSaved { generation_id, .. }
            | Message::SessionCleared { generation_id, .. }
            | Message::ContextDisplay { generation_id, .. } => generation_id,
        }
    }

    /// Whether this message ends a session from the worker's side.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::AllWorkComplete { .. } | Message::Error { .. })
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Known(Message),
    /// A frame whose `type` this worker does not know.
    Unrecognized {
        kind: String,
        generation_id: Option<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame is not a JSON object: {0}")]
    Malformed(String),
    #[error("Frame has no string `type` field")]
    MissingType,
    #[error("Invalid `{kind}` frame: {reason}")]
    InvalidFields { kind: String, reason: String },
    #[error("Failed to encode `{kind}` frame: {reason}")]
    Encode { kind: &'static str, reason: String },
}

/// Serializes a message into a JSON text frame.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Encode {
        kind: message.type_name(),
        reason: e.to_string(),
    })
}

/// Parses an inbound frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| CodecError::Malformed("expected a JSON object".to_string()))?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_string();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        let generation_id = object
            .get("generation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(Frame::Unrecognized {
            kind,
            generation_id,
        });
    }

    serde_json::from_value::<Message>(value)
        .map(Frame::Known)
        .map_err(|e| CodecError::InvalidFields {
            kind,
            reason: e.to_string(),
        })
}
