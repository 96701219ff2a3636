//! Generator boundary for the generation worker.
//!
//! The worker never builds prompts or writes code itself. It drives an
//! implementation of [`Generator`] one iteration at a time and forwards the
//! log lines the generator emits. This crate holds that contract plus two
//! implementations: a shell-command runner for deployments and a scripted
//! generator for tests and dry runs.

pub mod command;
pub mod generator;
pub mod log_line;
pub mod scripted;

pub use generator::{
    Generator, GeneratorError, IterationOutcome, IterationRecord, PriorContext, Recommendation,
    WorkspaceState,
};
pub use log_line::{LogLine, LogSink, LogStreamKind};
