//! Genloop Worker Library Crate
//!
//! This library contains the session protocol that connects a generation
//! worker to its orchestration server: configuration, the error taxonomy,
//! session persistence and the WebSocket session logic. The `worker` binary
//! is a thin wrapper around [`worker::run_worker`].

pub mod config;
pub mod error;
pub mod store;
pub mod worker;
pub mod ws;
