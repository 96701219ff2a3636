//! WebSocket Session Protocol
//!
//! Everything that keeps a generation session alive over an unreliable
//! connection, split into:
//!
//! - `protocol`: the JSON frames exchanged with the orchestration server.
//! - `backoff`: reconnect delay policy.
//! - `connection`: the single socket owner, its state machine and reconnection.
//! - `decision`: mode-dependent gating between iterations.
//! - `logs`: sequenced, loss-reporting log delivery.
//! - `session`: the per-session iteration loop.

pub mod backoff;
pub mod connection;
pub mod decision;
pub mod logs;
pub mod protocol;
pub mod session;

pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, Handshake};
pub use session::{SessionController, SessionReport, SessionSettings, SessionStatus};
