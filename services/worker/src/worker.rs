//! Wires one session together: snapshot lookup, the connection task, the log
//! drain and the session controller.

use crate::config::Config;
use crate::store::SessionStore;
use crate::ws::connection::{ConnectionManager, Handshake};
use crate::ws::logs::LogStreamer;
use crate::ws::session::{Session, SessionController, SessionReport};
use genloop_core::{Generator, LogSink};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Runs a single generation session to completion.
pub async fn run_worker(
    config: &Config,
    generator: Arc<dyn Generator>,
    cancel: CancellationToken,
) -> SessionReport {
    let store = SessionStore::for_workspace(&config.workspace_path);
    let (session, first_sequence) = open_session(config, &store);
    info!(
        generation_id = session.generation_id(),
        mode = %session.mode(),
        iteration = session.iteration(),
        "Opening session"
    );

    let handshake = Handshake {
        generation_id: session.generation_id().to_string(),
        mode: session.mode(),
        prompt: session.prompt().to_string(),
        workspace_path: session.workspace_path().display().to_string(),
        iteration: session.restored().then_some(session.iteration()),
    };
    let (manager, link) = ConnectionManager::new(config.connection.clone(), handshake, cancel.clone());

    let (sink, lines) = LogSink::channel(config.log_buffer);
    let log_handle = LogStreamer::new(session.generation_id(), config.log_buffer, first_sequence).spawn(
        lines,
        link.outbound.clone(),
        link.state.clone(),
    );

    let connection = tokio::spawn(manager.run());

    let controller = SessionController::new(
        session,
        config.session.clone(),
        generator,
        link,
        sink,
        log_handle,
        cancel,
    )
    .with_store(store);
    let report = controller.run().await;

    // The manager drains what is queued, sends a close frame and exits.
    let grace = config.connection.send_timeout.saturating_mul(2) + Duration::from_secs(1);
    match tokio::time::timeout(grace, connection).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Connection task failed"),
        Err(_) => warn!("Connection task did not finish in time"),
    }
    report
}

/// Resumes a saved session for this workspace, or starts a fresh one.
fn open_session(config: &Config, store: &SessionStore) -> (Session, u64) {
    match store.load() {
        Ok(Some(snapshot))
            if config
                .generation_id
                .as_deref()
                .is_none_or(|id| id == snapshot.generation_id) =>
        {
            if snapshot.mode != config.mode {
                warn!(
                    saved = %snapshot.mode,
                    configured = %config.mode,
                    "Keeping the saved session's mode"
                );
            }
            info!(
                generation_id = %snapshot.generation_id,
                iteration = snapshot.iteration,
                "Resuming saved session"
            );
            let first_sequence = snapshot.next_log_sequence.max(1);
            (
                Session::from_snapshot(snapshot, config.workspace_path.clone()),
                first_sequence,
            )
        }
        Ok(Some(snapshot)) => {
            warn!(
                saved = %snapshot.generation_id,
                "Ignoring snapshot that belongs to another generation"
            );
            (fresh_session(config), 1)
        }
        Ok(None) => (fresh_session(config), 1),
        Err(e) => {
            warn!(error = %e, "Could not read session snapshot; starting fresh");
            (fresh_session(config), 1)
        }
    }
}

fn fresh_session(config: &Config) -> Session {
    let generation_id = config
        .generation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    Session::new(
        generation_id,
        config.workspace_path.clone(),
        config.mode,
        config.prompt.clone(),
    )
}
