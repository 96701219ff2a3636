//! Main Entrypoint for the Genloop Worker
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command-line overrides.
//! 2. Initializing logging.
//! 3. Building the generator that runs each iteration.
//! 4. Running one session against the orchestration server until it ends.

use anyhow::Context;
use clap::Parser;
use genloop_core::command::CommandGenerator;
use genloop_worker::{
    config::Config,
    worker::run_worker,
    ws::{SessionStatus, protocol::Mode},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Genloop worker: runs one application-generation session.
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Load environment variables from this file before reading configuration
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Interaction mode (overrides GENLOOP_MODE)
    #[arg(long)]
    mode: Option<Mode>,

    /// Generation id (overrides GENLOOP_GENERATION_ID)
    #[arg(long)]
    generation_id: Option<String>,
}

/// Cancels the session on the first `Ctrl+C`.
async fn shutdown_signal(cancel: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Cancelling the session...");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    if let Some(path) = &args.env_file {
        dotenvy::from_path(path)
            .with_context(|| format!("Failed to load env file {}", path.display()))?;
    }
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(id) = args.generation_id {
        config
            .set_generation_id(id)
            .context("Invalid --generation-id")?;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Preparing the generator...");

    // --- 3. Build the Generator ---
    let command = config
        .generator_command
        .clone()
        .context("GENLOOP_GENERATOR_COMMAND must be set")?;
    let generator = Arc::new(CommandGenerator::new(command));

    // --- 4. Run the Session ---
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    info!(
        url = %config.connection.url,
        mode = %config.mode,
        workspace = %config.workspace_path.display(),
        "Worker configured. Connecting..."
    );
    let report = run_worker(&config, generator, cancel).await;

    match report.status {
        SessionStatus::Complete => {
            info!(
                generation_id = %report.generation_id,
                iterations = report.iterations,
                "Generation complete."
            );
            Ok(ExitCode::SUCCESS)
        }
        status => {
            error!(
                generation_id = %report.generation_id,
                %status,
                error = ?report.error,
                "Generation did not complete."
            );
            Ok(ExitCode::FAILURE)
        }
    }
}
