//! End-to-end session tests against an in-process WebSocket server.

use futures_util::{SinkExt, StreamExt};
use genloop_core::command::CommandGenerator;
use genloop_core::generator::IterationOutcome;
use genloop_core::{Generator, Recommendation};
use genloop_core::scripted::{ScriptedGenerator, ScriptedStep};
use genloop_worker::config::Config;
use genloop_worker::error::WorkerError;
use genloop_worker::store::{SessionSnapshot, SessionStore};
use genloop_worker::worker::run_worker;
use genloop_worker::ws::backoff::BackoffPolicy;
use genloop_worker::ws::protocol::Mode;
use genloop_worker::ws::{SessionReport, SessionStatus};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;

type ServerSocket = WebSocketStream<TcpStream>;

const GENERATION_ID: &str = "gen-it";

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("worker never connected")
        .unwrap();
    accept_async(stream).await.unwrap()
}

/// Next JSON frame from the worker, or `None` once the socket closes.
async fn recv(ws: &mut ServerSocket) -> Option<Value> {
    loop {
        let next = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match next {
            Some(Ok(WsMessage::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn send(ws: &mut ServerSocket, value: Value) {
    ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
}

/// Reads `start_generation`, answers `ready`, and returns the handshake.
async fn handshake(ws: &mut ServerSocket) -> Value {
    let start = recv(ws).await.expect("socket closed before start_generation");
    assert_eq!(start["type"], "start_generation");
    send(
        ws,
        json!({"type": "ready", "generation_id": start["generation_id"], "protocol_version": 1}),
    )
    .await;
    start
}

/// Collects frames up to and including the terminal one.
async fn until_terminal(ws: &mut ServerSocket) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Some(frame) = recv(ws).await {
        let terminal = frame["type"] == "all_work_complete" || frame["type"] == "error";
        frames.push(frame);
        if terminal {
            break;
        }
    }
    frames
}

fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|f| f["type"].as_str()).collect()
}

fn config(url: &str, workspace: &TempDir, mode: Mode) -> Config {
    let mut config = Config::new(url, "Build a blog");
    config.set_generation_id(GENERATION_ID).unwrap();
    config.mode = mode;
    config.workspace_path = workspace.path().to_path_buf();
    config.connection.connect_timeout = Duration::from_secs(2);
    config.connection.send_timeout = Duration::from_secs(2);
    config.connection.backoff = BackoffPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        max_jitter: Duration::ZERO,
        max_retries: 5,
    };
    config.session.decision_timeout = Duration::from_secs(5);
    config
}

fn spawn_worker(config: Config, generator: Arc<ScriptedGenerator>) -> JoinHandle<SessionReport> {
    spawn_worker_with(config, generator, CancellationToken::new())
}

fn spawn_worker_with(
    config: Config,
    generator: Arc<dyn Generator>,
    cancel: CancellationToken,
) -> JoinHandle<SessionReport> {
    tokio::spawn(async move { run_worker(&config, generator, cancel).await })
}

fn log_sequences(frames: &[Value]) -> Vec<u64> {
    frames
        .iter()
        .filter(|f| f["type"] == "log")
        .filter_map(|f| f["sequence"].as_u64())
        .collect()
}

#[tokio::test]
async fn test_autonomous_happy_path() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new([ScriptedStep::outcome(
        IterationOutcome::success("blog scaffolded").with_recommendation(Recommendation::Complete),
    )
    .with_logs(["creating project", "installing deps"])]));
    let worker = spawn_worker(config(&url, &workspace, Mode::Autonomous), generator);

    let mut ws = accept(&listener).await;
    let start = handshake(&mut ws).await;
    assert_eq!(start["generation_id"], GENERATION_ID);
    assert_eq!(start["mode"], "autonomous");
    assert_eq!(start["prompt"], "Build a blog");
    assert_eq!(start["protocol_version"], 1);
    assert!(start.get("iteration").is_none());

    let frames = until_terminal(&mut ws).await;
    assert_eq!(
        types(&frames),
        vec!["log", "log", "iteration_complete", "all_work_complete"]
    );
    assert_eq!(frames[0]["sequence"], 1);
    assert_eq!(frames[0]["text"], "creating project");
    assert_eq!(frames[1]["sequence"], 2);
    assert_eq!(frames[2]["iteration"], 0);
    assert_eq!(frames[2]["outcome"]["success"], true);
    assert_eq!(frames[3]["summary"], "blog scaffolded");
    assert!(frames.iter().all(|f| f["generation_id"] == GENERATION_ID));
    assert!(recv(&mut ws).await.is_none());

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Complete);
    assert_eq!(report.iterations, 1);
}

#[tokio::test]
async fn test_interactive_decisions_gate_every_iteration() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new([
        ScriptedStep::outcome(IterationOutcome::success("draft")),
        ScriptedStep::outcome(IterationOutcome::success("final")),
    ]));
    let worker = spawn_worker(config(&url, &workspace, Mode::Interactive), generator.clone());

    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;

    let mut frames = Vec::new();
    let mut responses = 0;
    while let Some(frame) = recv(&mut ws).await {
        if frame["type"] == "decision_prompt" {
            let iteration = frame["iteration"].as_u64().unwrap();
            let choice = if iteration == 0 { "continue" } else { "complete" };
            send(
                &mut ws,
                json!({
                    "type": "decision_response",
                    "generation_id": GENERATION_ID,
                    "iteration": iteration,
                    "choice": choice,
                    "feedback": "add comments",
                }),
            )
            .await;
            responses += 1;
        }
        if frame["type"] == "iteration_complete" {
            assert_eq!(responses, frame["iteration"].as_u64().unwrap() + 1);
        }
        let terminal = frame["type"] == "all_work_complete" || frame["type"] == "error";
        frames.push(frame);
        if terminal {
            break;
        }
    }

    assert_eq!(
        types(&frames),
        vec![
            "decision_prompt",
            "iteration_complete",
            "session_saved",
            "decision_prompt",
            "iteration_complete",
            "session_cleared",
            "all_work_complete",
        ]
    );
    assert_eq!(frames[0]["options"], json!(["continue", "complete", "abort"]));
    assert_eq!(frames[2]["session_id"], GENERATION_ID);

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Complete);
    assert!(generator.prompts()[1].contains("feedback: add comments"));
    assert!(!SessionStore::for_workspace(workspace.path()).path().exists());
}

#[tokio::test]
async fn test_decision_timeout_aborts_with_non_retryable_error() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new([ScriptedStep::outcome(
        IterationOutcome::success("draft"),
    )]));
    let mut config = config(&url, &workspace, Mode::ConfirmFirst);
    config.session.decision_timeout = Duration::from_millis(150);
    let worker = spawn_worker(config, generator.clone());

    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;
    let frames = until_terminal(&mut ws).await;

    assert_eq!(
        types(&frames),
        vec!["decision_prompt", "iteration_complete", "error"]
    );
    let error = &frames[2];
    assert_eq!(error["kind"], "NonRetryableError");
    assert!(error["message"].as_str().unwrap().contains("timed out"));

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Aborted);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_reconnect_resumes_same_generation_and_iteration() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new([ScriptedStep::outcome(
        IterationOutcome::success("built").with_recommendation(Recommendation::Complete),
    )
    .with_logs(["compiling"])
    .taking(Duration::from_millis(500))]));
    let worker = spawn_worker(config(&url, &workspace, Mode::Autonomous), generator.clone());

    // First connection drops while the generator is still running.
    let mut ws = accept(&listener).await;
    let first = handshake(&mut ws).await;
    let log = recv(&mut ws).await.unwrap();
    assert_eq!(log["type"], "log");
    assert_eq!(log["sequence"], 1);
    drop(ws);

    let mut ws = accept(&listener).await;
    let second = handshake(&mut ws).await;
    assert_eq!(second["generation_id"], first["generation_id"]);
    assert_eq!(second["iteration"], 0);

    let frames = until_terminal(&mut ws).await;
    assert_eq!(types(&frames), vec!["iteration_complete", "all_work_complete"]);
    assert_eq!(frames[0]["iteration"], 0);

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Complete);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_session() {
    let (listener, url) = listen().await;
    drop(listener);
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::default());

    let report = timeout(
        Duration::from_secs(10),
        spawn_worker(config(&url, &workspace, Mode::Autonomous), generator.clone()),
    )
    .await
    .expect("worker should give up")
    .unwrap();

    assert_eq!(report.status, SessionStatus::Failed);
    match report.error {
        Some(WorkerError::Connection(message)) => assert!(message.contains("giving up after 5")),
        other => panic!("expected a connection error, got {:?}", other),
    }
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retried() {
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http::StatusCode;

    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let mut config = config(&url, &workspace, Mode::Autonomous);
    config.connection.auth_token = Some("s3cret".to_string());
    let worker = spawn_worker(config, Arc::new(ScriptedGenerator::default()));

    let (stream, _) = listener.accept().await.unwrap();
    let upgrade = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, _: Response| {
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer s3cret"
        );
        let mut response = ErrorResponse::new(Some("bad token".to_string()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        Err(response)
    })
    .await;
    assert!(upgrade.is_err());

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Aborted);
    assert!(matches!(report.error, Some(WorkerError::NonRetryable(_))));
    assert!(
        timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_saved_session_is_resumed_from_its_iteration() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let mut context = genloop_core::PriorContext::new("Build a blog");
    context.record(0, IterationOutcome::success("scaffolded"), None);
    context.record(1, IterationOutcome::success("styled"), None);
    SessionStore::for_workspace(workspace.path())
        .save(&SessionSnapshot {
            generation_id: GENERATION_ID.to_string(),
            mode: Mode::Autonomous,
            prompt: "Build a blog".to_string(),
            iteration: 2,
            next_log_sequence: 40,
            context,
            saved_at: chrono::Utc::now(),
        })
        .unwrap();
    let generator = Arc::new(ScriptedGenerator::new([ScriptedStep::outcome(
        IterationOutcome::success("deployed").with_recommendation(Recommendation::Complete),
    )
    .with_logs(["deploying"])]));
    let worker = spawn_worker(config(&url, &workspace, Mode::Interactive), generator.clone());

    let mut ws = accept(&listener).await;
    let start = handshake(&mut ws).await;
    assert_eq!(start["iteration"], 2);
    assert_eq!(start["mode"], "autonomous");

    let frames = until_terminal(&mut ws).await;
    assert_eq!(
        types(&frames),
        vec!["session_loaded", "log", "iteration_complete", "session_cleared", "all_work_complete"]
    );
    assert_eq!(frames[1]["sequence"], 40);
    assert_eq!(frames[2]["iteration"], 2);

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Complete);
    assert!(generator.prompts()[0].contains("styled"));
}

#[tokio::test]
async fn test_cancel_during_reconnect_backoff_still_sends_terminal_error() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new([ScriptedStep::outcome(
        IterationOutcome::success("slow"),
    )
    .with_logs(["working"])
    .taking(Duration::from_secs(30))]));
    let mut config = config(&url, &workspace, Mode::Autonomous);
    config.connection.backoff = BackoffPolicy {
        base_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(10),
        max_jitter: Duration::ZERO,
        max_retries: 5,
    };
    let cancel = CancellationToken::new();
    let worker = spawn_worker_with(config, generator, cancel.clone());

    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;
    assert_eq!(recv(&mut ws).await.unwrap()["type"], "log");
    drop(ws);

    // The worker is now sleeping out a five second backoff.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let mut ws = accept(&listener).await;
    let start = handshake(&mut ws).await;
    assert_eq!(start["iteration"], 0);
    let frames = until_terminal(&mut ws).await;
    assert_eq!(types(&frames), vec!["error"]);
    assert_eq!(frames[0]["kind"], "Cancelled");
    assert!(recv(&mut ws).await.is_none());

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Aborted);
}

#[tokio::test]
async fn test_resumed_session_never_reuses_log_sequences() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();

    let first_run = Arc::new(ScriptedGenerator::new([
        ScriptedStep::outcome(
            IterationOutcome::success("scaffolded").with_recommendation(Recommendation::Continue),
        )
        .with_logs(["a", "b"]),
        ScriptedStep::outcome(IterationOutcome::success("slow"))
            .with_logs(["c", "d"])
            .taking(Duration::from_secs(30)),
    ]));
    let cancel = CancellationToken::new();
    let worker = spawn_worker_with(
        config(&url, &workspace, Mode::Autonomous),
        first_run,
        cancel.clone(),
    );

    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;
    let mut frames = Vec::new();
    while !log_sequences(&frames).contains(&4) {
        frames.push(recv(&mut ws).await.expect("socket closed early"));
    }
    cancel.cancel();
    frames.extend(until_terminal(&mut ws).await);
    assert_eq!(frames.last().unwrap()["kind"], "Cancelled");
    let first_sequences = log_sequences(&frames);
    assert_eq!(first_sequences, vec![1, 2, 3, 4]);
    assert_eq!(worker.await.unwrap().status, SessionStatus::Aborted);

    let second_run = Arc::new(ScriptedGenerator::new([ScriptedStep::outcome(
        IterationOutcome::success("done").with_recommendation(Recommendation::Complete),
    )
    .with_logs(["e"])]));
    let worker = spawn_worker(config(&url, &workspace, Mode::Autonomous), second_run);

    let mut ws = accept(&listener).await;
    let start = handshake(&mut ws).await;
    assert_eq!(start["iteration"], 1);
    let frames = until_terminal(&mut ws).await;
    assert_eq!(types(&frames)[0], "session_loaded");
    assert_eq!(log_sequences(&frames), vec![5]);
    assert_eq!(worker.await.unwrap().status, SessionStatus::Complete);
}

#[tokio::test]
async fn test_generation_timeout_stops_the_command_promptly() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(CommandGenerator::new("echo start; sleep 8; echo late"));
    let mut config = config(&url, &workspace, Mode::Autonomous);
    config.session.generation_timeout = Duration::from_millis(300);
    config.session.max_iterations = 1;
    let worker = spawn_worker_with(config, generator, CancellationToken::new());

    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;
    let started = Instant::now();
    let frames = until_terminal(&mut ws).await;

    assert!(
        started.elapsed() < Duration::from_secs(4),
        "terminal frame took {:?}",
        started.elapsed()
    );
    assert_eq!(types(&frames), vec!["log", "iteration_complete", "error"]);
    assert_eq!(frames[0]["text"], "start");
    assert_eq!(frames[1]["outcome"]["success"], false);
    assert!(frames[1]["outcome"]["summary"].as_str().unwrap().contains("timed out"));
    assert_eq!(frames[2]["kind"], "GeneratorError");

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
}

#[tokio::test]
async fn test_logs_lost_while_disconnected_report_dropped_count() {
    let (listener, url) = listen().await;
    let workspace = TempDir::new().unwrap();
    let generator = Arc::new(CommandGenerator::new(
        "sleep 0.5; for i in 1 2 3 4 5 6; do echo line$i; done; echo GENLOOP_RECOMMENDATION: complete",
    ));
    let mut config = config(&url, &workspace, Mode::Autonomous);
    config.log_buffer = 2;
    config.connection.backoff = BackoffPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(2),
        max_jitter: Duration::ZERO,
        max_retries: 5,
    };
    let worker = spawn_worker_with(config, generator, CancellationToken::new());

    // Drop the link before the command prints anything.
    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;
    drop(ws);

    let mut ws = accept(&listener).await;
    handshake(&mut ws).await;
    let frames = until_terminal(&mut ws).await;

    let logs: Vec<&Value> = frames.iter().filter(|f| f["type"] == "log").collect();
    assert_eq!(log_sequences(&frames), vec![5, 6]);
    assert_eq!(logs[0]["droppedCount"], 4);
    assert_eq!(logs[0]["text"], "line5");
    assert!(logs[1].get("droppedCount").is_none());
    assert_eq!(types(&frames).last(), Some(&"all_work_complete"));

    let report = worker.await.unwrap();
    assert_eq!(report.status, SessionStatus::Complete);
    assert_eq!(report.logs.dropped, 4);
}
