//! Owns the single WebSocket connection to the orchestration server.
//!
//! The manager is the only code that reads from or writes to the socket.
//! Everything else talks to it through channels:
//!
//! - [`Outbound`] items queued by the session controller and the log drain,
//!   written strictly in queue order.
//! - [`LinkEvent`]s reported back to the session controller (connectivity
//!   changes, inbound messages, fatal failure).
//! - A `watch` of [`ConnectionState`] that anyone can observe.
//!
//! On an I/O failure the manager enters `Error`, backs off, reconnects and
//! re-sends the `start_generation` handshake with the same `generation_id`.
//! Frames that were already written are never re-sent; a frame whose write
//! failed is written first after the next successful handshake.

use super::backoff::{Backoff, BackoffPolicy};
use super::protocol::{self, Frame, Message, Mode, PROTOCOL_VERSION};
use crate::error::WorkerError;
use futures_util::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the outbound queue shared by the session and the log drain.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Generating,
    AwaitingDecision,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    /// Whether frames written now would reach the server.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Generating
                | ConnectionState::AwaitingDecision
        )
    }
}

/// What the session is doing, mirrored into the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Generating,
    AwaitingDecision,
}

impl SessionPhase {
    fn live_state(self) -> ConnectionState {
        match self {
            SessionPhase::Idle => ConnectionState::Connected,
            SessionPhase::Generating => ConnectionState::Generating,
            SessionPhase::AwaitingDecision => ConnectionState::AwaitingDecision,
        }
    }
}

/// Work queued for the connection.
#[derive(Debug)]
pub enum Outbound {
    Frame(Message),
    Phase { phase: SessionPhase, iteration: u32 },
    /// Send a close frame after everything queued before it, then stop.
    Close,
}

/// Connectivity news for the session controller.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A handshake completed. `resumed` is false only for the first one.
    Up { resumed: bool },
    Down(WorkerError),
    Inbound(Message),
    /// The connection gave up for good.
    Failed(WorkerError),
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// The `start_generation` frame sent on every (re)connection.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub generation_id: String,
    pub mode: Mode,
    pub prompt: String,
    pub workspace_path: String,
    /// Current iteration when resuming an existing session.
    pub iteration: Option<u32>,
}

impl Handshake {
    pub fn message(&self) -> Message {
        Message::StartGeneration {
            generation_id: self.generation_id.clone(),
            mode: self.mode,
            prompt: self.prompt.clone(),
            workspace_path: self.workspace_path.clone(),
            protocol_version: PROTOCOL_VERSION,
            iteration: self.iteration,
        }
    }
}

/// The session-side ends of the channels to a [`ConnectionManager`].
pub struct ConnectionLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub events: mpsc::Receiver<LinkEvent>,
    pub state: watch::Receiver<ConnectionState>,
}

enum ServeEnd {
    Closed,
    Lost(WorkerError),
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    handshake: Handshake,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<LinkEvent>,
    outbound: mpsc::Receiver<Outbound>,
    /// A frame whose write failed; written first after reconnecting.
    unsent: Option<Message>,
    phase: SessionPhase,
    established: bool,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        handshake: Handshake,
        cancel: CancellationToken,
    ) -> (Self, ConnectionLink) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            backoff: Backoff::new(settings.backoff),
            settings,
            handshake,
            state: state_tx,
            events: events_tx,
            outbound: outbound_rx,
            unsent: None,
            phase: SessionPhase::Idle,
            established: false,
            cancel,
        };
        let link = ConnectionLink {
            outbound: outbound_tx,
            events: events_rx,
            state: state_rx,
        };
        (manager, link)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Connection state changed");
        }
    }

    async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Session controller is gone; dropping link event.");
        }
    }

    /// Runs until the session asks to close, cancellation interrupts a
    /// reconnect, or the retry budget is exhausted.
    #[instrument(name = "connection", skip_all, fields(generation_id = %self.handshake.generation_id))]
    pub async fn run(mut self) {
        let mut delay: Option<Duration> = None;
        // Set once cancellation cut a backoff short; allows exactly one more attempt.
        let mut last_attempt = false;
        loop {
            if let Some(wait) = delay.take() {
                info!(
                    retries = self.backoff.retries(),
                    delay_ms = wait.as_millis() as u64,
                    "Reconnecting after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.cancel.cancelled() => {
                        if !self.established || last_attempt {
                            info!("Cancelled while waiting to reconnect.");
                            self.set_state(ConnectionState::Closed);
                            self.emit(LinkEvent::Closed).await;
                            return;
                        }
                        // The session still owes the server its terminal message.
                        info!("Cancelled while waiting to reconnect; one last attempt to close cleanly.");
                        last_attempt = true;
                    }
                }
            }

            self.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                result = self.connect() => result,
                _ = self.cancel.cancelled(), if !self.established => {
                    self.set_state(ConnectionState::Closed);
                    self.emit(LinkEvent::Closed).await;
                    return;
                }
            };

            match attempt {
                Ok(ws) => {
                    self.backoff.reset();
                    let resumed = self.established;
                    self.established = true;
                    self.set_state(self.phase.live_state());
                    info!(resumed, "Session handshake complete");
                    self.emit(LinkEvent::Up { resumed }).await;

                    match self.serve(ws).await {
                        ServeEnd::Closed => {
                            self.set_state(ConnectionState::Closed);
                            self.emit(LinkEvent::Closed).await;
                            info!("Connection closed.");
                            return;
                        }
                        ServeEnd::Lost(err) if err.is_retryable() => {
                            warn!(error = %err, "Connection lost");
                            self.set_state(ConnectionState::Error);
                            self.emit(LinkEvent::Down(err)).await;
                            delay = Some(self.backoff.next_delay());
                        }
                        ServeEnd::Lost(err) => {
                            self.give_up(err).await;
                            return;
                        }
                    }
                }
                Err(err) if err.is_retryable() => {
                    self.set_state(ConnectionState::Error);
                    if !self.backoff.record_failure() {
                        let attempts = self.backoff.retries();
                        self.give_up(WorkerError::Connection(format!(
                            "giving up after {attempts} failed attempts: {err}"
                        )))
                        .await;
                        return;
                    }
                    warn!(error = %err, retries = self.backoff.retries(), "Connection attempt failed");
                    delay = Some(self.backoff.next_delay());
                }
                Err(err) => {
                    self.give_up(err).await;
                    return;
                }
            }
        }
    }

    async fn give_up(&self, err: WorkerError) {
        error!(error = %err, "Connection failed permanently");
        self.set_state(ConnectionState::Closed);
        self.emit(LinkEvent::Failed(err)).await;
    }

    /// Opens the socket and completes the `start_generation`/`ready` exchange.
    async fn connect(&self) -> Result<WsStream, WorkerError> {
        let mut request = self.settings.url.as_str().into_client_request()?;
        if let Some(token) = &self.settings.auth_token {
            let value: HeaderValue = format!("Bearer {token}").parse().map_err(|_| {
                WorkerError::NonRetryable("auth token is not a valid header value".to_string())
            })?;
            request.headers_mut().insert("Authorization", value);
        }

        let deadline = Instant::now() + self.settings.connect_timeout;
        let (mut ws, _) = tokio::time::timeout_at(deadline, connect_async(request))
            .await
            .map_err(|_| WorkerError::Timeout("connect timed out".to_string()))??;
        debug!(url = %self.settings.url, "Socket open; sending handshake");

        let mut handshake = self.handshake.clone();
        if self.established && handshake.iteration.is_none() {
            handshake.iteration = Some(0);
        }
        write_frame(&mut ws, &handshake.message(), self.settings.send_timeout).await?;

        loop {
            let next = tokio::time::timeout_at(deadline, ws.next())
                .await
                .map_err(|_| WorkerError::Timeout("no `ready` before connect timeout".to_string()))?;
            let bytes = match next {
                None => {
                    return Err(WorkerError::Connection(
                        "socket closed during handshake".to_string(),
                    ));
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => text.as_str().as_bytes().to_vec(),
                Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                Some(Ok(WsMessage::Close(_))) => {
                    return Err(WorkerError::Connection(
                        "server closed during handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
            };
            match protocol::decode(&bytes) {
                Ok(Frame::Known(Message::Ready {
                    generation_id,
                    protocol_version,
                })) => {
                    if generation_id != self.handshake.generation_id {
                        return Err(WorkerError::NonRetryable(format!(
                            "server acknowledged generation '{generation_id}' instead of '{}'",
                            self.handshake.generation_id
                        )));
                    }
                    if let Some(version) = protocol_version {
                        if version != PROTOCOL_VERSION {
                            return Err(WorkerError::NonRetryable(format!(
                                "protocol version mismatch: server {version}, worker {PROTOCOL_VERSION}"
                            )));
                        }
                    }
                    return Ok(ws);
                }
                Ok(Frame::Known(Message::Error { kind, message, .. })) => {
                    return Err(WorkerError::from_remote(kind, message));
                }
                Ok(Frame::Known(other)) => {
                    debug!(kind = other.type_name(), "Ignoring frame received before `ready`");
                }
                Ok(Frame::Unrecognized { kind, .. }) => {
                    debug!(%kind, "Ignoring unrecognized frame during handshake");
                }
                Err(e) => warn!(error = %e, "Dropping undecodable frame during handshake"),
            }
        }
    }

    /// Pumps the outbound queue and the socket until one of them ends.
    async fn serve(&mut self, ws: WsStream) -> ServeEnd {
        let (mut sink, mut stream) = ws.split();
        let send_timeout = self.settings.send_timeout;

        if let Some(message) = self.unsent.take() {
            debug!(kind = message.type_name(), "Re-sending frame that failed before the drop");
            if let Err(err) = write_frame(&mut sink, &message, send_timeout).await {
                self.unsent = Some(message);
                return ServeEnd::Lost(err);
            }
        }

        loop {
            tokio::select! {
                item = self.outbound.recv() => match item {
                    Some(Outbound::Frame(message)) => {
                        if let Err(err) = write_frame(&mut sink, &message, send_timeout).await {
                            self.unsent = Some(message);
                            return ServeEnd::Lost(err);
                        }
                    }
                    Some(Outbound::Phase { phase, iteration }) => {
                        self.phase = phase;
                        self.handshake.iteration = Some(iteration);
                        self.set_state(phase.live_state());
                    }
                    Some(Outbound::Close) | None => {
                        self.set_state(ConnectionState::Closing);
                        match tokio::time::timeout(send_timeout, sink.send(WsMessage::Close(None))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(error = %e, "Close frame was not delivered"),
                            Err(_) => debug!("Timed out sending close frame"),
                        }
                        return ServeEnd::Closed;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(text.as_str().as_bytes()).await,
                    Some(Ok(WsMessage::Binary(data))) => self.dispatch(&data).await,
                    Some(Ok(WsMessage::Close(_))) => {
                        return ServeEnd::Lost(WorkerError::Connection("server closed the connection".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ServeEnd::Lost(e.into()),
                    None => return ServeEnd::Lost(WorkerError::Connection("socket stream ended".to_string())),
                },
            }
        }
    }

    /// Decodes one inbound frame and hands it to the session controller.
    async fn dispatch(&self, bytes: &[u8]) {
        match protocol::decode(bytes) {
            Ok(Frame::Known(message)) => {
                if message.generation_id() != self.handshake.generation_id {
                    warn!(
                        kind = message.type_name(),
                        other = message.generation_id(),
                        "Dropping frame for another generation"
                    );
                    return;
                }
                self.emit(LinkEvent::Inbound(message)).await;
            }
            Ok(Frame::Unrecognized { kind, .. }) => {
                warn!(%kind, "Skipping unrecognized message type");
            }
            Err(e) => warn!(error = %e, "Dropping undecodable frame"),
        }
    }
}

/// Serializes and writes one frame within `send_timeout`.
///
/// A frame that cannot be encoded is logged and skipped; it is not a
/// connection failure.
async fn write_frame<S>(sink: &mut S, message: &Message, send_timeout: Duration) -> Result<(), WorkerError>
where
    S: Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = match protocol::encode(message) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Skipping frame that failed to encode");
            return Ok(());
        }
    };
    match tokio::time::timeout(send_timeout, sink.send(WsMessage::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(WorkerError::Timeout(format!(
            "sending `{}` timed out",
            message.type_name()
        ))),
    }
}
