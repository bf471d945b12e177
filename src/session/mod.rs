//! Streaming session coordinator
//!
//! Maintains a persistent WebSocket connection to the Platewatch streaming
//! endpoint, multiplexes inbound typed messages to registered subscribers,
//! derives the observable session state from the event stream, and governs
//! the lifecycle of an upload-triggered processing job.
//!
//! ## Design
//!
//! A single coordinator task owns the transport and the session record.
//! Caller commands, transport events and reconnection timer firings all
//! arrive through one channel, so state transitions are strictly
//! serialized without locks on the hot path. The record is published
//! through an `RwLock` written only by the coordinator; external readers
//! take cheap snapshots.
//!
//! The session identifier is generated on the first `connect()` of a
//! logical session and persists across automatic reconnection attempts;
//! only an explicit `disconnect()` (or a normal-close from the server,
//! code 1000) ends the logical session.

pub mod reconnect;
pub mod state;
pub mod subscriptions;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ApiClient, ProcessingOptions, ResultFormat};
use crate::protocol::{decode_envelope, Command, SystemMessage};
use crate::types::{PlatewatchError, Result};

pub use reconnect::ReconnectPolicy;
pub use state::{LocalEvent, StreamingState, StreamingStatus};
pub use subscriptions::{SubscriptionHandle, SubscriptionRegistry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for one streaming session coordinator
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket base URL (e.g. "ws://localhost:8000")
    pub ws_base: String,
    /// REST API base URL for upload and result retrieval
    pub api_base: String,
    /// Fixed delay between reconnection attempts
    pub reconnect_interval: Duration,
    /// Maximum consecutive reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_base: "ws://localhost:8000".to_string(),
            api_base: "http://localhost:8000".to_string(),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

/// Commands accepted by the coordinator task
enum SessionCommand {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Send(Command, oneshot::Sender<bool>),
    Apply(LocalEvent),
    /// Fired by the reconnection timer; the generation guards against
    /// ticks from cancelled timers still sitting in the queue
    ReconnectTick(u64),
}

/// Handle to a streaming session.
///
/// Cheap to clone; all clones drive the same coordinator task. The task
/// shuts down (closing the connection and cancelling any pending
/// reconnection timer) when the last handle is dropped, but callers that
/// own a live job should still `disconnect()` explicitly.
#[derive(Clone)]
pub struct StreamingSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state: Arc<RwLock<StreamingState>>,
    registry: Arc<SubscriptionRegistry>,
    retry_pending: Arc<AtomicBool>,
    api: ApiClient,
}

impl StreamingSession {
    /// Create a session coordinator. Must be called from within a tokio
    /// runtime; the coordinator task starts immediately but stays idle
    /// until `connect()`.
    pub fn new(config: SessionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let state = Arc::new(RwLock::new(StreamingState::default()));
        let registry = Arc::new(SubscriptionRegistry::new());
        let retry_pending = Arc::new(AtomicBool::new(false));
        let api = ApiClient::new(config.api_base.clone());

        let coordinator = Coordinator {
            policy: ReconnectPolicy::new(config.reconnect_interval, config.max_reconnect_attempts),
            timer_tx: cmd_tx.downgrade(),
            config,
            state: Arc::clone(&state),
            registry: Arc::clone(&registry),
            retry_pending: Arc::clone(&retry_pending),
            cmd_rx,
            ws: None,
            session_id: String::new(),
            reconnect_timer: None,
            timer_gen: 0,
        };
        tokio::spawn(coordinator.run());

        Self {
            cmd_tx,
            state,
            registry,
            retry_pending,
            api,
        }
    }

    /// Open the streaming connection. No-op if already open.
    ///
    /// Generates a fresh session identifier when no logical session is in
    /// progress. Fire-and-forget: observe the result through `state()` or
    /// `wait_connected()`.
    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Connect).await;
    }

    /// Close the connection and hard-reset the session record.
    ///
    /// Cancels any pending reconnection timer and closes with a normal
    /// close code so no reconnection is attempted. Returns once the state
    /// reset is visible.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Disconnect(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Send a command over the streaming connection.
    ///
    /// Returns false (and logs) when the connection is not open.
    pub async fn send(&self, command: Command) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Send(command, reply_tx))
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Upload a source video and start processing on the current session.
    ///
    /// Fails with `InvalidState` when not connected. On the success path
    /// the state moves through `Uploading` to `Initializing`; the
    /// transition to `Processing` arrives later via `streaming_started`.
    /// An upload failure is recorded in the session record and re-raised.
    pub async fn start_streaming(&self, path: &Path, options: &ProcessingOptions) -> Result<()> {
        let snapshot = self.state().await;
        if !snapshot.is_connected || snapshot.session_id.is_empty() {
            return Err(PlatewatchError::InvalidState(
                "no active connection; call connect() before starting a stream".into(),
            ));
        }

        self.apply(LocalEvent::UploadStarted).await;
        match self
            .api
            .upload_video(&snapshot.session_id, path, options)
            .await
        {
            Ok(()) => {
                self.apply(LocalEvent::UploadAccepted).await;
                Ok(())
            }
            Err(e) => {
                self.apply(LocalEvent::UploadFailed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Ask the service to pause processing. The session record changes
    /// only when the `processing_paused` confirmation arrives.
    pub async fn pause(&self) -> bool {
        self.send(Command::PauseProcessing).await
    }

    /// Ask the service to resume processing
    pub async fn resume(&self) -> bool {
        self.send(Command::ResumeProcessing).await
    }

    /// Ask the service to stop processing
    pub async fn stop(&self) -> bool {
        self.send(Command::StopProcessing).await
    }

    /// Request a status report; the reply arrives as a subscriber-visible
    /// message
    pub async fn request_status(&self) -> bool {
        self.send(Command::GetStatus).await
    }

    /// Download the results artifact for the current session
    pub async fn download_results(&self, format: ResultFormat) -> Result<Bytes> {
        let session_id = self.state.read().await.session_id.clone();
        if session_id.is_empty() {
            return Err(PlatewatchError::InvalidState(
                "no active session to download results for".into(),
            ));
        }
        self.api.download_results(&session_id, format).await
    }

    /// Register a handler for a message type tag
    pub fn subscribe<F>(&self, tag: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.subscribe(tag, handler)
    }

    /// Snapshot of the current session record
    pub async fn state(&self) -> StreamingState {
        self.state.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_connected
    }

    /// Whether a reconnection attempt is scheduled or in flight.
    ///
    /// Distinguishes a transient disconnect (the coordinator will retry)
    /// from a terminal one (exhausted retries or intentional close).
    pub fn retry_pending(&self) -> bool {
        self.retry_pending.load(Ordering::SeqCst)
    }

    /// Clear the recorded error; no other side effects
    pub async fn clear_error(&self) {
        self.apply(LocalEvent::ErrorCleared).await;
    }

    /// Wait until the connection is open, polling the session record
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.read().await.is_connected {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PlatewatchError::WebSocket(
                    "timeout waiting for streaming connection".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The underlying REST client, for callers that saved a session id
    /// and fetch results after the session ended
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    async fn apply(&self, event: LocalEvent) {
        let _ = self.cmd_tx.send(SessionCommand::Apply(event)).await;
    }
}

/// One iteration's wake-up source
enum LoopEvent {
    Command(Option<SessionCommand>),
    Socket(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

/// Coordinator task: sole owner of the transport and the session record
struct Coordinator {
    config: SessionConfig,
    state: Arc<RwLock<StreamingState>>,
    registry: Arc<SubscriptionRegistry>,
    retry_pending: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    /// Weak so a pending timer does not keep the coordinator alive after
    /// the last session handle is dropped
    timer_tx: mpsc::WeakSender<SessionCommand>,
    ws: Option<WsStream>,
    /// Authoritative session identifier; outlives individual connections
    session_id: String,
    policy: ReconnectPolicy,
    reconnect_timer: Option<JoinHandle<()>>,
    timer_gen: u64,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            let event = if let Some(ws) = self.ws.as_mut() {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => LoopEvent::Command(cmd),
                    frame = ws.next() => LoopEvent::Socket(frame),
                }
            } else {
                LoopEvent::Command(self.cmd_rx.recv().await)
            };

            match event {
                // All handles dropped
                LoopEvent::Command(None) => break,
                LoopEvent::Command(Some(cmd)) => self.handle_command(cmd).await,
                LoopEvent::Socket(frame) => self.handle_socket_event(frame).await,
            }
        }

        self.cancel_timer();
        if let Some(mut ws) = self.ws.take() {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session dropped".into(),
                }))
                .await;
        }
        debug!("Session coordinator stopped");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect => self.open_connection().await,
            SessionCommand::ReconnectTick(gen) => {
                if gen == self.timer_gen && self.ws.is_none() {
                    self.open_connection().await;
                }
            }
            SessionCommand::Disconnect(ack) => {
                self.cancel_timer();
                self.retry_pending.store(false, Ordering::SeqCst);
                self.policy.reset();
                if let Some(mut ws) = self.ws.take() {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }))
                        .await;
                }
                self.session_id.clear();
                self.state.write().await.reset();
                info!("Disconnected; session state reset");
                let _ = ack.send(());
            }
            SessionCommand::Send(command, reply) => {
                let ok = self.send_command(&command).await;
                let _ = reply.send(ok);
            }
            SessionCommand::Apply(event) => {
                self.state.write().await.apply_local(&event);
            }
        }
    }

    /// Open the transport for the current logical session.
    /// No-op when a connection is already open.
    async fn open_connection(&mut self) {
        if self.ws.is_some() {
            debug!("connect ignored: connection already open");
            return;
        }
        if self.session_id.is_empty() {
            self.session_id = Uuid::new_v4().to_string();
        }
        let url = format!(
            "{}/api/v1/streaming/ws/{}",
            self.config.ws_base.trim_end_matches('/'),
            self.session_id
        );
        info!(session_id = %self.session_id, "Connecting to {}", url);

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                self.cancel_timer();
                self.ws = Some(ws);
                self.policy.reset();
                self.retry_pending.store(false, Ordering::SeqCst);
                self.state.write().await.mark_connected(&self.session_id);
                info!("Streaming connection open");
            }
            Err(e) => {
                warn!("WebSocket connect failed: {}", e);
                // Decide on the retry before publishing the failure so
                // observers never see a disconnected record without a
                // pending retry unless the disconnect really is terminal
                let exhausted = self.schedule_reconnect();
                let mut state = self.state.write().await;
                state.mark_error(&format!("connect failed: {}", e));
                state.mark_disconnected();
                if let Some(message) = exhausted {
                    state.record_error(&message);
                }
            }
        }
    }

    async fn handle_socket_event(
        &mut self,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match frame {
            Some(Ok(Message::Text(raw))) => self.handle_frame(&raw).await,
            Some(Ok(Message::Ping(payload))) => {
                if let Some(ws) = self.ws.as_mut() {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Close(close_frame))) => {
                let intentional = close_frame
                    .as_ref()
                    .map_or(false, |f| f.code == CloseCode::Normal);
                info!("Connection closed by peer: {:?}", close_frame);
                self.handle_closed(intentional, None).await;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("Ignoring unexpected binary frame");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Transport error: {}", e);
                self.handle_closed(false, Some(e.to_string())).await;
            }
            None => {
                // EOF without a close frame
                self.handle_closed(false, None).await;
            }
        }
    }

    /// Decode one inbound frame and route it.
    ///
    /// Subscribers and the state transition both always run; a panicking
    /// handler cannot starve the state update (isolation lives in the
    /// registry), and a malformed frame is dropped without reaching
    /// either.
    async fn handle_frame(&mut self, raw: &str) {
        let envelope = match decode_envelope(raw) {
            Ok(env) => env,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        let data = envelope.data.clone().unwrap_or(Value::Null);
        self.registry.dispatch(&envelope.tag, &data);

        let msg = SystemMessage::from_envelope(&envelope);
        self.state.write().await.apply(&msg);
    }

    /// The transport is gone; decide whether to reconnect.
    ///
    /// The retry decision, any transport error and the disconnect
    /// transition are published under one state write so observers never
    /// see an intermediate shape.
    async fn handle_closed(&mut self, intentional: bool, transport_error: Option<String>) {
        self.ws = None;

        if intentional {
            info!("Normal closure; not reconnecting");
            self.cancel_timer();
            self.session_id.clear();
            self.policy.reset();
            self.retry_pending.store(false, Ordering::SeqCst);
            self.state.write().await.mark_disconnected();
        } else {
            let exhausted = self.schedule_reconnect();
            let mut state = self.state.write().await;
            if let Some(message) = &transport_error {
                state.mark_error(message);
            }
            state.mark_disconnected();
            if let Some(message) = exhausted {
                state.record_error(&message);
            }
        }
    }

    /// Replace any pending reconnection timer with a fresh one. Returns
    /// the terminal error message when attempts are exhausted instead.
    fn schedule_reconnect(&mut self) -> Option<String> {
        self.cancel_timer();
        match self.policy.next_delay() {
            Some(delay) => {
                let gen = self.timer_gen;
                let tx = self.timer_tx.clone();
                info!(
                    attempt = self.policy.attempts(),
                    max = self.policy.max_attempts(),
                    "Reconnecting in {:?}",
                    delay
                );
                self.retry_pending.store(true, Ordering::SeqCst);
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(SessionCommand::ReconnectTick(gen)).await;
                    }
                }));
                None
            }
            None => {
                let message = format!(
                    "reconnect attempts exhausted after {} attempts",
                    self.policy.max_attempts()
                );
                error!("{}", message);
                self.retry_pending.store(false, Ordering::SeqCst);
                Some(message)
            }
        }
    }

    /// Cancel the pending reconnection timer, if any. Bumping the
    /// generation invalidates ticks already sitting in the command queue.
    fn cancel_timer(&mut self) {
        self.timer_gen += 1;
        if let Some(handle) = self.reconnect_timer.take() {
            handle.abort();
        }
    }

    async fn send_command(&mut self, command: &Command) -> bool {
        let Some(ws) = self.ws.as_mut() else {
            warn!("Cannot send {:?}: connection not open", command);
            return false;
        };
        let text = match command.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        match ws.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Send failed: {}", e);
                false
            }
        }
    }
}
