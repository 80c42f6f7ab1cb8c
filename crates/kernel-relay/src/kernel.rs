//! WebSocket transport client for a kernel's channels endpoint.
//!
//! `KernelClient::connect` uses a split pattern with channels:
//! - `KernelHandle` is a clonable handle for sending requests
//! - `KernelEvents` receives connection and kernel status events
//! - A background task owns the socket, the router and the connection
//!   tracker, so no locks are held across network I/O
//!
//! Requests are registered with the router before they are written, which
//! means a reply can never arrive ahead of its callbacks. When the socket
//! drops, pending callbacks are abandoned and the reconnect policy decides
//! between a delayed retry and giving up.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jupyter_protocol::{ExecuteRequest, KernelInfoRequest};
use jupyter_wire::{Channel, KernelMessage, WireError, WireFrame};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use crate::callbacks::Callbacks;
use crate::connection::{ConnectionState, ConnectionTracker, NextStep, ReconnectPolicy};
use crate::dispatch::{KernelEvent, Router};
use crate::settings::RelaySettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Error type for kernel client operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Kernel connection is not open (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Kernel client task has stopped")]
    ChannelClosed,

    #[error("Request {0} was abandoned before it completed")]
    Abandoned(String),

    #[error("Timed out waiting for reply to {0}")]
    Timeout(String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Reply for {0} was already awaited")]
    ReplyTaken(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct KernelConnectionConfig {
    /// `ws://` or `wss://` URL of `/api/kernels/{id}/channels`
    pub url: Url,
    pub token: Option<String>,
    /// Session id stamped on every outgoing header
    pub session_id: String,
    pub username: String,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl KernelConnectionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            token: None,
            session_id: Uuid::new_v4().to_string(),
            username: String::new(),
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_settings(url: Url, settings: &RelaySettings) -> Self {
        Self {
            token: settings.token.clone(),
            username: settings.username.clone(),
            policy: settings.reconnect_policy(),
            request_timeout: settings.request_timeout(),
            ..Self::new(url)
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Commands sent from handles to the transport task.
#[derive(Debug)]
enum Command {
    Send {
        msg: KernelMessage,
        callbacks: Callbacks,
    },
    RegisterIopubHandler {
        msg_type: String,
        handler: mpsc::UnboundedSender<KernelMessage>,
    },
    Clear {
        msg_id: String,
    },
    Reconnect,
    Close,
}

/// Options for `execute_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

/// Everything an execution produced.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub outputs: Vec<KernelMessage>,
    pub reply: KernelMessage,
}

/// An in-flight `execute_request`.
///
/// The iopub stream (`next_output`) ends once the kernel reports idle for
/// this request. The reply arrives separately on the shell channel.
pub struct Execution {
    msg_id: String,
    reply_rx: Option<oneshot::Receiver<KernelMessage>>,
    outputs: mpsc::UnboundedReceiver<KernelMessage>,
    inputs: mpsc::UnboundedReceiver<KernelMessage>,
    handle: KernelHandle,
}

impl Execution {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Next iopub message for this request, `None` once the stream ends.
    pub async fn next_output(&mut self) -> Option<KernelMessage> {
        self.outputs.recv().await
    }

    /// Next stdin `input_request` for this request.
    pub async fn next_input_request(&mut self) -> Option<KernelMessage> {
        self.inputs.recv().await
    }

    /// Answer an `input_request`.
    pub fn input_reply(&self, value: &str) -> Result<String, KernelError> {
        self.handle.input_reply(value)
    }

    /// Wait for the shell reply. Can be awaited once.
    pub async fn reply(&mut self) -> Result<KernelMessage, KernelError> {
        let rx = self
            .reply_rx
            .take()
            .ok_or_else(|| KernelError::ReplyTaken(self.msg_id.clone()))?;
        rx.await
            .map_err(|_| KernelError::Abandoned(self.msg_id.clone()))
    }

    /// Drain the iopub stream, then wait for the reply.
    pub async fn collect(mut self) -> Result<ExecutionOutcome, KernelError> {
        let mut outputs = Vec::new();
        while let Some(msg) = self.next_output().await {
            outputs.push(msg);
        }
        let reply = self.reply().await?;
        Ok(ExecutionOutcome { outputs, reply })
    }
}

/// Receiver for kernel events.
pub struct KernelEvents {
    rx: broadcast::Receiver<KernelEvent>,
}

impl KernelEvents {
    /// Next event, or `None` once the transport has shut down.
    pub async fn recv(&mut self) -> Option<KernelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[kernel-events] Receiver lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Handle for sending requests to the transport task.
///
/// This is clonable and can be shared across tasks.
#[derive(Clone)]
pub struct KernelHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<KernelEvent>,
    session_id: String,
    username: String,
    request_timeout: Duration,
}

impl KernelHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection and kernel status events.
    pub fn subscribe(&self) -> KernelEvents {
        KernelEvents {
            rx: self.events.subscribe(),
        }
    }

    /// Wait until the connection is open. Fails if it dies first.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), KernelError> {
        let mut state = self.state.clone();
        let wait = async move {
            state
                .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Dead))
                .await
                .map(|s| *s)
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(s)) => Err(KernelError::NotConnected(s)),
            Ok(Err(_)) => Err(KernelError::ChannelClosed),
            Err(_) => Err(KernelError::NotConnected(self.state())),
        }
    }

    /// Build and send a message. Returns its `msg_id` right away.
    pub fn send(
        &self,
        channel: Channel,
        msg_type: &str,
        content: Value,
        callbacks: Callbacks,
    ) -> Result<String, KernelError> {
        let msg = KernelMessage::new(&self.session_id, &self.username, channel, msg_type, content);
        self.send_message(msg, callbacks)
    }

    /// Send a prepared message. Fails unless the connection is open.
    pub fn send_message(
        &self,
        msg: KernelMessage,
        callbacks: Callbacks,
    ) -> Result<String, KernelError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(KernelError::NotConnected(state));
        }
        let msg_id = msg.msg_id().to_string();
        self.tx
            .send(Command::Send { msg, callbacks })
            .map_err(|_| KernelError::ChannelClosed)?;
        Ok(msg_id)
    }

    /// Send a shell request and wait for its reply.
    pub async fn request(&self, msg_type: &str, content: Value) -> Result<KernelMessage, KernelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg_id = self.send(
            Channel::Shell,
            msg_type,
            content,
            Callbacks::reply_only(reply_tx),
        )?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(KernelError::Abandoned(msg_id)),
            Err(_) => {
                let _ = self.tx.send(Command::Clear {
                    msg_id: msg_id.clone(),
                });
                Err(KernelError::Timeout(msg_id))
            }
        }
    }

    /// Run code. Outputs, input requests and the reply arrive on the
    /// returned `Execution`.
    pub fn execute(&self, code: &str, options: ExecuteOptions) -> Result<Execution, KernelError> {
        let mut content = serde_json::to_value(ExecuteRequest::new(code.to_string()))?;
        content["silent"] = json!(options.silent);
        content["store_history"] = json!(options.store_history);
        content["allow_stdin"] = json!(options.allow_stdin);
        content["stop_on_error"] = json!(options.stop_on_error);

        let (reply_tx, reply_rx) = oneshot::channel();
        let (iopub_tx, outputs) = mpsc::unbounded_channel();
        let (input_tx, inputs) = mpsc::unbounded_channel();
        let callbacks = Callbacks {
            reply: Some(reply_tx),
            iopub: Some(iopub_tx),
            input: options.allow_stdin.then_some(input_tx),
            clear_on_done: true,
        };

        let msg_id = self.send(Channel::Shell, "execute_request", content, callbacks)?;
        debug!("[kernel-client] execute_request {}", msg_id);

        Ok(Execution {
            msg_id,
            reply_rx: Some(reply_rx),
            outputs,
            inputs,
            handle: self.clone(),
        })
    }

    pub async fn kernel_info(&self) -> Result<KernelMessage, KernelError> {
        let content = serde_json::to_value(KernelInfoRequest::default())?;
        self.request("kernel_info_request", content).await
    }

    pub async fn complete(&self, code: &str, cursor_pos: usize) -> Result<KernelMessage, KernelError> {
        self.request(
            "complete_request",
            json!({ "code": code, "cursor_pos": cursor_pos }),
        )
        .await
    }

    pub async fn inspect(
        &self,
        code: &str,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<KernelMessage, KernelError> {
        self.request(
            "inspect_request",
            json!({ "code": code, "cursor_pos": cursor_pos, "detail_level": detail_level }),
        )
        .await
    }

    pub async fn is_complete(&self, code: &str) -> Result<KernelMessage, KernelError> {
        self.request("is_complete_request", json!({ "code": code }))
            .await
    }

    /// The last `n` history entries, with input only.
    pub async fn history_tail(&self, n: usize) -> Result<KernelMessage, KernelError> {
        self.request(
            "history_request",
            json!({ "output": false, "raw": true, "hist_access_type": "tail", "n": n }),
        )
        .await
    }

    /// Answer a stdin `input_request`.
    pub fn input_reply(&self, value: &str) -> Result<String, KernelError> {
        self.send(
            Channel::Stdin,
            "input_reply",
            json!({ "status": "ok", "value": value }),
            Callbacks::default(),
        )
    }

    /// Route every iopub message of `msg_type` to the returned receiver.
    pub fn register_iopub_handler(
        &self,
        msg_type: &str,
    ) -> Result<mpsc::UnboundedReceiver<KernelMessage>, KernelError> {
        let (handler, rx) = mpsc::unbounded_channel();
        self.route_iopub_to(msg_type, handler)?;
        Ok(rx)
    }

    /// Route every iopub message of `msg_type` to `handler`. Types sharing
    /// one handler keep their arrival order.
    pub fn route_iopub_to(
        &self,
        msg_type: &str,
        handler: mpsc::UnboundedSender<KernelMessage>,
    ) -> Result<(), KernelError> {
        self.tx
            .send(Command::RegisterIopubHandler {
                msg_type: msg_type.to_string(),
                handler,
            })
            .map_err(|_| KernelError::ChannelClosed)
    }

    /// Leave the dead state, or skip the remaining backoff delay.
    pub fn reconnect(&self) -> Result<(), KernelError> {
        self.tx
            .send(Command::Reconnect)
            .map_err(|_| KernelError::ChannelClosed)
    }

    /// Close the connection without reconnecting; the task then exits and
    /// the state settles on `Disconnected`, also when it was `Dead`.
    pub fn close(&self) -> Result<(), KernelError> {
        self.tx
            .send(Command::Close)
            .map_err(|_| KernelError::ChannelClosed)
    }
}

/// Entry point for kernel connections.
pub struct KernelClient;

impl KernelClient {
    /// Spawn the transport task and start connecting.
    pub fn connect(config: KernelConnectionConfig) -> (KernelHandle, KernelEvents) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = broadcast::channel(256);

        let handle = KernelHandle {
            tx: cmd_tx,
            state: state_rx,
            events: events_tx.clone(),
            session_id: config.session_id.clone(),
            username: config.username.clone(),
            request_timeout: config.request_timeout,
        };

        let task = TransportTask {
            tracker: ConnectionTracker::new(config.policy),
            router: Router::new(events_tx.clone()),
            config,
            cmd_rx,
            state_tx,
            events: events_tx,
        };
        tokio::spawn(task.run());

        (handle, KernelEvents { rx: events_rx })
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Lost(String),
    Shutdown,
}

/// What to do with a command received while offline.
enum Offline {
    Continue,
    Reconnect,
    Shutdown,
}

struct TransportTask {
    config: KernelConnectionConfig,
    tracker: ConnectionTracker,
    router: Router,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<KernelEvent>,
}

impl TransportTask {
    fn endpoint(&self) -> String {
        // Never log the query string; it may carry a token.
        format!(
            "{}://{}{}",
            self.config.url.scheme(),
            self.config.url.host_str().unwrap_or(""),
            self.config.url.path()
        )
    }

    fn publish_state(&self) {
        let state = self.tracker.state();
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("[kernel-client] {} -> {}", previous, state);
            let _ = self.events.send(KernelEvent::State(state));
        }
    }

    async fn run(mut self) {
        info!("[kernel-client] Starting transport for {}", self.endpoint());

        loop {
            if let Err(e) = self.tracker.begin_connect() {
                error!("[kernel-client] {}", e);
                break;
            }
            self.publish_state();

            let end = match self.open().await {
                Ok(ws) => match self.tracker.opened() {
                    Ok(()) => {
                        info!("[kernel-client] Connected to {}", self.endpoint());
                        self.publish_state();
                        self.serve(ws).await
                    }
                    Err(e) => SessionEnd::Lost(e.to_string()),
                },
                Err(e) => SessionEnd::Lost(e.to_string()),
            };

            let abandoned = self.router.abandon_pending();
            if abandoned > 0 {
                info!(
                    "[kernel-client] Abandoned {} pending requests for {}",
                    abandoned,
                    self.endpoint()
                );
            }

            let reason = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => reason,
            };

            warn!(
                "[kernel-client] Connection to {} lost: {}",
                self.endpoint(),
                reason
            );
            let _ = self.events.send(KernelEvent::ConnectionFailed {
                attempt: self.tracker.attempt(),
                error: reason,
            });

            match self.tracker.lost() {
                Ok(NextStep::Retry { attempt, delay }) => {
                    self.publish_state();
                    info!(
                        "[kernel-client] Reconnecting in {:?} (attempt {})",
                        delay, attempt
                    );
                    let _ = self
                        .events
                        .send(KernelEvent::Reconnecting { attempt, delay });
                    if !self.wait_before_retry(delay).await {
                        break;
                    }
                }
                Ok(NextStep::Dead) => {
                    self.publish_state();
                    error!(
                        "[kernel-client] Failed to reconnect to {}, giving up",
                        self.endpoint()
                    );
                    let _ = self.events.send(KernelEvent::ConnectionDead);
                    if !self.wait_for_reconnect().await {
                        break;
                    }
                    self.tracker.reset();
                }
                Err(e) => {
                    error!("[kernel-client] {}", e);
                    break;
                }
            }
        }

        self.tracker.closed();
        self.publish_state();
        info!("[kernel-client] Transport for {} stopped", self.endpoint());
    }

    async fn open(&self) -> Result<WsStream, KernelError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("token {}", token))
                .map_err(|e| KernelError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        match tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(KernelError::WebSocket(e)),
            Err(_) => Err(KernelError::ConnectTimeout(self.endpoint())),
        }
    }

    /// Pump commands and socket frames until the session ends.
    async fn serve(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send { msg, callbacks }) => {
                        let frame = match WireFrame::encode(&msg) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("[kernel-client] Could not encode {}: {}", msg.msg_type(), e);
                                continue;
                            }
                        };
                        self.router.register(msg.msg_id(), callbacks);
                        let ws_msg = match frame {
                            WireFrame::Text(text) => Message::Text(text),
                            WireFrame::Binary(data) => Message::Binary(data),
                        };
                        if let Err(e) = sink.send(ws_msg).await {
                            return SessionEnd::Lost(format!("send failed: {}", e));
                        }
                    }
                    Some(Command::RegisterIopubHandler { msg_type, handler }) => {
                        self.router.register_iopub_handler(&msg_type, handler);
                    }
                    Some(Command::Clear { msg_id }) => {
                        self.router.clear(&msg_id);
                    }
                    Some(Command::Reconnect) => {
                        debug!("[kernel-client] Reconnect requested while connected, ignoring");
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.on_frame(WireFrame::Text(text)),
                    Some(Ok(Message::Binary(data))) => self.on_frame(WireFrame::Binary(data)),
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }

    fn on_frame(&mut self, frame: WireFrame) {
        match frame.decode() {
            Ok(msg) => {
                let msg_type = msg.msg_type().to_string();
                let routed = self.router.route(msg);
                debug!("[kernel-client] {} -> {:?}", msg_type, routed);
            }
            Err(e) => warn!("[kernel-client] Dropping malformed message: {}", e),
        }
    }

    fn handle_offline(&mut self, cmd: Option<Command>) -> Offline {
        match cmd {
            None | Some(Command::Close) => Offline::Shutdown,
            Some(Command::Reconnect) => Offline::Reconnect,
            Some(Command::Send { msg, .. }) => {
                // Dropping the callbacks closes the caller's channels.
                warn!(
                    "[kernel-client] Dropping {} {} while {}",
                    msg.msg_type(),
                    msg.msg_id(),
                    self.tracker.state()
                );
                Offline::Continue
            }
            Some(Command::RegisterIopubHandler { msg_type, handler }) => {
                self.router.register_iopub_handler(&msg_type, handler);
                Offline::Continue
            }
            Some(Command::Clear { msg_id }) => {
                self.router.clear(&msg_id);
                Offline::Continue
            }
        }
    }

    /// Sleep out the backoff delay. Returns `false` if asked to shut down.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match self.handle_offline(cmd) {
                    Offline::Continue => {}
                    Offline::Reconnect => return true,
                    Offline::Shutdown => return false,
                },
            }
        }
    }

    /// Park in the dead state until an explicit reconnect.
    async fn wait_for_reconnect(&mut self) -> bool {
        loop {
            let cmd = self.cmd_rx.recv().await;
            match self.handle_offline(cmd) {
                Offline::Continue => {}
                Offline::Reconnect => return true,
                Offline::Shutdown => return false,
            }
        }
    }
}
