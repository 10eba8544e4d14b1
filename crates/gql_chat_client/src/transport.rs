//! WebSocket transport: a single `graphql-ws` connection multiplexing every
//! subscription, with reconnection and a global close.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::messages::{
    join_errors, ClientMessage, GraphqlError, OperationPayload, ServerMessage, SUBPROTOCOL,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Identifies one logical subscription on a connection.
pub type OperationId = u64;

/// What a logical subscription receives from the transport, in server order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A `data` frame payload, untouched.
    Data(Value),
    Error(SubscriptionError),
    /// The server finished the operation.
    Complete,
}

/// Receiving end is owned by whoever opened the subscription.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Failure delivered asynchronously to a subscription.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("GraphQL errors: {}", join_errors(.0))]
    Graphql(Vec<GraphqlError>),
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("transport closed")]
    Closed,
}

/// Connection setup error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("connection rejected by server: {0}")]
    Rejected(Value),
    #[error("unexpected frame during handshake: {0}")]
    Protocol(String),
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
}

/// Seam between the subscription adapter and the connection it multiplexes over.
pub trait SubscriptionTransport: Send + Sync {
    /// Starts one operation. Events go to `sink` until the operation ends or is stopped.
    fn open(&self, request: OperationPayload, sink: EventSink) -> OperationId;

    /// Stops one operation. Unknown or finished ids are ignored.
    fn stop(&self, id: OperationId);

    /// Tears down the connection and every operation on it. Repeat calls are no-ops.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: String,
    /// Sent as the `connection_init` payload.
    pub connection_params: Option<Value>,
    pub reconnect: bool,
    /// `None` retries forever.
    pub reconnect_attempts: Option<u32>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Once the server has sent a `ka`, silence longer than this drops the
    /// connection. `None` disables the check.
    pub keep_alive_timeout: Option<Duration>,
}

impl TransportOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_params: None,
            reconnect: true,
            reconnect_attempts: None,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            keep_alive_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// 8base maps the connection to a workspace through `workspaceId` in the
    /// connection params; without it every subscription is rejected.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let section = &config.subscriptions;
        let mut options = Self::new(config.ws_url()?);
        options.connection_params = Some(serde_json::json!({
            "workspaceId": config.workspace_id()?,
        }));
        options.reconnect = section.reconnect;
        options.reconnect_attempts = section.reconnect_attempts;
        options.reconnect_delay = section.reconnect_delay();
        options.max_reconnect_delay = section.max_reconnect_delay();
        options.connect_timeout = section.connect_timeout();
        options.keep_alive_timeout = section.keep_alive_timeout();
        Ok(options)
    }

    /// Exponential backoff, capped at `max_reconnect_delay`.
    fn backoff(&self, attempt: u32) -> Duration {
        self.reconnect_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_reconnect_delay)
    }
}

enum Command {
    Start {
        id: OperationId,
        request: OperationPayload,
        sink: EventSink,
    },
    Stop {
        id: OperationId,
    },
    Close,
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    terminated: watch::Receiver<()>,
}

/// Handle to a connected `graphql-ws` client. Clones share the connection.
#[derive(Clone)]
pub struct TransportClient {
    shared: Arc<Shared>,
}

impl TransportClient {
    /// Opens the socket, performs the `connection_init` / `connection_ack`
    /// handshake and starts the connection task.
    pub async fn connect(options: TransportOptions) -> Result<Self, TransportError> {
        let socket = handshake(&options).await?;
        info!(url = %options.url, "subscription transport connected");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated) = watch::channel(());
        let closed = Arc::new(AtomicBool::new(false));
        let connection = Connection {
            options,
            operations: BTreeMap::new(),
            keep_alive_deadline: None,
            commands: command_rx,
            closed: closed.clone(),
            _terminated: terminated_tx,
        };
        tokio::spawn(connection.run(socket));

        Ok(Self {
            shared: Arc::new(Shared {
                commands,
                next_id: AtomicU64::new(1),
                closed,
                terminated,
            }),
        })
    }

    /// Resolves once the connection task has exited (after `close` or when
    /// reconnection gave up).
    pub async fn terminated(&self) {
        let mut terminated = self.shared.terminated.clone();
        while terminated.changed().await.is_ok() {}
    }
}

impl SubscriptionTransport for TransportClient {
    fn open(&self, request: OperationPayload, sink: EventSink) -> OperationId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            let _ = sink.send(TransportEvent::Error(SubscriptionError::Closed));
            return id;
        }
        if let Err(mpsc::error::SendError(Command::Start { sink, .. })) =
            self.shared.commands.send(Command::Start { id, request, sink })
        {
            let _ = sink.send(TransportEvent::Error(SubscriptionError::Closed));
        }
        id
    }

    fn stop(&self, id: OperationId) {
        let _ = self.shared.commands.send(Command::Stop { id });
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shared.commands.send(Command::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

struct Operation {
    request: OperationPayload,
    sink: EventSink,
}

enum Exit {
    Closed,
    Disconnected(String),
}

enum Reconnect {
    Connected(WsStream),
    Closed,
    GaveUp,
}

/// Owns the socket and the operation table. Runs until closed or until
/// reconnection gives up.
struct Connection {
    options: TransportOptions,
    operations: BTreeMap<OperationId, Operation>,
    keep_alive_deadline: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    closed: Arc<AtomicBool>,
    // Dropped on exit, which wakes `TransportClient::terminated`.
    _terminated: watch::Sender<()>,
}

impl Connection {
    async fn run(mut self, mut socket: WsStream) {
        loop {
            match self.serve(&mut socket).await {
                Exit::Closed => {
                    terminate(socket).await;
                    info!("subscription transport closed");
                    self.shut_down(None);
                    return;
                }
                Exit::Disconnected(reason) => {
                    warn!(%reason, "subscription connection lost");
                    match self.reconnect().await {
                        Reconnect::Connected(next) => socket = next,
                        Reconnect::Closed => {
                            info!("subscription transport closed while reconnecting");
                            self.shut_down(None);
                            return;
                        }
                        Reconnect::GaveUp => {
                            self.shut_down(Some(reason));
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn serve(&mut self, socket: &mut WsStream) -> Exit {
        self.keep_alive_deadline = None;
        loop {
            let deadline = self.keep_alive_deadline;
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Exit::Closed;
                    };
                    match command {
                        Command::Start { id, request, sink } => {
                            let operation = self
                                .operations
                                .entry(id)
                                .or_insert(Operation { request, sink });
                            let frame = ClientMessage::Start {
                                id: id.to_string(),
                                payload: &operation.request,
                            };
                            if let Err(e) = send_frame(socket, &frame).await {
                                return Exit::Disconnected(e.to_string());
                            }
                        }
                        Command::Stop { id } => {
                            if self.operations.remove(&id).is_some() {
                                debug!(id, "stopping operation");
                                let frame = ClientMessage::Stop { id: id.to_string() };
                                if let Err(e) = send_frame(socket, &frame).await {
                                    return Exit::Disconnected(e.to_string());
                                }
                            }
                        }
                        Command::Close => return Exit::Closed,
                    }
                }
                message = socket.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(reason) = self.dispatch(&text) {
                                return Exit::Disconnected(reason);
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| {
                                    format!("closed by server: {} {}", u16::from(f.code), f.reason)
                                })
                                .unwrap_or_else(|| "closed by server".into());
                            return Exit::Disconnected(reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Exit::Disconnected(e.to_string()),
                        None => return Exit::Disconnected("connection closed".into()),
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    return Exit::Disconnected("keep-alive timed out".into());
                }
            }
        }
    }

    /// Routes one server frame. `Err` means the connection must be dropped.
    fn dispatch(&mut self, text: &str) -> Result<(), String> {
        let message = match ServerMessage::from_text(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable frame");
                return Ok(());
            }
        };
        match message {
            ServerMessage::Data { id, payload } => {
                if let Some(operation) = parse_id(&id).and_then(|id| self.operations.get(&id)) {
                    let _ = operation.sink.send(TransportEvent::Data(payload));
                }
            }
            ServerMessage::Error { id, errors } => {
                if let Some(operation) = parse_id(&id).and_then(|id| self.operations.remove(&id)) {
                    let _ = operation
                        .sink
                        .send(TransportEvent::Error(SubscriptionError::Graphql(errors)));
                }
            }
            ServerMessage::Complete { id } => {
                if let Some(operation) = parse_id(&id).and_then(|id| self.operations.remove(&id)) {
                    let _ = operation.sink.send(TransportEvent::Complete);
                }
            }
            ServerMessage::KeepAlive => {
                self.keep_alive_deadline = self
                    .options
                    .keep_alive_timeout
                    .map(|timeout| Instant::now() + timeout);
            }
            ServerMessage::ConnectionAck => {}
            ServerMessage::ConnectionError(payload) => {
                return Err(format!("connection error: {payload}"));
            }
        }
        Ok(())
    }

    /// Commands arriving during backoff are applied to the operation table so
    /// the restart after reconnecting reflects them.
    async fn reconnect(&mut self) -> Reconnect {
        if !self.options.reconnect {
            return Reconnect::GaveUp;
        }
        let mut attempt = 0u32;
        loop {
            if let Some(max) = self.options.reconnect_attempts {
                if attempt >= max {
                    warn!(attempts = attempt, "giving up on reconnecting");
                    return Reconnect::GaveUp;
                }
            }
            let delay = self.options.backoff(attempt);
            attempt += 1;
            debug!(attempt, ?delay, "reconnecting");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        None | Some(Command::Close) => return Reconnect::Closed,
                        Some(Command::Start { id, request, sink }) => {
                            self.operations.insert(id, Operation { request, sink });
                        }
                        Some(Command::Stop { id }) => {
                            self.operations.remove(&id);
                        }
                    },
                }
            }

            match handshake(&self.options).await {
                Ok(mut socket) => match self.restart_operations(&mut socket).await {
                    Ok(()) => {
                        info!(attempt, operations = self.operations.len(), "reconnected");
                        return Reconnect::Connected(socket);
                    }
                    Err(e) => warn!(attempt, error = %e, "failed to restart operations"),
                },
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
    }

    async fn restart_operations(&self, socket: &mut WsStream) -> Result<(), TransportError> {
        for (id, operation) in &self.operations {
            let frame = ClientMessage::Start {
                id: id.to_string(),
                payload: &operation.request,
            };
            send_frame(socket, &frame).await?;
        }
        Ok(())
    }

    /// Marks the client closed and releases every sink. With a `reason`, each
    /// live operation is told the connection was lost; otherwise sinks are
    /// dropped silently. Commands still queued are answered with `Closed`.
    fn shut_down(&mut self, reason: Option<String>) {
        self.closed.store(true, Ordering::SeqCst);
        let operations = std::mem::take(&mut self.operations);
        if let Some(reason) = reason {
            for operation in operations.into_values() {
                let _ = operation.sink.send(TransportEvent::Error(
                    SubscriptionError::Disconnected(reason.clone()),
                ));
            }
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Start { sink, .. } = command {
                let _ = sink.send(TransportEvent::Error(SubscriptionError::Closed));
            }
        }
    }
}

fn parse_id(id: &str) -> Option<OperationId> {
    id.parse().ok()
}

async fn send_frame(
    socket: &mut WsStream,
    frame: &ClientMessage<'_>,
) -> Result<(), TransportError> {
    let text = frame.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

/// Connects with the `graphql-ws` subprotocol and waits for `connection_ack`.
async fn handshake(options: &TransportOptions) -> Result<WsStream, TransportError> {
    let mut request = options.url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

    let (mut socket, _) = tokio::time::timeout(
        options.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| TransportError::Timeout("connecting"))??;

    let init = ClientMessage::ConnectionInit {
        payload: options.connection_params.as_ref(),
    };
    send_frame(&mut socket, &init).await?;

    tokio::time::timeout(options.ack_timeout, await_ack(&mut socket))
        .await
        .map_err(|_| TransportError::Timeout("waiting for connection_ack"))??;
    Ok(socket)
}

async fn await_ack(socket: &mut WsStream) -> Result<(), TransportError> {
    while let Some(message) = socket.next().await {
        let text = match message? {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        match ServerMessage::from_text(&text) {
            Ok(ServerMessage::ConnectionAck) => return Ok(()),
            Ok(ServerMessage::KeepAlive) => continue,
            Ok(ServerMessage::ConnectionError(payload)) => {
                return Err(TransportError::Rejected(payload))
            }
            Ok(other) => return Err(TransportError::Protocol(format!("{other:?}"))),
            Err(e) => return Err(TransportError::Protocol(e.to_string())),
        }
    }
    Err(TransportError::ClosedDuringHandshake)
}

/// Best-effort `connection_terminate` followed by a close frame.
async fn terminate(mut socket: WsStream) {
    if let Err(e) = send_frame(&mut socket, &ClientMessage::ConnectionTerminate).await {
        debug!(error = %e, "connection_terminate not sent");
    }
    let _ = socket.close(None).await;
}
