//! The per-connection state machine.
//!
//! A connection moves through four states: awaiting-init, initialized,
//! closing and closed. The read loop owns the operation map and runs the
//! handler callbacks; a write loop owns the socket's sink and is the only
//! consumer of the bounded outgoing queue. Each started operation runs on
//! its own task and reaches the client only through that queue.

use super::handler::{ConnectionHandler, Operation};
use super::protocol::{self, Inbound, Protocol, ServerMessage};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use quill_runtime::{Context, ExecutionError, Request};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingInit,
    Initialized,
    Closing,
    Closed,
}

struct Shared {
    id: u64,
    protocol: Protocol,
    state: Mutex<ConnectionState>,
    close: Mutex<Option<(CloseCode, String)>>,
    close_requested: CancellationToken,
    closed: CancellationToken,
    close_reported: AtomicBool,
}

impl Shared {
    /// Records the close code and wakes the read loop. The first request wins.
    fn request_close(&self, code: CloseCode, reason: impl Into<String>) {
        {
            let mut close = self.close.lock();
            if close.is_none() {
                *close = Some((code, reason.into()));
            }
        }
        self.close_requested.cancel();
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

/// A cloneable handle to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Starts the close handshake with `code`.
    pub fn close(&self, code: CloseCode, reason: &str) {
        self.shared.request_close(code, reason);
    }

    /// Waits until the connection has fully closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("protocol", &self.shared.protocol)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// One WebSocket connection speaking a GraphQL subprotocol.
pub struct Connection<H> {
    shared: Arc<Shared>,
    handler: Arc<H>,
    config: ConnectionConfig,
}

impl<H: ConnectionHandler> Connection<H> {
    pub fn new(protocol: Protocol, handler: Arc<H>, config: ConnectionConfig) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            protocol,
            state: Mutex::new(ConnectionState::AwaitingInit),
            close: Mutex::new(None),
            close_requested: CancellationToken::new(),
            closed: CancellationToken::new(),
            close_reported: AtomicBool::new(false),
        });
        Self {
            shared,
            handler,
            config,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Services `stream` until the connection has closed.
    pub async fn serve<S>(self, stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            shared,
            handler,
            config,
        } = self;
        tracing::info!(id = shared.id, protocol = %shared.protocol, "websocket connection opened");

        let (sink, mut source) = stream.split();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            close_rx,
            config.clone(),
            Arc::clone(&shared),
            Arc::clone(&handler),
        ));

        let operations = CancellationToken::new();
        // Dropping this future mid-connection still stops every operation.
        let _operations = operations.clone().drop_guard();
        let _closed = shared.closed.clone().drop_guard();
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            protocol: shared.protocol,
            shared,
            handler,
            config,
            outgoing: Outgoing {
                tx,
                closing: operations.clone(),
            },
            operations,
            ctx: None,
            ops: FxHashMap::default(),
            finished: finished_tx,
            serial: 0,
        };

        let read_end = session.read_loop(&mut source, &mut finished_rx).await;
        session.close(source, writer, close_tx, read_end).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    /// A close was requested while the peer was still connected.
    Open,
    /// The peer sent its close frame.
    PeerClosed,
    /// The transport is gone.
    Gone,
}

/// The producer side of the outgoing queue.
#[derive(Clone)]
struct Outgoing {
    tx: mpsc::Sender<Message>,
    /// Cancelled once the connection starts closing.
    closing: CancellationToken,
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match message.to_json() {
        Ok(text) => Some(Message::text(text)),
        Err(error) => {
            tracing::error!(%error, "failed to serialize server message");
            None
        }
    }
}

impl Outgoing {
    /// Waits for queue space unless `cancel` fires first.
    async fn reserve(&self, cancel: &CancellationToken) -> Option<mpsc::Permit<'_, Message>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = self.tx.reserve() => permit.ok(),
        }
    }

    /// Returns false if the frame was not queued.
    async fn enqueue(&self, message: &ServerMessage, cancel: &CancellationToken) -> bool {
        let Some(message) = encode(message) else {
            return false;
        };
        match self.reserve(cancel).await {
            Some(permit) => {
                permit.send(message);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Running,
    /// The client stopped the operation and the read loop sent `complete`.
    Stopped,
    /// The driver sent `complete`.
    Completed,
}

/// An operation's view of the outgoing queue. Frames are queued under the
/// progress lock, so nothing from a stopped operation can follow the
/// `complete` the read loop sends for it.
#[derive(Clone)]
struct Lane {
    outgoing: Outgoing,
    progress: Arc<Mutex<Progress>>,
}

impl Lane {
    async fn emit(&self, message: &ServerMessage, cancel: &CancellationToken) -> bool {
        self.emit_then(message, cancel, Progress::Running).await
    }

    async fn emit_then(
        &self,
        message: &ServerMessage,
        cancel: &CancellationToken,
        next: Progress,
    ) -> bool {
        if *self.progress.lock() != Progress::Running {
            return false;
        }
        let Some(message) = encode(message) else {
            return false;
        };
        let Some(permit) = self.outgoing.reserve(cancel).await else {
            return false;
        };
        let mut progress = self.progress.lock();
        if *progress != Progress::Running {
            return false;
        }
        permit.send(message);
        *progress = next;
        true
    }
}

struct OperationEntry {
    serial: u64,
    ctx: Context,
    progress: Arc<Mutex<Progress>>,
    task: JoinHandle<()>,
}

struct Session<H> {
    shared: Arc<Shared>,
    handler: Arc<H>,
    config: ConnectionConfig,
    protocol: Protocol,
    outgoing: Outgoing,
    /// Parent of every operation's cancellation.
    operations: CancellationToken,
    ctx: Option<Context>,
    ops: FxHashMap<String, OperationEntry>,
    finished: mpsc::UnboundedSender<(String, u64)>,
    serial: u64,
}

impl<H: ConnectionHandler> Session<H> {
    async fn read_loop<S>(
        &mut self,
        source: &mut SplitStream<WebSocketStream<S>>,
        finished: &mut mpsc::UnboundedReceiver<(String, u64)>,
    ) -> ReadEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let period = self.config.keep_alive;
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let close_requested = self.shared.close_requested.clone();

        loop {
            let initialized = self.shared.state() == ConnectionState::Initialized;
            tokio::select! {
                biased;
                () = close_requested.cancelled() => return ReadEnd::Open,
                Some((id, serial)) = finished.recv() => self.forget(&id, serial),
                _ = keep_alive.tick(), if initialized => {
                    self.send(&self.protocol.keep_alive()).await;
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => self.on_malformed(ConnectionError::Binary),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code, f.reason.as_str().to_string()))
                            .unwrap_or((CloseCode::Normal, String::new()));
                        tracing::debug!(id = self.shared.id, %code, "peer closed");
                        self.shared.request_close(code, reason);
                        return ReadEnd::PeerClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        self.handler.log_error(&ConnectionError::WebSocket(error));
                        self.shared.request_close(CloseCode::Abnormal, "");
                        return ReadEnd::Gone;
                    }
                    None => {
                        self.shared.request_close(CloseCode::Abnormal, "");
                        return ReadEnd::Gone;
                    }
                },
            }
        }
    }

    async fn on_text(&mut self, text: &str) {
        let message = match self.protocol.parse(text) {
            Ok(message) => message,
            Err(error) => return self.on_malformed(ConnectionError::Malformed(error)),
        };
        tracing::debug!(id = self.shared.id, ?message, "received");

        let initialized = self.shared.state() == ConnectionState::Initialized;
        match message {
            Inbound::Init(payload) => self.on_init(payload).await,
            Inbound::Start { id, request } if initialized => self.on_start(id, request).await,
            Inbound::Stop { id } if initialized => self.on_stop(&id).await,
            // Operations before the handshake completes are ignored.
            Inbound::Start { .. } | Inbound::Stop { .. } => {}
            Inbound::Terminate => self.shared.request_close(CloseCode::Normal, ""),
            Inbound::Ping(_) => self.send(&ServerMessage::Pong { payload: None }).await,
            Inbound::Pong => {}
        }
    }

    /// The legacy protocol ignores bad frames; the current one closes.
    fn on_malformed(&self, error: ConnectionError) {
        self.handler.log_error(&error);
        if self.protocol == Protocol::GraphqlTransportWs {
            self.shared.request_close(
                CloseCode::from(protocol::CLOSE_BAD_REQUEST),
                "Invalid message received",
            );
        }
    }

    async fn on_init(&mut self, payload: Option<Value>) {
        if self.shared.state() != ConnectionState::AwaitingInit {
            let error = ConnectionError::DuplicateInit;
            self.handler.log_error(&error);
            if self.protocol == Protocol::GraphqlTransportWs {
                self.shared.request_close(
                    CloseCode::from(protocol::CLOSE_TOO_MANY_INITS),
                    "Too many initialisation requests",
                );
            }
            return;
        }

        match self.handler.handle_init(payload).await {
            Ok(ctx) => {
                self.ctx = Some(ctx.with_cancellation(self.operations.child_token()));
                self.shared.set_state(ConnectionState::Initialized);
                self.send(&ServerMessage::ConnectionAck).await;
                if self.protocol == Protocol::GraphqlWs {
                    self.send(&ServerMessage::KeepAlive).await;
                }
            }
            Err(error) => {
                self.handler
                    .log_error(&ConnectionError::InitRejected(error.message.clone()));
                self.send(&self.protocol.init_error(&error.message)).await;
                self.shared
                    .request_close(self.protocol.init_rejected_code(), error.message);
            }
        }
    }

    async fn on_start(&mut self, id: String, request: Request) {
        let live = self
            .ops
            .get(&id)
            .is_some_and(|op| *op.progress.lock() == Progress::Running && !op.task.is_finished());
        if live {
            if self.protocol == Protocol::GraphqlTransportWs {
                self.shared.request_close(
                    CloseCode::from(protocol::CLOSE_DUPLICATE_ID),
                    format!("Subscriber for {id} already exists"),
                );
            }
            self.handler.log_error(&ConnectionError::DuplicateId(id));
            return;
        }

        let Some(parent) = &self.ctx else {
            return;
        };
        let ctx = parent.child();
        match self.handler.handle_start(&id, request, ctx.clone()).await {
            Ok(operation) => {
                self.serial += 1;
                let progress = Arc::new(Mutex::new(Progress::Running));
                let driver = Driver {
                    id: id.clone(),
                    serial: self.serial,
                    protocol: self.protocol,
                    lane: Lane {
                        outgoing: self.outgoing.clone(),
                        progress: Arc::clone(&progress),
                    },
                    finished: self.finished.clone(),
                };
                let shared = Arc::clone(&self.shared);
                let run = AssertUnwindSafe(driver.run(operation, ctx.clone()));
                let task = tokio::spawn(async move {
                    if run.catch_unwind().await.is_err() {
                        tracing::error!(id = shared.id, "operation panicked");
                        shared.request_close(CloseCode::Error, "internal server error");
                    }
                });
                self.ops.insert(
                    id,
                    OperationEntry {
                        serial: self.serial,
                        ctx,
                        progress,
                        task,
                    },
                );
            }
            Err(errors) => {
                self.send(&self.protocol.operation_error(&id, errors)).await;
            }
        }
    }

    /// Cancels the operation and sends `complete` unless its driver already
    /// did. The id is free for reuse once this returns.
    async fn on_stop(&mut self, id: &str) {
        let Some(mut op) = self.ops.remove(id) else {
            return;
        };
        let running = {
            let mut progress = op.progress.lock();
            let running = *progress == Progress::Running;
            *progress = Progress::Stopped;
            running
        };
        op.ctx.cancel();
        // The source is stopped before the client hears `complete`.
        if timeout(self.config.drain_timeout, &mut op.task).await.is_err() {
            tracing::debug!(id = self.shared.id, operation = id, "operation outlived its stop");
        }
        self.handler.handle_stop(id);
        if running {
            self.send(&ServerMessage::complete(id)).await;
        }
    }

    fn forget(&mut self, id: &str, serial: u64) {
        if self.ops.get(id).is_some_and(|op| op.serial == serial) {
            self.ops.remove(id);
        }
    }

    async fn send(&self, message: &ServerMessage) {
        self.outgoing
            .enqueue(message, &self.shared.close_requested)
            .await;
    }

    /// The close handshake. Runs once, after the read loop has returned.
    async fn close<S>(
        mut self,
        mut source: SplitStream<WebSocketStream<S>>,
        writer: JoinHandle<SplitSink<WebSocketStream<S>, Message>>,
        close_tx: oneshot::Sender<Option<CloseFrame>>,
        read_end: ReadEnd,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.shared.set_state(ConnectionState::Closing);
        let (code, reason) = self
            .shared
            .close
            .lock()
            .clone()
            .unwrap_or((CloseCode::Normal, String::new()));
        tracing::debug!(id = self.shared.id, %code, ?read_end, "closing");

        self.handler.cancel();
        self.operations.cancel();
        let tasks: Vec<_> = self.ops.drain().map(|(_, op)| op.task).collect();

        let frame = (read_end != ReadEnd::Gone).then(|| CloseFrame {
            code,
            reason: protocol::close_reason(&reason).to_string().into(),
        });
        let _ = close_tx.send(frame);
        let sink = writer.await.ok();

        if read_end == ReadEnd::Open {
            let wait = async {
                while let Some(frame) = source.next().await {
                    if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                        break;
                    }
                }
            };
            if timeout(self.config.close_timeout, wait).await.is_err() {
                tracing::debug!(id = self.shared.id, "peer did not answer close");
            }
        }
        drop(sink);
        drop(source);

        // Cancelled drivers finish promptly; their sources are stopped by then.
        if timeout(self.config.drain_timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::debug!(id = self.shared.id, "operations still running after close");
        }

        self.shared.set_state(ConnectionState::Closed);
        if !self.shared.close_reported.swap(true, Ordering::SeqCst) {
            self.handler.handle_close(code);
        }
        tracing::info!(id = self.shared.id, %code, "websocket connection closed");
        self.shared.closed.cancel();
    }
}

/// Runs one operation and reports its results through its lane.
struct Driver {
    id: String,
    serial: u64,
    protocol: Protocol,
    lane: Lane,
    finished: mpsc::UnboundedSender<(String, u64)>,
}

impl Driver {
    async fn run(self, operation: Operation, ctx: Context) {
        let cancel = ctx.cancellation().clone();
        match operation {
            Operation::Single(response) => {
                let response = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    response = response => Some(response),
                };
                if let Some(response) = response {
                    self.lane
                        .emit(&self.protocol.data(&self.id, response), &cancel)
                        .await;
                }
            }
            Operation::Stream(subscription) => {
                let result = subscription
                    .run(|response| {
                        let message = self.protocol.data(&self.id, response);
                        let lane = self.lane.clone();
                        let cancel = cancel.clone();
                        async move {
                            if lane.emit(&message, &cancel).await {
                                ControlFlow::Continue(())
                            } else {
                                ControlFlow::Break(())
                            }
                        }
                    })
                    .await;
                match result {
                    Ok(()) | Err(ExecutionError::Cancelled) => {}
                    Err(error) => {
                        let message = self.protocol.operation_error(&self.id, error.into_errors());
                        self.lane.emit(&message, &cancel).await;
                    }
                }
            }
        }

        let closing = &self.lane.outgoing.closing;
        if !closing.is_cancelled() {
            self.lane
                .emit_then(&ServerMessage::complete(&self.id), closing, Progress::Completed)
                .await;
        }
        let _ = self.finished.send((self.id, self.serial));
    }
}

/// Sole writer of the socket. Stops at the close frame, so nothing queued
/// after it is ever written.
async fn write_loop<S, H>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    mut close_rx: oneshot::Receiver<Option<CloseFrame>>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    handler: Arc<H>,
) -> SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: ConnectionHandler,
{
    loop {
        tokio::select! {
            biased;
            frame = &mut close_rx => {
                drain(&mut sink, &mut rx, &config).await;
                if let Ok(Some(frame)) = frame {
                    match timeout(config.drain_timeout, sink.send(Message::Close(Some(frame)))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => tracing::debug!(%error, "close frame not sent"),
                        Err(_) => tracing::debug!("close frame timed out"),
                    }
                }
                return sink;
            }
            message = rx.recv() => {
                let Some(message) = message else {
                    let _ = close_rx.await;
                    return sink;
                };
                let error = match timeout(config.write_timeout, sink.send(message)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(error)) => ConnectionError::WebSocket(error),
                    Err(_) => ConnectionError::WriteTimeout,
                };
                handler.log_error(&error);
                shared.request_close(CloseCode::Abnormal, "");
                // The socket is unusable; wait for the read loop to finish.
                rx.close();
                let _ = close_rx.await;
                return sink;
            }
        }
    }
}

/// Flushes frames queued before the close, each within the drain timeout.
async fn drain<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    rx: &mut mpsc::Receiver<Message>,
    config: &ConnectionConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    rx.close();
    while let Some(message) = rx.recv().await {
        match timeout(config.drain_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::debug!(%error, "dropping queued frames");
                break;
            }
            Err(_) => {
                tracing::debug!("queued frame timed out");
                break;
            }
        }
    }
}
