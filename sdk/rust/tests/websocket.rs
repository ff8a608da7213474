//! Both GraphQL WebSocket protocols, driven over an in-memory pipe.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use quill_runtime::{
    Context, FieldDef, GraphQLError, ObjectDef, Request, Response, Schema, SchemaBuilder,
    SourceStream, TypeRef,
};
use quill_sdk::websocket::{self, CloseCode, Connection, ConnectionHandler, Operation, Protocol};
use quill_sdk::{ConnectionConfig, ConnectionState, GraphQLApi, SdkError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Client = WebSocketStream<DuplexStream>;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default, Clone)]
struct Fixture {
    stops: Arc<AtomicUsize>,
    senders: Arc<Mutex<Vec<mpsc::Sender<Value>>>>,
}

impl Fixture {
    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn schema(&self) -> Schema {
        let stops = self.stops.clone();
        let senders = self.senders.clone();
        SchemaBuilder::new()
            .add_type(ObjectDef::new("Query").with_field(
                FieldDef::new("hello", TypeRef::named("String")).resolve_with(|_| Ok(json!("world"))),
            ))
            .add_type(
                ObjectDef::new("Subscription")
                    // One event right away, then open until stopped.
                    .with_field(
                        FieldDef::new("time", TypeRef::non_null(TypeRef::named("Int")))
                            .subscribe_with(move |_| {
                                let (tx, rx) = mpsc::channel(8);
                                let _ = tx.try_send(json!(1));
                                senders.lock().push(tx);
                                let stops = stops.clone();
                                Ok(SourceStream::new(rx, move || {
                                    stops.fetch_add(1, Ordering::SeqCst);
                                }))
                            }),
                    )
                    // Closes before producing anything.
                    .with_field(FieldDef::new("empty", TypeRef::named("Int")).subscribe_with(|_| {
                        let (_tx, stream) = SourceStream::channel(1);
                        Ok(stream)
                    }))
                    // Never runs dry.
                    .with_field(FieldDef::new("ticks", TypeRef::named("Int")).subscribe_with(|_| {
                        Ok(SourceStream::from_stream(
                            futures::stream::iter(0u64..).map(|n| json!(n)),
                        ))
                    })),
            )
            .subscription_type("Subscription")
            .build()
            .unwrap()
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new()
        .keep_alive(Duration::from_secs(60))
        .close_timeout(Duration::from_millis(200))
}

async fn connect(api: &GraphQLApi, protocol: Protocol) -> (Client, JoinHandle<()>) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let api = api.clone();
    let server = tokio::spawn(async move {
        let stream = websocket::server_stream(server_io).await;
        api.serve_websocket(stream, protocol).await;
    });
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (client, server)
}

async fn send(client: &mut Client, message: Value) {
    client.send(Message::text(message.to_string())).await.unwrap();
}

/// The next text frame, failing on close.
async fn recv(client: &mut Client) -> Value {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Every text frame until the close frame, then the close frame.
async fn recv_until_close(client: &mut Client) -> (Vec<Value>, Option<CloseFrame>) {
    let mut frames = Vec::new();
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("connection ended without a close frame")
            .unwrap();
        match message {
            Message::Text(text) => frames.push(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(frame) => return (frames, frame),
            _ => {}
        }
    }
}

/// Reads until the stream ends, returning any text frames seen.
async fn drain(client: &mut Client) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Some(Ok(message))) = timeout(WAIT, client.next()).await {
        if let Message::Text(text) = message {
            frames.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    frames
}

async fn init(client: &mut Client, protocol: Protocol) {
    send(client, json!({"type": "connection_init"})).await;
    assert_eq!(recv(client).await, json!({"type": "connection_ack"}));
    if protocol == Protocol::GraphqlWs {
        assert_eq!(recv(client).await, json!({"type": "ka"}));
    }
}

fn start(protocol: Protocol, id: &str, query: &str) -> Value {
    let kind = match protocol {
        Protocol::GraphqlWs => "start",
        Protocol::GraphqlTransportWs => "subscribe",
    };
    json!({"id": id, "type": kind, "payload": {"query": query}})
}

fn stop(protocol: Protocol, id: &str) -> Value {
    let kind = match protocol {
        Protocol::GraphqlWs => "stop",
        Protocol::GraphqlTransportWs => "complete",
    };
    json!({"id": id, "type": kind})
}

fn data_type(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::GraphqlWs => "data",
        Protocol::GraphqlTransportWs => "next",
    }
}

async fn subscription_lifecycle(protocol: Protocol) {
    let fixture = Fixture::default();
    let api = GraphQLApi::builder(fixture.schema())
        .connection_config(config())
        .build();
    let (mut client, server) = connect(&api, protocol).await;

    init(&mut client, protocol).await;
    send(&mut client, start(protocol, "s", "subscription{time}")).await;
    assert_eq!(
        recv(&mut client).await,
        json!({"type": data_type(protocol), "id": "s", "payload": {"data": {"time": 1}}})
    );

    send(&mut client, stop(protocol, "s")).await;
    assert_eq!(recv(&mut client).await, json!({"type": "complete", "id": "s"}));
    assert_eq!(fixture.stops(), 1);
    assert_eq!(api.connection_count(), 1);

    client.close(None).await.unwrap();
    drain(&mut client).await;
    timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(api.connection_count(), 0);
    assert_eq!(fixture.stops(), 1);
}

#[tokio::test]
async fn test_subscription_lifecycle_graphql_ws() {
    subscription_lifecycle(Protocol::GraphqlWs).await;
}

#[tokio::test]
async fn test_subscription_lifecycle_graphql_transport_ws() {
    subscription_lifecycle(Protocol::GraphqlTransportWs).await;
}

fn guarded_api(fixture: &Fixture) -> GraphQLApi {
    GraphQLApi::builder(fixture.schema())
        .connection_config(config())
        .on_init(|payload, ctx| async move {
            match payload.as_ref().and_then(|p| p.get("token")) {
                Some(token) if token == "secret" => Ok(ctx),
                _ => Err(SdkError::forbidden("Forbidden: missing or invalid token")),
            }
        })
        .build()
}

#[tokio::test]
async fn test_rejected_init_closes_with_4403() {
    let api = guarded_api(&Fixture::default());
    let (mut client, server) = connect(&api, Protocol::GraphqlTransportWs).await;

    send(&mut client, json!({"type": "connection_init", "payload": {"token": "wrong"}})).await;
    let (frames, close) = recv_until_close(&mut client).await;
    assert_eq!(
        frames,
        vec![json!({"type": "error", "payload": [{"message": "Forbidden: missing or invalid token"}]})]
    );
    let close = close.unwrap();
    assert_eq!(close.code, CloseCode::Library(4403));
    assert_eq!(close.reason.as_str(), "Forbidden: missing or invalid token");

    drain(&mut client).await;
    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_init_legacy_sends_connection_error() {
    let api = guarded_api(&Fixture::default());
    let (mut client, server) = connect(&api, Protocol::GraphqlWs).await;

    send(&mut client, json!({"type": "connection_init"})).await;
    let (frames, close) = recv_until_close(&mut client).await;
    assert_eq!(
        frames,
        vec![json!({"type": "connection_error", "payload": {"message": "Forbidden: missing or invalid token"}})]
    );
    assert_eq!(close.unwrap().code, CloseCode::Normal);

    drain(&mut client).await;
    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_accepted_init_payload() {
    let api = guarded_api(&Fixture::default());
    let (mut client, _server) = connect(&api, Protocol::GraphqlTransportWs).await;
    send(&mut client, json!({"type": "connection_init", "payload": {"token": "secret"}})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "connection_ack"}));
}

#[tokio::test]
async fn test_operations_before_init_are_ignored() {
    let fixture = Fixture::default();
    let api = GraphQLApi::builder(fixture.schema())
        .connection_config(config())
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlTransportWs).await;

    send(&mut client, start(Protocol::GraphqlTransportWs, "early", "{hello}")).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;
    send(&mut client, start(Protocol::GraphqlTransportWs, "q", "{hello}")).await;
    assert_eq!(
        recv(&mut client).await,
        json!({"type": "next", "id": "q", "payload": {"data": {"hello": "world"}}})
    );
    assert_eq!(recv(&mut client).await, json!({"type": "complete", "id": "q"}));
}

#[tokio::test]
async fn test_duplicate_id_is_ignored_by_legacy_protocol() {
    let fixture = Fixture::default();
    let api = GraphQLApi::builder(fixture.schema())
        .connection_config(config())
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlWs).await;
    init(&mut client, Protocol::GraphqlWs).await;

    send(&mut client, start(Protocol::GraphqlWs, "s", "subscription{time}")).await;
    assert_eq!(recv(&mut client).await["type"], "data");
    send(&mut client, start(Protocol::GraphqlWs, "s", "subscription{time}")).await;
    send(&mut client, stop(Protocol::GraphqlWs, "s")).await;

    // The duplicate never produced a data frame of its own.
    assert_eq!(recv(&mut client).await, json!({"type": "complete", "id": "s"}));
    assert_eq!(fixture.senders.lock().len(), 1);
    assert_eq!(fixture.stops(), 1);
}

#[tokio::test]
async fn test_duplicate_id_closes_graphql_transport_ws() {
    let fixture = Fixture::default();
    let api = GraphQLApi::builder(fixture.schema())
        .connection_config(config())
        .build();
    let (mut client, server) = connect(&api, Protocol::GraphqlTransportWs).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;

    send(&mut client, start(Protocol::GraphqlTransportWs, "s", "subscription{time}")).await;
    assert_eq!(recv(&mut client).await["type"], "next");
    send(&mut client, start(Protocol::GraphqlTransportWs, "s", "subscription{time}")).await;

    let (_, close) = recv_until_close(&mut client).await;
    let close = close.unwrap();
    assert_eq!(close.code, CloseCode::Library(4409));
    assert_eq!(close.reason.as_str(), "Subscriber for s already exists");

    drain(&mut client).await;
    timeout(WAIT, server).await.unwrap().unwrap();
    // Closing the connection stopped the live subscription.
    assert_eq!(fixture.stops(), 1);
}

async fn stop_then_restart(protocol: Protocol) {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config())
        .build();
    let (mut client, _server) = connect(&api, protocol).await;
    init(&mut client, protocol).await;

    let first_tick = json!({"type": data_type(protocol), "id": "s", "payload": {"data": {"ticks": 0}}});
    send(&mut client, start(protocol, "s", "subscription{ticks}")).await;
    for _ in 0..50 {
        assert_eq!(recv(&mut client).await["type"], data_type(protocol));
        send(&mut client, stop(protocol, "s")).await;
        send(&mut client, start(protocol, "s", "subscription{ticks}")).await;

        // Frames queued by the stopped subscription, then its complete.
        loop {
            let frame = recv(&mut client).await;
            if frame == json!({"type": "complete", "id": "s"}) {
                break;
            }
            assert_eq!(frame["type"], data_type(protocol));
        }
        // The restarted subscription begins from its first event.
        assert_eq!(recv(&mut client).await, first_tick);
    }
}

#[tokio::test]
async fn test_stop_then_restart_same_id_graphql_transport_ws() {
    stop_then_restart(Protocol::GraphqlTransportWs).await;
}

#[tokio::test]
async fn test_stop_then_restart_same_id_graphql_ws() {
    stop_then_restart(Protocol::GraphqlWs).await;
}

#[tokio::test]
async fn test_stop_after_completion_sends_one_complete() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config())
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlTransportWs).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;

    for _ in 0..20 {
        send(&mut client, start(Protocol::GraphqlTransportWs, "q", "{hello}")).await;
        send(&mut client, stop(Protocol::GraphqlTransportWs, "q")).await;
        send(&mut client, json!({"type": "ping"})).await;

        let mut frames = Vec::new();
        loop {
            let frame = recv(&mut client).await;
            if frame == json!({"type": "pong"}) {
                break;
            }
            frames.push(frame);
        }
        // Whether the stop arrived before or after the result, there is
        // exactly one complete and it comes last.
        assert_eq!(frames.last(), Some(&json!({"type": "complete", "id": "q"})));
        assert_eq!(frames.iter().filter(|f| f["type"] == "complete").count(), 1);
    }
}

#[tokio::test]
async fn test_aborted_connection_is_unregistered() {
    let fixture = Fixture::default();
    let api = GraphQLApi::builder(fixture.schema())
        .connection_config(config())
        .build();
    let (mut client, server) = connect(&api, Protocol::GraphqlTransportWs).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;
    send(&mut client, start(Protocol::GraphqlTransportWs, "s", "subscription{time}")).await;
    assert_eq!(recv(&mut client).await["type"], "next");
    assert_eq!(api.connection_count(), 1);

    server.abort();
    assert!(server.await.unwrap_err().is_cancelled());
    assert_eq!(api.connection_count(), 0);

    // The live subscription is stopped too.
    timeout(WAIT, async {
        while fixture.stops() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_malformed_messages() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config())
        .build();

    let (mut legacy, _legacy_server) = connect(&api, Protocol::GraphqlWs).await;
    legacy.send(Message::text("{not json")).await.unwrap();
    send(&mut legacy, json!({"type": "ping"})).await;
    init(&mut legacy, Protocol::GraphqlWs).await;

    let (mut current, server) = connect(&api, Protocol::GraphqlTransportWs).await;
    current.send(Message::text("{not json")).await.unwrap();
    let (frames, close) = recv_until_close(&mut current).await;
    assert!(frames.is_empty());
    assert_eq!(close.unwrap().code, CloseCode::Library(4400));
    drain(&mut current).await;
    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_closed_before_any_event_completes() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config())
        .build();
    for protocol in [Protocol::GraphqlWs, Protocol::GraphqlTransportWs] {
        let (mut client, _server) = connect(&api, protocol).await;
        init(&mut client, protocol).await;
        send(&mut client, start(protocol, "e", "subscription{empty}")).await;
        assert_eq!(recv(&mut client).await, json!({"type": "complete", "id": "e"}));
    }
}

#[tokio::test]
async fn test_operation_errors_are_reported_per_id() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config())
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlTransportWs).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;

    send(&mut client, start(Protocol::GraphqlTransportWs, "bad", "{nope}")).await;
    let error = recv(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["id"], "bad");
    assert_eq!(
        error["payload"][0]["message"],
        "Cannot query field \"nope\" on type \"Query\"."
    );
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config())
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlTransportWs).await;
    send(&mut client, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn test_legacy_keep_alive() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config().keep_alive(Duration::from_millis(50)))
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlWs).await;
    init(&mut client, Protocol::GraphqlWs).await;
    assert_eq!(recv(&mut client).await, json!({"type": "ka"}));
    assert_eq!(recv(&mut client).await, json!({"type": "ka"}));
}

#[tokio::test]
async fn test_transport_ws_keep_alive_is_pong() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config().keep_alive(Duration::from_millis(50)))
        .build();
    let (mut client, _server) = connect(&api, Protocol::GraphqlTransportWs).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn test_no_frame_after_close_frame() {
    let api = GraphQLApi::builder(Fixture::default().schema())
        .connection_config(config().queue_capacity(4))
        .build();
    let (mut client, server) = connect(&api, Protocol::GraphqlTransportWs).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;
    send(&mut client, start(Protocol::GraphqlTransportWs, "t", "subscription{ticks}")).await;
    assert_eq!(recv(&mut client).await["type"], "next");

    let shutdown = tokio::spawn({
        let api = api.clone();
        async move { api.shutdown().await }
    });
    let (frames, close) = recv_until_close(&mut client).await;
    assert!(frames.iter().all(|f| f["type"] == "next"));
    assert_eq!(close.unwrap().code, CloseCode::Normal);

    let after = drain(&mut client).await;
    assert!(after.is_empty(), "frames after close: {after:?}");
    timeout(WAIT, shutdown).await.unwrap().unwrap();
    timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(api.connection_count(), 0);
}

#[derive(Default)]
struct Recorder {
    closes: AtomicUsize,
    cancels: AtomicUsize,
    stops: Mutex<Vec<String>>,
    codes: Mutex<Vec<CloseCode>>,
}

#[async_trait]
impl ConnectionHandler for Recorder {
    async fn handle_init(&self, _payload: Option<Value>) -> Result<Context, SdkError> {
        Ok(Context::new())
    }

    async fn handle_start(
        &self,
        _id: &str,
        request: Request,
        _ctx: Context,
    ) -> Result<Operation, Vec<GraphQLError>> {
        let query = request.query;
        Ok(Operation::Single(Box::pin(async move {
            Response::data(json!({ "echo": query }))
        })))
    }

    fn handle_stop(&self, id: &str) {
        self.stops.lock().push(id.to_string());
    }

    fn handle_close(&self, code: CloseCode) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.codes.lock().push(code);
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_handle_close_fires_exactly_once() {
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(Protocol::GraphqlWs, recorder.clone(), config());
    let handle = connection.handle();
    assert_eq!(handle.state(), ConnectionState::AwaitingInit);

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        connection.serve(websocket::server_stream(server_io).await).await;
    });
    let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    init(&mut client, Protocol::GraphqlWs).await;
    assert_eq!(handle.state(), ConnectionState::Initialized);
    send(&mut client, start(Protocol::GraphqlWs, "q", "{ x }")).await;
    assert_eq!(
        recv(&mut client).await,
        json!({"type": "data", "id": "q", "payload": {"data": {"echo": "{ x }"}}})
    );
    assert_eq!(recv(&mut client).await, json!({"type": "complete", "id": "q"}));

    // Concurrent close requests from both sides.
    handle.close(CloseCode::Normal, "bye");
    handle.close(CloseCode::Away, "again");
    send(&mut client, json!({"type": "connection_terminate"})).await;

    let (_, close) = recv_until_close(&mut client).await;
    let close = close.unwrap();
    assert_eq!(close.code, CloseCode::Normal);
    assert_eq!(close.reason.as_str(), "bye");
    drain(&mut client).await;
    timeout(WAIT, server).await.unwrap().unwrap();
    timeout(WAIT, handle.closed()).await.unwrap();

    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.codes.lock(), vec![CloseCode::Normal]);
}

#[tokio::test]
async fn test_handle_close_fires_once_when_peer_vanishes() {
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(Protocol::GraphqlTransportWs, recorder.clone(), config());
    let handle = connection.handle();
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        connection.serve(websocket::server_stream(server_io).await).await;
    });

    drop(client_io);
    timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert!(recorder.stops.lock().is_empty());
}

#[tokio::test]
async fn test_stop_of_unknown_id_is_ignored() {
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::new(Protocol::GraphqlTransportWs, recorder.clone(), config());
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        connection.serve(websocket::server_stream(server_io).await).await;
    });
    let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;

    // Stopping an unknown id is a no-op.
    send(&mut client, stop(Protocol::GraphqlTransportWs, "ghost")).await;
    send(&mut client, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
    assert!(recorder.stops.lock().is_empty());
}

struct Exploding;

#[async_trait]
impl ConnectionHandler for Exploding {
    async fn handle_init(&self, _payload: Option<Value>) -> Result<Context, SdkError> {
        Ok(Context::new())
    }

    async fn handle_start(
        &self,
        _id: &str,
        _request: Request,
        _ctx: Context,
    ) -> Result<Operation, Vec<GraphQLError>> {
        Ok(Operation::Single(Box::pin(async {
            if true {
                panic!("resolver exploded");
            }
            Response::default()
        })))
    }
}

#[tokio::test]
async fn test_panicking_operation_closes_with_internal_error() {
    let connection = Connection::new(Protocol::GraphqlTransportWs, Arc::new(Exploding), config());
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        connection.serve(websocket::server_stream(server_io).await).await;
    });
    let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    init(&mut client, Protocol::GraphqlTransportWs).await;

    send(&mut client, start(Protocol::GraphqlTransportWs, "boom", "{ x }")).await;
    let (frames, close) = recv_until_close(&mut client).await;
    assert!(frames.is_empty());
    let close = close.unwrap();
    assert_eq!(close.code, CloseCode::Error);
    assert_eq!(close.reason.as_str(), "internal server error");
    drain(&mut client).await;
    timeout(WAIT, server).await.unwrap().unwrap();
}
