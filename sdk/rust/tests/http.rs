//! GraphQL over HTTP against a live server on an ephemeral port.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use quill_runtime::{FieldDef, ObjectDef, SchemaBuilder, TypeRef};
use quill_sdk::{GraphQLApi, Server, ServerConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig::new()).await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let schema = SchemaBuilder::new()
            .add_type(
                ObjectDef::new("Query")
                    .with_field(
                        FieldDef::new("foo", TypeRef::named("Boolean")).resolve_with(|_| Ok(json!(true))),
                    )
                    .with_field(
                        FieldDef::new("greeting", TypeRef::named("String"))
                            .resolve_with(|_| Ok(json!("hello"))),
                    ),
            )
            .add_type(ObjectDef::new("Mutation").with_field(
                FieldDef::new("touch", TypeRef::named("Int")).resolve_with(|_| Ok(json!(1))),
            ))
            .mutation_type("Mutation")
            .build()
            .unwrap();
        let config = config.host("127.0.0.1").port(0);
        let server = Server::bind(GraphQLApi::new(schema), &config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    async fn request(&self, request: Request<Full<Bytes>>) -> (StatusCode, hyper::HeaderMap, Bytes) {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(connection);
        let response = sender.send_request(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    async fn post(&self, content_type: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/graphql")
            .header("host", "localhost")
            .header("content-type", content_type)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let (status, _, body) = self.request(request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn get(&self, uri: &str) -> (StatusCode, hyper::HeaderMap, Bytes) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("host", "localhost")
            .body(Full::new(Bytes::new()))
            .unwrap();
        self.request(request).await
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap();
    }
}

#[tokio::test]
async fn test_post_json() {
    let server = TestServer::start().await;
    let (status, body) = server
        .post("application/json", r#"{"query":"{foo}"}"#)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": {"foo": true}}));
    server.stop().await;
}

#[tokio::test]
async fn test_post_json_with_operation_name() {
    let server = TestServer::start().await;
    let (status, body) = server
        .post(
            "application/json; charset=utf-8",
            r#"{"query":"query A { foo } query B { greeting }","operationName":"B"}"#,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": {"greeting": "hello"}}));
    server.stop().await;
}

#[tokio::test]
async fn test_post_graphql_body() {
    let server = TestServer::start().await;
    let (status, body) = server.post("application/graphql", "{ greeting }").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": {"greeting": "hello"}}));
    server.stop().await;
}

#[tokio::test]
async fn test_get_query_string() {
    let server = TestServer::start().await;
    let (status, headers, body) = server.get("/graphql?query=%7Bfoo%7D").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "application/json");
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"data": {"foo": true}}));
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let server = TestServer::start().await;
    let (status, body) = server.post("application/json", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["extensions"]["code"], "BAD_REQUEST");
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let server = TestServer::start_with(ServerConfig::new().max_body_size(256)).await;

    let padding = " ".repeat(4096);
    let (status, body) = server
        .post("application/json", &format!(r#"{{"query":"{{foo}}"{padding}}}"#))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["errors"][0]["extensions"]["code"], "PAYLOAD_TOO_LARGE");

    // Bodies within the limit are unaffected.
    let (status, body) = server.post("application/json", r#"{"query":"{foo}"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": {"foo": true}}));
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_query_is_reported_with_ok_status() {
    let server = TestServer::start().await;
    let (status, body) = server.post("application/json", r#"{"query":"{ missing }"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("data").is_none());
    assert_eq!(
        body["errors"][0]["message"],
        "Cannot query field \"missing\" on type \"Query\"."
    );
    server.stop().await;
}

#[tokio::test]
async fn test_mutation() {
    let server = TestServer::start().await;
    let (status, body) = server
        .post("application/json", r#"{"query":"mutation { touch }"}"#)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"data": {"touch": 1}}));

    let (status, headers, _) = server.get("/graphql?query=mutation%7Btouch%7D").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(headers["allow"], "GET, POST, OPTIONS");
    server.stop().await;
}

#[tokio::test]
async fn test_unsupported_method() {
    let server = TestServer::start().await;
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/graphql")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = server.request(request).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    server.stop().await;
}

#[tokio::test]
async fn test_health_and_unknown_paths() {
    let server = TestServer::start().await;
    let (status, _, body) = server.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(br#"{"status":"ok"}"#));

    let (status, _, _) = server.get("/elsewhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    server.stop().await;
}

#[tokio::test]
async fn test_upgrade_without_subprotocol_is_rejected() {
    let server = TestServer::start().await;
    let request = Request::builder()
        .method(Method::GET)
        .uri("/graphql")
        .header("host", "localhost")
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = server.request(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    server.stop().await;
}
