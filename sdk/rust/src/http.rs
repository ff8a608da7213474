//! HTTP server: GraphQL over HTTP plus the WebSocket upgrade.
//!
//! Routes:
//! - `POST {path}` - JSON or `application/graphql` body
//! - `GET {path}` - query string parameters, or a WebSocket upgrade
//! - `GET /health` - health check

use crate::api::GraphQLApi;
use crate::config::ServerConfig;
use crate::error::{ErrorCode, SdkError, SdkResult};
use crate::websocket::{self, Protocol};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use quill_runtime::{Request as GraphQLRequest, Response as GraphQLResponse};
use quill_syntax::OperationType;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::{debug, error, info};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn with_status(status: StatusCode, body: BoxBody) -> Response<BoxBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &GraphQLResponse) -> Response<BoxBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = with_status(status, full(bytes));
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            response
        }
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            with_status(StatusCode::INTERNAL_SERVER_ERROR, full(""))
        }
    }
}

fn error_response(status: StatusCode, error: &SdkError) -> Response<BoxBody> {
    json_response(status, &GraphQLResponse::from_errors(vec![error.to_graphql()]))
}

fn bad_request(message: impl Into<String>) -> Response<BoxBody> {
    error_response(StatusCode::BAD_REQUEST, &SdkError::bad_request(message))
}

fn payload_too_large(limit: usize) -> Response<BoxBody> {
    error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        &SdkError::new(
            ErrorCode::PayloadTooLarge,
            format!("Request body exceeds {limit} bytes"),
        ),
    )
}

fn method_not_allowed(message: &str) -> Response<BoxBody> {
    let mut response = error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &SdkError::new(ErrorCode::MethodNotAllowed, message),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, POST, OPTIONS"));
    response
}

fn health_response() -> Response<BoxBody> {
    let mut response = with_status(StatusCode::OK, full(r#"{"status":"ok"}"#));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn preflight_response() -> Response<BoxBody> {
    let mut response = with_status(StatusCode::NO_CONTENT, full(""));
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

/// Query string of a `GET` request. `variables` and `extensions` are JSON.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetParams {
    query: Option<String>,
    operation_name: Option<String>,
    variables: Option<String>,
    extensions: Option<String>,
}

fn decode_json_object(
    name: &str,
    raw: Option<&str>,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(serde_json::Value::Object(map)) => Ok(Some(map)),
            Ok(serde_json::Value::Null) => Ok(None),
            Ok(_) => Err(format!("\"{name}\" must be a JSON object.")),
            Err(e) => Err(format!("\"{name}\" is not valid JSON: {e}")),
        },
    }
}

pub(crate) fn request_from_query(query: Option<&str>) -> Result<GraphQLRequest, String> {
    let params: GetParams =
        serde_urlencoded::from_str(query.unwrap_or("")).map_err(|e| e.to_string())?;
    let Some(text) = params.query.filter(|q| !q.trim().is_empty()) else {
        return Err("Must provide query string.".to_string());
    };
    Ok(GraphQLRequest {
        query: text,
        operation_name: params.operation_name.filter(|n| !n.is_empty()),
        variables: decode_json_object("variables", params.variables.as_deref())?,
        extensions: decode_json_object("extensions", params.extensions.as_deref())?,
    })
}

pub(crate) fn request_from_body(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<GraphQLRequest, String> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("application/graphql") => {
            let query = std::str::from_utf8(body).map_err(|e| format!("Body is not UTF-8: {e}"))?;
            Ok(GraphQLRequest::new(query))
        }
        None | Some("application/json") => {
            let request: GraphQLRequest =
                serde_json::from_slice(body).map_err(|e| format!("Invalid JSON body: {e}"))?;
            if request.query.trim().is_empty() {
                return Err("Must provide query string.".to_string());
            }
            Ok(request)
        }
        Some(other) => Err(format!("Unsupported content type \"{other}\".")),
    }
}

async fn execute(api: &GraphQLApi, request: GraphQLRequest, method: &Method) -> Response<BoxBody> {
    debug!(
        "Executing query: {}",
        request.query.chars().take(100).collect::<String>()
    );
    let ctx = api.new_context();
    let operation = match api.executor().prepare(&request) {
        Ok(operation) => operation,
        Err(error) => {
            debug!(%error, "request rejected");
            return json_response(
                StatusCode::OK,
                &GraphQLResponse::from_errors(error.into_errors()),
            );
        }
    };

    let result = match operation.operation_type() {
        OperationType::Mutation if *method == Method::GET => {
            return method_not_allowed("Can only perform a mutation operation from a POST request.");
        }
        // Answered by the executor with an error response.
        OperationType::Subscription => api.execute(&request, &ctx).await,
        _ => api
            .executor()
            .execute_prepared(&ctx, &operation, None)
            .await
            .map_err(SdkError::from),
    };
    match result {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => {
            error!("Query execution error: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = header_str(headers, header::UPGRADE)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    let connection = header_str(headers, header::CONNECTION).is_some_and(|v| {
        v.split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    upgrade && connection
}

fn websocket_upgrade(api: &GraphQLApi, req: Request<Incoming>) -> Response<BoxBody> {
    let headers = req.headers();
    if header_str(headers, header::SEC_WEBSOCKET_VERSION) != Some("13") {
        return bad_request("Unsupported WebSocket version.");
    }
    let Some(key) = headers.get(header::SEC_WEBSOCKET_KEY) else {
        return bad_request("Missing Sec-WebSocket-Key header.");
    };
    let Some(protocol) =
        header_str(headers, header::SEC_WEBSOCKET_PROTOCOL).and_then(Protocol::negotiate)
    else {
        return bad_request("Missing or unsupported WebSocket subprotocol.");
    };
    let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) else {
        return bad_request("Invalid Sec-WebSocket-Key header.");
    };

    let api = api.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let stream = websocket::server_stream(TokioIo::new(upgraded)).await;
                api.serve_websocket(stream, protocol).await;
            }
            Err(e) => error!("WebSocket upgrade failed: {}", e),
        }
    });

    let mut response = with_status(StatusCode::SWITCHING_PROTOCOLS, full(""));
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(protocol.name()),
    );
    response
}

/// Where GraphQL is served and what a request may send.
struct Endpoint {
    path: String,
    max_body_size: usize,
}

async fn route(api: &GraphQLApi, endpoint: &Endpoint, req: Request<Incoming>) -> Response<BoxBody> {
    let method = req.method().clone();
    if req.uri().path() == "/health" && method == Method::GET {
        return health_response();
    }
    if req.uri().path() != endpoint.path {
        let mut response = with_status(StatusCode::NOT_FOUND, full(r#"{"error":"Not Found"}"#));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        return response;
    }

    match method {
        Method::GET if is_websocket_upgrade(req.headers()) => websocket_upgrade(api, req),
        Method::GET => match request_from_query(req.uri().query()) {
            Ok(request) => execute(api, request, &method).await,
            Err(message) => bad_request(message),
        },
        Method::POST => {
            let (parts, body) = req.into_parts();
            let body = match Limited::new(body, endpoint.max_body_size).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) if e.is::<LengthLimitError>() => {
                    return payload_too_large(endpoint.max_body_size)
                }
                Err(e) => return bad_request(format!("Failed to read body: {e}")),
            };
            let content_type = header_str(&parts.headers, header::CONTENT_TYPE);
            match request_from_body(content_type, &body) {
                Ok(request) => execute(api, request, &method).await,
                Err(message) => bad_request(message),
            }
        }
        Method::OPTIONS => preflight_response(),
        _ => method_not_allowed("GraphQL only supports GET and POST requests."),
    }
}

/// An HTTP server bound to a socket.
pub struct Server {
    api: GraphQLApi,
    listener: TcpListener,
    endpoint: Arc<Endpoint>,
}

impl Server {
    pub async fn bind(api: GraphQLApi, config: &ServerConfig) -> SdkResult<Self> {
        let addr = config
            .socket_addr()
            .map_err(|e| SdkError::new(ErrorCode::BindError, format!("Invalid address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SdkError::new(ErrorCode::BindError, format!("Failed to bind: {e}")))?;
        Ok(Self {
            api,
            listener,
            endpoint: Arc::new(Endpoint {
                path: config.path.clone(),
                max_body_size: config.max_body_size,
            }),
        })
    }

    pub fn local_addr(&self) -> SdkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until the process exits.
    pub async fn run(self) -> SdkResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes, then closes every WebSocket
    /// connection.
    pub async fn run_until<F>(self, shutdown: F) -> SdkResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!("Listening on http://{}{}", addr, self.endpoint.path);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => accepted?,
            };
            debug!(%peer, "accepted connection");

            let io = TokioIo::new(stream);
            let api = self.api.clone();
            let endpoint = Arc::clone(&self.endpoint);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let api = api.clone();
                    let endpoint = Arc::clone(&endpoint);
                    async move { Ok::<_, Infallible>(route(&api, &endpoint, req).await) }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    if !err.is_incomplete_message() {
                        error!("Connection error: {:?}", err);
                    }
                }
            });
        }

        self.api.shutdown().await;
        info!("Server stopped");
        Ok(())
    }
}

/// Binds `config`'s address and serves `api` until the process exits.
pub async fn serve(api: GraphQLApi, config: &ServerConfig) -> SdkResult<()> {
    Server::bind(api, config).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_from_query() {
        let request = request_from_query(Some(
            "query=%7Bfoo%7D&operationName=Q&variables=%7B%22a%22%3A1%7D",
        ))
        .unwrap();
        assert_eq!(request.query, "{foo}");
        assert_eq!(request.operation_name.as_deref(), Some("Q"));
        assert_eq!(request.variables.unwrap()["a"], json!(1));
    }

    #[test]
    fn test_request_from_query_errors() {
        assert_eq!(
            request_from_query(None).unwrap_err(),
            "Must provide query string."
        );
        assert!(request_from_query(Some("query={a}&variables=nope"))
            .unwrap_err()
            .contains("\"variables\" is not valid JSON"));
        assert!(request_from_query(Some("query={a}&variables=[1]"))
            .unwrap_err()
            .contains("must be a JSON object"));
    }

    #[test]
    fn test_request_from_body() {
        let json_request =
            request_from_body(Some("application/json; charset=utf-8"), br#"{"query":"{foo}"}"#)
                .unwrap();
        assert_eq!(json_request, GraphQLRequest::new("{foo}"));

        let raw = request_from_body(Some("application/graphql"), b"{ bar }").unwrap();
        assert_eq!(raw.query, "{ bar }");

        assert!(request_from_body(Some("application/json"), b"{")
            .unwrap_err()
            .starts_with("Invalid JSON body"));
        assert!(request_from_body(Some("text/plain"), b"{foo}")
            .unwrap_err()
            .contains("Unsupported content type"));
        assert!(request_from_body(None, br#"{"query":"  "}"#).is_err());
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!is_websocket_upgrade(&headers));
    }
}
