//! Wire messages for the two GraphQL-over-WebSocket subprotocols.
//!
//! `graphql-ws` is the legacy subscriptions-transport-ws protocol;
//! `graphql-transport-ws` is its successor. Both frame JSON objects of the
//! form `{"id"?, "type", "payload"?}` in text messages.

use quill_runtime::{GraphQLError, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Subprotocol name of the legacy protocol.
pub const GRAPHQL_WS: &str = "graphql-ws";
/// Subprotocol name of the current protocol.
pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";

/// Close code for a malformed message (`graphql-transport-ws`).
pub const CLOSE_BAD_REQUEST: u16 = 4400;
/// Close code for a rejected `connection_init` (`graphql-transport-ws`).
pub const CLOSE_FORBIDDEN: u16 = 4403;
/// Close code for a repeated operation id (`graphql-transport-ws`).
pub const CLOSE_DUPLICATE_ID: u16 = 4409;
/// Close code for a repeated `connection_init` (`graphql-transport-ws`).
pub const CLOSE_TOO_MANY_INITS: u16 = 4429;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `graphql-ws`
    GraphqlWs,
    /// `graphql-transport-ws`
    GraphqlTransportWs,
}

impl Protocol {
    pub const fn name(self) -> &'static str {
        match self {
            Self::GraphqlWs => GRAPHQL_WS,
            Self::GraphqlTransportWs => GRAPHQL_TRANSPORT_WS,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            GRAPHQL_WS => Some(Self::GraphqlWs),
            GRAPHQL_TRANSPORT_WS => Some(Self::GraphqlTransportWs),
            _ => None,
        }
    }

    /// Picks a protocol from a `Sec-WebSocket-Protocol` header value,
    /// preferring `graphql-transport-ws` when both are offered.
    pub fn negotiate(header: &str) -> Option<Self> {
        let offered: Vec<Self> = header.split(',').filter_map(Self::from_name).collect();
        if offered.contains(&Self::GraphqlTransportWs) {
            Some(Self::GraphqlTransportWs)
        } else {
            offered.first().copied()
        }
    }

    /// Parses a client text frame.
    ///
    /// Message types belonging to the other protocol are malformed.
    pub fn parse(self, text: &str) -> Result<Inbound, String> {
        let message: ClientMessage = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let inbound = match (self, message) {
            (_, ClientMessage::ConnectionInit { payload }) => Inbound::Init(payload),
            (Self::GraphqlWs, ClientMessage::Start { id, payload })
            | (Self::GraphqlTransportWs, ClientMessage::Subscribe { id, payload }) => {
                Inbound::Start { id, request: payload }
            }
            (Self::GraphqlWs, ClientMessage::Stop { id })
            | (Self::GraphqlTransportWs, ClientMessage::Complete { id }) => Inbound::Stop { id },
            (Self::GraphqlWs, ClientMessage::ConnectionTerminate) => Inbound::Terminate,
            (Self::GraphqlTransportWs, ClientMessage::Ping { payload }) => Inbound::Ping(payload),
            (Self::GraphqlTransportWs, ClientMessage::Pong { .. }) => Inbound::Pong,
            (protocol, other) => {
                return Err(format!(
                    "message type \"{}\" is not part of {}",
                    other.type_name(),
                    protocol.name()
                ))
            }
        };
        Ok(inbound)
    }

    /// The keep-alive message: `ka` for the legacy protocol, `pong` otherwise.
    pub fn keep_alive(self) -> ServerMessage {
        match self {
            Self::GraphqlWs => ServerMessage::KeepAlive,
            Self::GraphqlTransportWs => ServerMessage::Pong { payload: None },
        }
    }

    pub fn data(self, id: &str, payload: Response) -> ServerMessage {
        let id = id.to_string();
        match self {
            Self::GraphqlWs => ServerMessage::Data { id, payload },
            Self::GraphqlTransportWs => ServerMessage::Next { id, payload },
        }
    }

    /// An operation-level error; the payload is a list of GraphQL errors.
    pub fn operation_error(self, id: &str, errors: Vec<GraphQLError>) -> ServerMessage {
        ServerMessage::Error {
            id: Some(id.to_string()),
            payload: serde_json::to_value(errors).unwrap_or_else(|_| json!([])),
        }
    }

    /// The frame sent when `connection_init` is rejected.
    pub fn init_error(self, message: &str) -> ServerMessage {
        match self {
            Self::GraphqlWs => ServerMessage::ConnectionError {
                payload: json!({ "message": message }),
            },
            Self::GraphqlTransportWs => ServerMessage::Error {
                id: None,
                payload: json!([{ "message": message }]),
            },
        }
    }

    /// Close code used after a rejected `connection_init`.
    pub fn init_rejected_code(self) -> CloseCode {
        match self {
            Self::GraphqlWs => CloseCode::Normal,
            Self::GraphqlTransportWs => CloseCode::from(CLOSE_FORBIDDEN),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Messages sent by clients of either protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Start {
        id: String,
        payload: Request,
    },
    Subscribe {
        id: String,
        payload: Request,
    },
    Stop {
        id: String,
    },
    Complete {
        id: String,
    },
    ConnectionTerminate,
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        #[allow(dead_code)]
        payload: Option<Value>,
    },
}

impl ClientMessage {
    fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::Start { .. } => "start",
            Self::Subscribe { .. } => "subscribe",
            Self::Stop { .. } => "stop",
            Self::Complete { .. } => "complete",
            Self::ConnectionTerminate => "connection_terminate",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// A client message with the protocol differences removed.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Init(Option<Value>),
    Start { id: String, request: Request },
    Stop { id: String },
    Terminate,
    Ping(Option<Value>),
    Pong,
}

/// Messages sent by the server, in either protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    #[serde(rename = "ka")]
    KeepAlive,
    ConnectionError {
        payload: Value,
    },
    Data {
        id: String,
        payload: Response,
    },
    Next {
        id: String,
        payload: Response,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl ServerMessage {
    pub fn complete(id: &str) -> Self {
        Self::Complete { id: id.to_string() }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Clips a close reason to the 123 bytes a close frame can carry.
pub(crate) fn close_reason(reason: &str) -> &str {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason;
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(
            Protocol::negotiate("graphql-ws, graphql-transport-ws"),
            Some(Protocol::GraphqlTransportWs)
        );
        assert_eq!(Protocol::negotiate("graphql-ws"), Some(Protocol::GraphqlWs));
        assert_eq!(Protocol::negotiate("mqtt, graphql-ws"), Some(Protocol::GraphqlWs));
        assert_eq!(Protocol::negotiate("mqtt"), None);
        assert_eq!(Protocol::negotiate(""), None);
    }

    #[test]
    fn test_parse_start_and_subscribe() {
        let legacy = Protocol::GraphqlWs
            .parse(r#"{"id":"1","type":"start","payload":{"query":"subscription{time}"}}"#)
            .unwrap();
        assert_eq!(
            legacy,
            Inbound::Start {
                id: "1".into(),
                request: Request::new("subscription{time}"),
            }
        );

        let current = Protocol::GraphqlTransportWs
            .parse(r#"{"id":"1","type":"subscribe","payload":{"query":"{a}","operationName":"A"}}"#)
            .unwrap();
        assert_eq!(
            current,
            Inbound::Start {
                id: "1".into(),
                request: Request::new("{a}").with_operation_name("A"),
            }
        );
    }

    #[test]
    fn test_parse_rejects_other_protocols_messages() {
        assert!(Protocol::GraphqlWs.parse(r#"{"type":"ping"}"#).is_err());
        assert!(Protocol::GraphqlTransportWs
            .parse(r#"{"id":"1","type":"stop"}"#)
            .is_err());
        assert!(Protocol::GraphqlTransportWs
            .parse(r#"{"type":"connection_terminate"}"#)
            .is_err());
        assert!(Protocol::GraphqlWs.parse("not json").is_err());
        assert!(Protocol::GraphqlWs.parse(r#"{"type":"start"}"#).is_err());
    }

    #[test]
    fn test_parse_init_with_and_without_payload() {
        assert_eq!(
            Protocol::GraphqlWs.parse(r#"{"type":"connection_init"}"#).unwrap(),
            Inbound::Init(None)
        );
        assert_eq!(
            Protocol::GraphqlTransportWs
                .parse(r#"{"type":"connection_init","payload":{"token":"t"}}"#)
                .unwrap(),
            Inbound::Init(Some(json!({"token": "t"})))
        );
    }

    #[test]
    fn test_server_messages_serialize_per_protocol() {
        let data = Protocol::GraphqlWs.data("s", Response::data(json!({"time": 1})));
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"type": "data", "id": "s", "payload": {"data": {"time": 1}}})
        );
        let next = Protocol::GraphqlTransportWs.data("s", Response::data(json!(null)));
        assert_eq!(
            serde_json::to_value(&next).unwrap(),
            json!({"type": "next", "id": "s", "payload": {"data": null}})
        );
        assert_eq!(
            Protocol::GraphqlWs.keep_alive().to_json().unwrap(),
            r#"{"type":"ka"}"#
        );
        assert_eq!(
            Protocol::GraphqlTransportWs.keep_alive().to_json().unwrap(),
            r#"{"type":"pong"}"#
        );
        assert_eq!(
            ServerMessage::ConnectionAck.to_json().unwrap(),
            r#"{"type":"connection_ack"}"#
        );
    }

    #[test]
    fn test_error_payloads() {
        let op = Protocol::GraphqlTransportWs.operation_error("7", vec![GraphQLError::new("bad")]);
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"type": "error", "id": "7", "payload": [{"message": "bad"}]})
        );
        let init = Protocol::GraphqlWs.init_error("denied");
        assert_eq!(
            serde_json::to_value(&init).unwrap(),
            json!({"type": "connection_error", "payload": {"message": "denied"}})
        );
        assert_eq!(
            Protocol::GraphqlTransportWs.init_rejected_code(),
            CloseCode::Library(4403)
        );
    }

    #[test]
    fn test_close_reason_is_clipped_on_char_boundary() {
        let long = "é".repeat(100);
        let clipped = close_reason(&long);
        assert!(clipped.len() <= 123);
        assert_eq!(clipped.len() % 2, 0);
        assert_eq!(close_reason("short"), "short");
    }
}
