//! GraphQL over WebSocket.
//!
//! Speaks both `graphql-ws` (legacy) and `graphql-transport-ws`. The HTTP
//! layer performs the upgrade and hands the raw stream to
//! [`Connection::serve`].

mod connection;
mod handler;
pub mod protocol;

pub use connection::{Connection, ConnectionHandle, ConnectionState};
pub use handler::{ConnectionHandler, Operation};
pub use protocol::{Protocol, GRAPHQL_TRANSPORT_WS, GRAPHQL_WS};
pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

/// Wraps an already upgraded byte stream as the server side of a WebSocket.
pub async fn server_stream<S>(io: S) -> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    WebSocketStream::from_raw_socket(io, Role::Server, None).await
}
