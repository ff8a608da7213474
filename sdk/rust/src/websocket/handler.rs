//! Callbacks a connection makes into the application.

use crate::error::{ConnectionError, SdkError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use quill_runtime::{Context, GraphQLError, Request, Response, Subscription};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// What a started operation produces.
pub enum Operation {
    /// One response, then `complete`. Used for queries and mutations.
    Single(BoxFuture<'static, Response>),
    /// One response per source event until the stream closes.
    Stream(Subscription),
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Operation::Single"),
            Self::Stream(subscription) => f.debug_tuple("Operation::Stream").field(subscription).finish(),
        }
    }
}

/// Connection callbacks.
///
/// The connection calls these from its read loop, so `handle_init` and
/// `handle_start` should return promptly; long work belongs in the returned
/// [`Operation`].
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called for `connection_init`. The returned context becomes the parent
    /// of every operation's context; an error rejects the connection.
    async fn handle_init(&self, payload: Option<Value>) -> Result<Context, SdkError>;

    /// Called for `start`/`subscribe`. `ctx` is cancelled when the client
    /// stops the operation or the connection closes.
    async fn handle_start(
        &self,
        id: &str,
        request: Request,
        ctx: Context,
    ) -> Result<Operation, Vec<GraphQLError>>;

    /// Called after the client stopped operation `id`.
    fn handle_stop(&self, _id: &str) {}

    /// Called exactly once when the connection has closed.
    fn handle_close(&self, _code: CloseCode) {}

    /// Called when the connection starts closing, before pending operations
    /// are cancelled.
    fn cancel(&self) {}

    fn log_error(&self, error: &ConnectionError) {
        tracing::warn!(%error, "websocket connection error");
    }
}
