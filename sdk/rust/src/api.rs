//! The API object: an executor plus the live WebSocket connections.

use crate::config::ConnectionConfig;
use crate::error::{SdkError, SdkResult};
use crate::websocket::{
    CloseCode, Connection, ConnectionHandle, ConnectionHandler, Operation, Protocol,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use quill_runtime::{
    Context, Dispatcher, ExecutionError, Executor, ExecutorConfig, GraphQLError, Request,
    Response, Schema, Subscription,
};
use quill_syntax::OperationType;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

type InitHook =
    Arc<dyn Fn(Option<Value>, Context) -> BoxFuture<'static, SdkResult<Context>> + Send + Sync>;
type ContextFactory = Arc<dyn Fn() -> Context + Send + Sync>;

/// Builder for [`GraphQLApi`].
pub struct ApiBuilder {
    schema: Arc<Schema>,
    executor: ExecutorConfig,
    connection: ConnectionConfig,
    context: Option<ContextFactory>,
    init: Option<InitHook>,
}

impl ApiBuilder {
    #[must_use]
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    #[must_use]
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Builds the context of each HTTP request and WebSocket connection.
    ///
    /// The default context carries a fresh [`Dispatcher`].
    #[must_use]
    pub fn context<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Context + Send + Sync + 'static,
    {
        self.context = Some(Arc::new(f));
        self
    }

    /// Checks the `connection_init` payload. The hook receives the payload and
    /// a fresh context and returns the connection's context; an error rejects
    /// the connection with its message.
    #[must_use]
    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<Value>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SdkResult<Context>> + Send + 'static,
    {
        self.init = Some(Arc::new(
            move |payload: Option<Value>, ctx: Context| -> BoxFuture<'static, SdkResult<Context>> {
                Box::pin(f(payload, ctx))
            },
        ));
        self
    }

    pub fn build(self) -> GraphQLApi {
        let executor = Executor::new(self.schema).with_config(self.executor);
        let context: ContextFactory = match self.context {
            Some(context) => context,
            None => Arc::new(|| Context::new().with_data(Dispatcher::new())),
        };
        GraphQLApi {
            inner: Arc::new(ApiInner {
                handler: Arc::new(ApiHandler {
                    executor,
                    context,
                    init: self.init,
                }),
                connection: self.connection,
                connections: Mutex::new(FxHashMap::default()),
            }),
        }
    }
}

/// Executes requests and services WebSocket connections for one schema.
///
/// Cloning is cheap; clones share the live connection set.
#[derive(Clone)]
pub struct GraphQLApi {
    inner: Arc<ApiInner>,
}

struct ApiInner {
    handler: Arc<ApiHandler>,
    connection: ConnectionConfig,
    connections: Mutex<FxHashMap<u64, ConnectionHandle>>,
}

impl GraphQLApi {
    pub fn new(schema: impl Into<Arc<Schema>>) -> Self {
        Self::builder(schema).build()
    }

    pub fn builder(schema: impl Into<Arc<Schema>>) -> ApiBuilder {
        ApiBuilder {
            schema: schema.into(),
            executor: ExecutorConfig::default(),
            connection: ConnectionConfig::default(),
            context: None,
            init: None,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.handler.executor
    }

    /// A fresh request context from the configured factory.
    pub fn new_context(&self) -> Context {
        (self.inner.handler.context)()
    }

    /// Executes a query or mutation.
    pub async fn execute(&self, request: &Request, ctx: &Context) -> SdkResult<Response> {
        Ok(self.executor().execute(ctx, request).await?)
    }

    /// Starts a subscription.
    pub fn subscribe(&self, request: &Request, ctx: &Context) -> SdkResult<Subscription> {
        Ok(self.executor().subscribe(ctx, request)?)
    }

    /// Services one WebSocket connection until it closes.
    pub async fn serve_websocket<S>(&self, stream: WebSocketStream<S>, protocol: Protocol)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::new(
            protocol,
            Arc::clone(&self.inner.handler),
            self.inner.connection.clone(),
        );
        let handle = connection.handle();
        let id = handle.id();
        self.inner.connections.lock().insert(id, handle);
        let _registered = Registered {
            connections: &self.inner.connections,
            id,
        };
        connection.serve(stream).await;
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Closes every live connection with 1000 and waits for them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<ConnectionHandle> =
            self.inner.connections.lock().values().cloned().collect();
        tracing::info!(connections = handles.len(), "shutting down");
        for handle in &handles {
            handle.close(CloseCode::Normal, "server shutting down");
        }
        futures::future::join_all(handles.iter().map(ConnectionHandle::closed)).await;
    }
}

/// Removes a connection from the live set, even if its future is dropped.
struct Registered<'a> {
    connections: &'a Mutex<FxHashMap<u64, ConnectionHandle>>,
    id: u64,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.connections.lock().remove(&self.id);
    }
}

impl std::fmt::Debug for GraphQLApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQLApi")
            .field("executor", self.executor())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Connection callbacks backed by the executor.
struct ApiHandler {
    executor: Executor,
    context: ContextFactory,
    init: Option<InitHook>,
}

#[async_trait]
impl ConnectionHandler for ApiHandler {
    async fn handle_init(&self, payload: Option<Value>) -> Result<Context, SdkError> {
        let ctx = (self.context)();
        match &self.init {
            Some(init) => init(payload, ctx).await,
            None => Ok(ctx),
        }
    }

    async fn handle_start(
        &self,
        id: &str,
        request: Request,
        ctx: Context,
    ) -> Result<Operation, Vec<GraphQLError>> {
        let operation = self
            .executor
            .prepare(&request)
            .map_err(ExecutionError::into_errors)?;
        tracing::debug!(id, kind = %operation.operation_type(), "starting operation");

        if operation.operation_type() == OperationType::Subscription {
            return self
                .executor
                .subscribe_prepared(&ctx, operation)
                .map(Operation::Stream)
                .map_err(ExecutionError::into_errors);
        }
        let executor = self.executor.clone();
        Ok(Operation::Single(Box::pin(async move {
            executor
                .execute_prepared(&ctx, &operation, None)
                .await
                .unwrap_or_else(|error| Response::from_errors(error.into_errors()))
        })))
    }
}
