//! quill server SDK
//!
//! Serves a [`quill_runtime`] schema over HTTP and WebSocket.
//!
//! ```ignore
//! use quill_runtime::{FieldDef, ObjectDef, SchemaBuilder, TypeRef};
//! use quill_sdk::{GraphQLApi, PubSub, Server, ServerConfig};
//!
//! let pubsub = PubSub::new();
//! let events = pubsub.clone();
//! let schema = SchemaBuilder::new()
//!     .add_type(ObjectDef::new("Query").with_field(
//!         FieldDef::new("hello", TypeRef::named("String")).resolve_with(|_| Ok(json!("world"))),
//!     ))
//!     .add_type(ObjectDef::new("Subscription").with_field(
//!         FieldDef::new("time", TypeRef::named("Int")).subscribe_with(move |_| Ok(events.subscribe("time"))),
//!     ))
//!     .subscription_type("Subscription")
//!     .build()?;
//!
//! let api = GraphQLApi::new(schema);
//! Server::bind(api, &ServerConfig::new()).await?.run().await?;
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod pubsub;
pub mod websocket;

pub use api::{ApiBuilder, GraphQLApi};
pub use config::{ConnectionConfig, ServerConfig};
pub use error::{ConnectionError, ErrorCode, SdkError, SdkResult};
pub use http::{serve, Server};
pub use pubsub::{PubSub, TypedTopic};
pub use websocket::{
    CloseCode, Connection, ConnectionHandle, ConnectionHandler, ConnectionState, Operation,
    Protocol,
};
