//! Execution runtime for quill.
//!
//! This crate provides the GraphQL execution engine:
//! - `schema`: Type system model and builder
//! - `coerce`: Variable and argument coercion, leaf serialization
//! - `validation`: Document validation and cost accounting
//! - `executor`: Cooperative executor with promise draining and batching
//! - `promise`: One-shot resolve promises
//! - `subscription`: Source streams and the per-event driver
//! - `dataloader`: Batch loaders flushed by the idle handler

pub mod coerce;
pub mod collect;
pub mod context;
pub mod dataloader;
pub mod error;
pub mod executor;
pub mod idle;
pub mod promise;
pub mod resolver;
pub mod schema;
pub mod subscription;
pub mod validation;

pub use context::Context;
pub use dataloader::{BatchLoader, Dispatch, Dispatcher};
pub use error::{ErrorKind, ExecutionError, GraphQLError, PathSegment, Response};
pub use executor::{Executor, ExecutorConfig, PreparedOperation, Request};
pub use idle::{DispatchIdle, FnIdle, IdleHandler};
pub use promise::{PromiseError, PromiseSender, ResolvePromise, ResolveResult};
pub use resolver::{
    BatchResolver, DefaultResolver, FieldContext, FnResolver, ResolveReturn, Resolver,
    ResolverArgs, ResolverError, ResolverInfo, ResolverMap, StreamResolver,
};
pub use schema::{
    Cost, CostContext, EnumDef, FieldCost, FieldDef, InputFieldDef, InputObjectDef,
    InterfaceDef, ObjectDef, ScalarDef, Schema, SchemaBuilder, SchemaError, TypeDef, TypeId,
    TypeRef, UnionDef,
};
pub use subscription::{SourceStream, Subscription};
