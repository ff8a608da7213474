//! Query execution.
//!
//! The executor walks the operation on the calling task. Resolvers that
//! return a promise leave a pending slot in the result tree and the walk
//! carries on, so sibling fields get the chance to queue work of their own.
//! Once the walk is done the drain loop fills pending slots as their promises
//! are delivered, calling the idle handler whenever nothing is ready.

use crate::coerce::{coerce_argument_values, coerce_variable_values, serialize_leaf, Variables};
use crate::collect::{collect_fields, GroupedFields};
use crate::context::Context;
use crate::error::{ErrorKind, ExecutionError, GraphQLError, PathSegment, Response};
use crate::idle::{DispatchIdle, IdleHandler};
use crate::promise::{ResolvePromise, ResolveResult};
use crate::resolver::{
    BatchResolver, DefaultResolver, ErrorExtensions, FieldContext, ResolveReturn, Resolver,
    ResolverError, ResolverInfo,
};
use crate::schema::{FieldDef, Schema, TypeDef, TypeId, TypeRef};
use crate::subscription::{SourceStream, Subscription};
use crate::validation::{operation_cost, select_operation, validate};
use indexmap::IndexMap;
use quill_core::LineIndex;
use quill_syntax::{Document, FieldSelection, OperationDefinition, OperationType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Executor configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    /// Operations costing more than this are rejected before any resolver runs.
    pub max_cost: Option<u64>,
    /// Report the computed cost as `extensions.cost`.
    pub report_cost: bool,
}

impl ExecutorConfig {
    #[must_use]
    pub fn with_max_cost(mut self, max_cost: u64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    #[must_use]
    pub fn with_cost_reporting(mut self, report: bool) -> Self {
        self.report_cost = report;
        self
    }
}

/// A GraphQL request as sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Request {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Sets the variables. Anything but a JSON object clears them.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = match variables {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }
}

/// A parsed, validated operation with coerced variables and a known cost.
#[derive(Debug, Clone)]
pub struct PreparedOperation {
    document: Arc<Document>,
    operation: OperationDefinition,
    variables: Variables,
    cost: u64,
    lines: Arc<LineIndex>,
}

impl PreparedOperation {
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn operation(&self) -> &OperationDefinition {
        &self.operation
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation.operation
    }

    pub fn name(&self) -> Option<&str> {
        self.operation.name()
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// The validation-time cost of the operation.
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

/// The query executor.
#[derive(Clone)]
pub struct Executor {
    schema: Arc<Schema>,
    config: ExecutorConfig,
    idle: Arc<dyn IdleHandler>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor using [`DispatchIdle`] as its idle handler.
    pub fn new(schema: impl Into<Arc<Schema>>) -> Self {
        Self {
            schema: schema.into(),
            config: ExecutorConfig::default(),
            idle: Arc::new(DispatchIdle),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_idle_handler<H: IdleHandler + 'static>(mut self, idle: H) -> Self {
        self.idle = Arc::new(idle);
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Parses, validates and costs a request without running it.
    pub fn prepare(&self, request: &Request) -> Result<PreparedOperation, ExecutionError> {
        let schema = &*self.schema;
        let lines = LineIndex::new(&request.query);
        let parsed = quill_syntax::parse(&request.query);
        if parsed.diagnostics.has_errors() {
            return Err(ExecutionError::Parse(
                parsed
                    .diagnostics
                    .errors()
                    .map(|d| GraphQLError::from_diagnostic(d, &lines))
                    .collect(),
            ));
        }
        let document = parsed.document;

        let operation = select_operation(&document, request.operation_name.as_deref())
            .map_err(|e| ExecutionError::Validation(vec![e]))?;
        let errors = validate(schema, &document, operation, &lines);
        if !errors.is_empty() {
            return Err(ExecutionError::Validation(errors));
        }

        let empty = Map::new();
        let inputs = request.variables.as_ref().unwrap_or(&empty);
        let variables = coerce_variable_values(schema, operation, inputs).map_err(|errors| {
            ExecutionError::Validation(
                errors
                    .into_iter()
                    .map(|e| {
                        let error = GraphQLError::new(e.message).with_kind(ErrorKind::Validate);
                        match e.span {
                            Some(span) => error.at(&lines, span),
                            None => error,
                        }
                    })
                    .collect(),
            )
        })?;

        let cost = operation_cost(schema, &document, operation, &variables);
        if let Some(max_cost) = self.config.max_cost {
            if cost > max_cost {
                return Err(ExecutionError::Validation(vec![GraphQLError::new(format!(
                    "Query cost {cost} exceeds the maximum cost of {max_cost}."
                ))
                .with_kind(ErrorKind::Validate)
                .with_code("COST_LIMIT_EXCEEDED")
                .with_extension("cost", json!(cost))
                .with_extension("maxCost", json!(max_cost))]));
            }
        }

        let operation = operation.clone();
        Ok(PreparedOperation {
            document: Arc::new(document),
            operation,
            variables,
            cost,
            lines: Arc::new(lines),
        })
    }

    /// Executes a query or mutation.
    ///
    /// Request errors (parse, validation, variables, cost) come back as a
    /// response without `data`. Only cancellation is an `Err`.
    pub async fn execute(&self, ctx: &Context, request: &Request) -> Result<Response, ExecutionError> {
        let operation = match self.prepare(request) {
            Ok(operation) => operation,
            Err(ExecutionError::Cancelled) => return Err(ExecutionError::Cancelled),
            Err(error) => {
                tracing::debug!(%error, "request rejected");
                return Ok(Response::from_errors(error.into_errors()));
            }
        };
        if operation.operation_type() == OperationType::Subscription {
            return Ok(Response::from_errors(vec![GraphQLError::new(
                "Subscription operations must be run through a subscription transport.",
            )
            .with_kind(ErrorKind::Validate)]));
        }
        self.execute_prepared(ctx, &operation, None).await
    }

    /// Executes a prepared operation, optionally with a root value.
    pub async fn execute_prepared(
        &self,
        ctx: &Context,
        operation: &PreparedOperation,
        root: Option<Value>,
    ) -> Result<Response, ExecutionError> {
        let schema = &*self.schema;
        let Some(root_type) = schema.root_type(operation.operation_type()) else {
            return Ok(Response::error(format!(
                "Schema is not configured for {}s.",
                operation.operation_type()
            )));
        };
        tracing::debug!(
            operation = operation.name().unwrap_or("<anonymous>"),
            kind = %operation.operation_type(),
            cost = operation.cost,
            "executing operation"
        );

        let execution = Execution::new(
            schema,
            &operation.document,
            &operation.variables,
            &operation.lines,
            ctx,
            &*self.idle,
        );
        let root = root.unwrap_or_else(|| Value::Object(Map::new()));
        let (data, errors) = execution.run(root_type, root, &operation.operation).await?;

        let mut response = Response {
            data: Some(data),
            errors,
            extensions: None,
        };
        if self.config.report_cost {
            response = response.with_extension("cost", json!(operation.cost));
        }
        Ok(response)
    }

    /// Starts a subscription: the root field's resolver is asked for its
    /// source stream.
    pub fn subscribe(&self, ctx: &Context, request: &Request) -> Result<Subscription, ExecutionError> {
        let operation = self.prepare(request)?;
        self.subscribe_prepared(ctx, operation)
    }

    /// Like [`subscribe`](Self::subscribe), for an operation already prepared.
    pub fn subscribe_prepared(
        &self,
        ctx: &Context,
        operation: PreparedOperation,
    ) -> Result<Subscription, ExecutionError> {
        if operation.operation_type() != OperationType::Subscription {
            return Err(ExecutionError::Validation(vec![GraphQLError::new(
                "Operation is not a subscription.",
            )
            .with_kind(ErrorKind::Validate)]));
        }
        let stream = self.source_stream(ctx, &operation)?;
        Ok(Subscription::new(
            self.clone(),
            Arc::new(operation),
            stream,
            ctx.clone(),
        ))
    }

    fn source_stream(
        &self,
        ctx: &Context,
        operation: &PreparedOperation,
    ) -> Result<SourceStream, ExecutionError> {
        let schema = &*self.schema;
        let no_root = || {
            ExecutionError::Validation(vec![GraphQLError::new(
                "Schema is not configured for subscriptions.",
            )
            .with_kind(ErrorKind::Validate)])
        };
        let root_type = schema.subscription_type().ok_or_else(no_root)?;
        let type_def = schema.type_def(root_type);

        let grouped = collect_fields(
            schema,
            &operation.document,
            root_type,
            [&operation.operation.selection_set],
            &operation.variables,
        );
        let root_field = grouped
            .iter()
            .next()
            .and_then(|(key, fields)| Some((*key, *fields.first()?)));
        let Some((key, field)) = root_field else {
            return Err(ExecutionError::Subscribe(
                GraphQLError::new("Subscription must select one top level field.")
                    .with_kind(ErrorKind::Validate),
            ));
        };
        let path = vec![PathSegment::Field(key.to_string())];
        let fail = |message: String, kind: ErrorKind| {
            ExecutionError::Subscribe(
                GraphQLError::new(message)
                    .at(&operation.lines, field.span)
                    .with_path(path.clone())
                    .with_kind(kind),
            )
        };

        let Some(def) = type_def.field(field.name.as_str()) else {
            return Err(fail(
                format!(
                    "Cannot query field \"{}\" on type \"{}\".",
                    field.name,
                    type_def.name()
                ),
                ErrorKind::Validate,
            ));
        };
        let args = coerce_argument_values(
            schema,
            &def.arguments,
            &field.arguments,
            &operation.variables,
            field.span,
        )
        .map_err(|e| fail(e.message, ErrorKind::CoerceArgument))?;
        let Some(resolver) = &def.resolver else {
            return Err(fail(
                format!(
                    "Subscription field \"{}.{}\" has no source stream.",
                    type_def.name(),
                    def.name
                ),
                ErrorKind::Resolve,
            ));
        };

        let context = FieldContext {
            object: Arc::new(Value::Object(Map::new())),
            args,
            ctx: ctx.clone(),
            field: def,
            info: ResolverInfo::new(def.name.as_str(), type_def.name())
                .with_response_key(key)
                .with_return_type(def.ty.to_string())
                .with_path(path.clone()),
            is_subscribe: true,
        };
        resolver.subscribe(&context).map_err(|error| {
            let extensions = error.extensions().cloned();
            let mut failure = fail(error.to_string(), ErrorKind::Resolve);
            if let ExecutionError::Subscribe(graphql) = &mut failure {
                graphql.extensions = extensions;
            }
            failure
        })
    }
}

type NodeId = usize;

const ROOT: NodeId = 0;

/// One slot of the result tree.
#[derive(Debug)]
enum Slot<'a> {
    Pending,
    Null,
    Leaf(Value),
    Object(Vec<(&'a str, NodeId)>),
    List(Vec<NodeId>),
}

#[derive(Debug)]
struct Node<'a> {
    parent: Option<NodeId>,
    /// Whether a null may stop here instead of propagating to the parent.
    nullable: bool,
    slot: Slot<'a>,
}

/// A slot is dead once it or any ancestor has been nulled.
fn node_is_live(nodes: &[Node<'_>], mut id: NodeId) -> bool {
    loop {
        let node = &nodes[id];
        if matches!(node.slot, Slot::Null) {
            return false;
        }
        match node.parent {
            Some(parent) => id = parent,
            None => return true,
        }
    }
}

/// A field waiting to be resolved and completed into `node`.
#[derive(Debug, Clone)]
struct FieldTask<'a> {
    node: NodeId,
    parent_type: &'a str,
    def: &'a FieldDef,
    /// First selection of the field; reported in error locations.
    field: &'a FieldSelection,
    /// Every selection merged under the response key.
    fields: Vec<&'a FieldSelection>,
    path: Vec<PathSegment>,
}

struct Batch<'a> {
    resolver: &'a dyn BatchResolver,
    queued: Vec<(FieldTask<'a>, FieldContext<'a>)>,
}

struct Execution<'a> {
    schema: &'a Schema,
    document: &'a Document,
    variables: &'a Variables,
    lines: &'a LineIndex,
    ctx: &'a Context,
    idle: &'a dyn IdleHandler,
    nodes: Vec<Node<'a>>,
    errors: Vec<GraphQLError>,
    pending: Vec<(FieldTask<'a>, ResolvePromise)>,
    /// Keyed by the address of the shared batch resolver.
    batches: IndexMap<usize, Batch<'a>>,
}

impl<'a> Execution<'a> {
    fn new(
        schema: &'a Schema,
        document: &'a Document,
        variables: &'a Variables,
        lines: &'a LineIndex,
        ctx: &'a Context,
        idle: &'a dyn IdleHandler,
    ) -> Self {
        Self {
            schema,
            document,
            variables,
            lines,
            ctx,
            idle,
            nodes: vec![Node {
                parent: None,
                nullable: false,
                slot: Slot::Pending,
            }],
            errors: Vec::new(),
            pending: Vec::new(),
            batches: IndexMap::new(),
        }
    }

    async fn run(
        mut self,
        root_type: TypeId,
        root: Value,
        operation: &'a OperationDefinition,
    ) -> Result<(Value, Vec<GraphQLError>), ExecutionError> {
        let grouped = collect_fields(
            self.schema,
            self.document,
            root_type,
            [&operation.selection_set],
            self.variables,
        );
        let tasks = self.object_fields(ROOT, root_type, grouped, &[]);
        let root = Arc::new(root);

        if operation.operation == OperationType::Mutation {
            // Each top-level mutation field settles before the next one starts.
            for task in tasks {
                self.execute_field(task, Arc::clone(&root));
                self.drain().await?;
            }
        } else {
            for task in tasks {
                self.execute_field(task, Arc::clone(&root));
            }
            self.drain().await?;
        }

        let data = self.take(ROOT);
        Ok((data, self.errors))
    }

    fn alloc(&mut self, parent: NodeId, nullable: bool, slot: Slot<'a>) -> NodeId {
        self.nodes.push(Node {
            parent: Some(parent),
            nullable,
            slot,
        });
        self.nodes.len() - 1
    }

    fn is_live(&self, id: NodeId) -> bool {
        node_is_live(&self.nodes, id)
    }

    /// Nulls the nearest nullable slot at or above `id`.
    fn null_out(&mut self, mut id: NodeId) {
        loop {
            let node = &mut self.nodes[id];
            match node.parent {
                Some(parent) if !node.nullable => id = parent,
                _ => {
                    node.slot = Slot::Null;
                    return;
                }
            }
        }
    }

    fn take(&mut self, id: NodeId) -> Value {
        match std::mem::replace(&mut self.nodes[id].slot, Slot::Null) {
            Slot::Pending | Slot::Null => Value::Null,
            Slot::Leaf(value) => value,
            Slot::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, child)| (key.to_string(), self.take(child)))
                    .collect(),
            ),
            Slot::List(items) => Value::Array(items.into_iter().map(|c| self.take(c)).collect()),
        }
    }

    fn field_error(&mut self, node: NodeId, error: GraphQLError) {
        if !self.is_live(node) {
            return;
        }
        self.errors.push(error);
        self.null_out(node);
    }

    fn error_at(
        &self,
        task: &FieldTask<'a>,
        message: impl Into<String>,
        path: Vec<PathSegment>,
        kind: ErrorKind,
    ) -> GraphQLError {
        GraphQLError::new(message)
            .at(self.lines, task.field.span)
            .with_path(path)
            .with_kind(kind)
    }

    fn resolver_error(&self, task: &FieldTask<'a>, error: &ResolverError) -> GraphQLError {
        let mut graphql = self.error_at(task, error.to_string(), task.path.clone(), ErrorKind::Resolve);
        graphql.extensions = error.extensions().cloned();
        graphql
    }

    /// Allocates the slots of an object's fields and returns the fields to
    /// resolve, in response order.
    fn object_fields(
        &mut self,
        node: NodeId,
        object_type: TypeId,
        grouped: GroupedFields<'a>,
        path: &[PathSegment],
    ) -> Vec<FieldTask<'a>> {
        let schema = self.schema;
        let type_def = schema.type_def(object_type);
        let mut entries = Vec::with_capacity(grouped.len());
        let mut tasks = Vec::with_capacity(grouped.len());

        for (key, fields) in grouped {
            let Some(&field) = fields.first() else {
                continue;
            };
            if field.name.as_str() == "__typename" {
                let name = Value::String(type_def.name().to_string());
                let child = self.alloc(node, false, Slot::Leaf(name));
                entries.push((key, child));
                continue;
            }
            let Some(def) = type_def.field(field.name.as_str()) else {
                continue;
            };
            let child = self.alloc(node, !def.ty.is_non_null(), Slot::Pending);
            entries.push((key, child));

            let mut field_path = path.to_vec();
            field_path.push(PathSegment::Field(key.to_string()));
            tasks.push(FieldTask {
                node: child,
                parent_type: type_def.name(),
                def,
                field,
                fields,
                path: field_path,
            });
        }

        self.nodes[node].slot = Slot::Object(entries);
        tasks
    }

    fn execute_field(&mut self, task: FieldTask<'a>, object: Arc<Value>) {
        let def = task.def;
        let args = match coerce_argument_values(
            self.schema,
            &def.arguments,
            &task.field.arguments,
            self.variables,
            task.field.span,
        ) {
            Ok(args) => args,
            Err(error) => {
                let graphql = GraphQLError::new(error.message)
                    .at(self.lines, error.span.unwrap_or(task.field.span))
                    .with_path(task.path.clone())
                    .with_kind(ErrorKind::CoerceArgument);
                self.field_error(task.node, graphql);
                return;
            }
        };

        let context = FieldContext {
            object,
            args,
            ctx: self.ctx.clone(),
            field: def,
            info: ResolverInfo::new(def.name.as_str(), task.parent_type)
                .with_response_key(task.field.response_key())
                .with_return_type(def.ty.to_string())
                .with_path(task.path.clone()),
            is_subscribe: false,
        };

        if let Some(batch) = &def.batch_resolver {
            let key = Arc::as_ptr(batch).cast::<()>() as usize;
            self.batches
                .entry(key)
                .or_insert_with(|| Batch {
                    resolver: batch.as_ref(),
                    queued: Vec::new(),
                })
                .queued
                .push((task, context));
            return;
        }

        let result = match &def.resolver {
            Some(resolver) => resolver.resolve(&context),
            None => DefaultResolver.resolve(&context),
        };
        self.handle_return(task, result);
    }

    fn handle_return(&mut self, task: FieldTask<'a>, result: Result<ResolveReturn, ResolverError>) {
        match result {
            Ok(ResolveReturn::Value(value)) => self.complete_field(&task, value),
            Ok(ResolveReturn::Pending(mut promise)) => match promise.poll() {
                Some(result) => self.resolved(&task, result),
                None => self.pending.push((task, promise)),
            },
            Err(error) => {
                let graphql = self.resolver_error(&task, &error);
                self.field_error(task.node, graphql);
            }
        }
    }

    fn resolved(&mut self, task: &FieldTask<'a>, result: ResolveResult) {
        match result {
            Ok(value) => self.complete_field(task, value),
            Err(error) => {
                let graphql = self.resolver_error(task, &error);
                self.field_error(task.node, graphql);
            }
        }
    }

    fn complete_field(&mut self, task: &FieldTask<'a>, value: Value) {
        self.complete_value(task, task.node, &task.def.ty, task.path.clone(), value);
    }

    fn complete_value(
        &mut self,
        task: &FieldTask<'a>,
        node: NodeId,
        ty: &'a TypeRef,
        path: Vec<PathSegment>,
        value: Value,
    ) {
        if !self.is_live(node) {
            return;
        }
        match ty {
            TypeRef::NonNull(inner) => {
                if value.is_null() {
                    let error = self.error_at(
                        task,
                        format!(
                            "Cannot return null for non-nullable field {}.{}.",
                            task.parent_type, task.def.name
                        ),
                        path,
                        ErrorKind::NonNullViolation,
                    );
                    self.field_error(node, error);
                } else {
                    self.complete_value(task, node, inner, path, value);
                }
            }
            _ if value.is_null() => self.nodes[node].slot = Slot::Null,
            TypeRef::List(item) => {
                let Value::Array(items) = value else {
                    let error = self.error_at(
                        task,
                        format!(
                            "Expected a list for field {}.{}.",
                            task.parent_type, task.def.name
                        ),
                        path,
                        ErrorKind::Resolve,
                    );
                    self.field_error(node, error);
                    return;
                };
                let nullable = !item.is_non_null();
                let children: Vec<NodeId> = items
                    .iter()
                    .map(|_| self.alloc(node, nullable, Slot::Pending))
                    .collect();
                self.nodes[node].slot = Slot::List(children.clone());
                for (index, (child, value)) in children.into_iter().zip(items).enumerate() {
                    let mut item_path = path.clone();
                    item_path.push(PathSegment::Index(index));
                    self.complete_value(task, child, item, item_path, value);
                }
            }
            TypeRef::Named(name) => {
                let schema = self.schema;
                let Some(type_id) = schema.type_id(name) else {
                    let error =
                        self.error_at(task, format!("Unknown type \"{name}\"."), path, ErrorKind::Resolve);
                    self.field_error(node, error);
                    return;
                };
                let type_def = schema.type_def(type_id);
                if type_def.is_leaf() {
                    match serialize_leaf(type_def, &value) {
                        Ok(leaf) => self.nodes[node].slot = Slot::Leaf(leaf),
                        Err(message) => {
                            let error = self.error_at(task, message, path, ErrorKind::Resolve);
                            self.field_error(node, error);
                        }
                    }
                    return;
                }
                let object_type = if type_def.is_abstract() {
                    match self.resolve_abstract(task, type_id, type_def, &value) {
                        Ok(object_type) => object_type,
                        Err(message) => {
                            let error = self.error_at(task, message, path, ErrorKind::Resolve);
                            self.field_error(node, error);
                            return;
                        }
                    }
                } else {
                    type_id
                };
                self.execute_object(task, node, object_type, &path, value);
            }
        }
    }

    fn resolve_abstract(
        &self,
        task: &FieldTask<'a>,
        abstract_type: TypeId,
        type_def: &TypeDef,
        value: &Value,
    ) -> Result<TypeId, String> {
        let resolved = type_def
            .type_resolver()
            .and_then(|resolve| resolve(value))
            .or_else(|| {
                value
                    .get("__typename")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        let Some(name) = resolved else {
            return Err(format!(
                "Abstract type \"{}\" must resolve to an Object type at runtime for field \"{}.{}\".",
                type_def.name(),
                task.parent_type,
                task.def.name
            ));
        };
        match self.schema.type_id(&name) {
            Some(id) if self.schema.possible_types(abstract_type).contains(&id) => Ok(id),
            _ => Err(format!(
                "Runtime Object type \"{name}\" is not a possible type for \"{}\".",
                type_def.name()
            )),
        }
    }

    fn execute_object(
        &mut self,
        task: &FieldTask<'a>,
        node: NodeId,
        object_type: TypeId,
        path: &[PathSegment],
        value: Value,
    ) {
        let grouped = collect_fields(
            self.schema,
            self.document,
            object_type,
            task.fields
                .iter()
                .copied()
                .filter_map(|f| f.selection_set.as_ref()),
            self.variables,
        );
        let object = Arc::new(value);
        for child in self.object_fields(node, object_type, grouped, path) {
            self.execute_field(child, Arc::clone(&object));
        }
    }

    /// Runs every queued batch resolver once with all of its fields.
    fn flush_batches(&mut self) {
        for (_, batch) in std::mem::take(&mut self.batches) {
            let nodes = &self.nodes;
            let (tasks, fields): (Vec<_>, Vec<_>) = batch
                .queued
                .into_iter()
                .filter(|(task, _)| node_is_live(nodes, task.node))
                .unzip();
            if fields.is_empty() {
                continue;
            }
            tracing::trace!(size = fields.len(), "flushing batch resolver");

            let expected = fields.len();
            let mut results = batch.resolver.resolve_batch(&fields).into_iter();
            for task in tasks {
                let result = results.next().unwrap_or_else(|| {
                    Err(ResolverError::Internal(format!(
                        "batch resolver returned fewer than {expected} results"
                    )))
                });
                self.handle_return(task, result);
            }
        }
    }

    /// Fills pending slots until none remain.
    async fn drain(&mut self) -> Result<(), ExecutionError> {
        loop {
            if self.ctx.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            if !self.batches.is_empty() {
                self.flush_batches();
                continue;
            }

            let nodes = &self.nodes;
            self.pending.retain(|(task, _)| node_is_live(nodes, task.node));
            if self.pending.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            let mut index = 0;
            while index < self.pending.len() {
                match self.pending[index].1.poll() {
                    Some(result) => {
                        let (task, _) = self.pending.remove(index);
                        self.resolved(&task, result);
                        progressed = true;
                    }
                    None => index += 1,
                }
            }
            if progressed {
                continue;
            }

            let cancel = self.ctx.cancellation().clone();
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                () = self.idle.on_idle(self.ctx) => {}
            }
            if self.pending.iter_mut().any(|(_, promise)| promise.is_ready()) {
                continue;
            }
            let filled = self
                .pending
                .iter_mut()
                .map(|(_, promise)| Box::pin(promise.filled()));
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = futures::future::select_all(filled) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, ObjectDef, SchemaBuilder};

    fn executor() -> Executor {
        let schema = SchemaBuilder::new()
            .add_type(
                ObjectDef::new("Query")
                    .with_field(
                        FieldDef::new("hello", TypeRef::named("String"))
                            .resolve_with(|_| Ok(json!("world"))),
                    )
                    .with_field(FieldDef::new("count", TypeRef::named("Int"))),
            )
            .build()
            .unwrap();
        Executor::new(schema)
    }

    #[tokio::test]
    async fn test_execute_simple_query() {
        let response = executor()
            .execute(&Context::new(), &Request::new("{ hello greeting: hello __typename }"))
            .await
            .unwrap();
        assert_eq!(
            response.data,
            Some(json!({"hello": "world", "greeting": "world", "__typename": "Query"}))
        );
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn test_root_value_properties() {
        let executor = executor();
        let operation = executor.prepare(&Request::new("{ count }")).unwrap();
        let response = executor
            .execute_prepared(&Context::new(), &operation, Some(json!({"count": 3})))
            .await
            .unwrap();
        assert_eq!(response.data, Some(json!({"count": 3})));
    }

    #[tokio::test]
    async fn test_request_errors_have_no_data() {
        let response = executor()
            .execute(&Context::new(), &Request::new("{ hello"))
            .await
            .unwrap();
        assert!(response.data.is_none());
        assert_eq!(response.errors[0].kind, Some(ErrorKind::Parse));

        let response = executor()
            .execute(&Context::new(), &Request::new("{ nope }"))
            .await
            .unwrap();
        assert!(response.data.is_none());
        assert_eq!(response.errors[0].message, "Cannot query field \"nope\" on type \"Query\".");
    }

    #[tokio::test]
    async fn test_cost_limit_and_report() {
        let strict = executor().with_config(ExecutorConfig::default().with_max_cost(1));
        let response = strict
            .execute(&Context::new(), &Request::new("{ hello count }"))
            .await
            .unwrap();
        assert!(response.data.is_none());
        assert_eq!(response.errors[0].message, "Query cost 2 exceeds the maximum cost of 1.");

        let reporting = executor().with_config(ExecutorConfig::default().with_cost_reporting(true));
        let response = reporting
            .execute(&Context::new(), &Request::new("{ hello count }"))
            .await
            .unwrap();
        assert_eq!(response.extensions.unwrap()["cost"], json!(2));
    }

    #[test]
    fn test_request_deserialization() {
        let request: Request = serde_json::from_value(json!({
            "query": "{ hello }",
            "operationName": "Q",
            "variables": null
        }))
        .unwrap();
        assert_eq!(request.operation_name.as_deref(), Some("Q"));
        assert!(request.variables.is_none());
    }
}
