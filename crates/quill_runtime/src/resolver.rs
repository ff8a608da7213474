//! Resolver system.
//!
//! Resolvers are synchronous: a resolver either produces a value right away
//! or hands back a [`ResolvePromise`] for work it started elsewhere. The
//! executor never awaits a resolver directly.

use crate::context::Context;
use crate::error::PathSegment;
use crate::promise::ResolvePromise;
use crate::schema::FieldDef;
use crate::subscription::SourceStream;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Arguments passed to a resolver, already coerced to their declared types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverArgs {
    args: IndexMap<String, Value>,
}

impl ResolverArgs {
    /// Creates new resolver args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from a list of (name, value) pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ResolverError> {
        self.args
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ResolverError::ArgumentParseError(name.to_string(), e.to_string()))
            })
    }

    /// Returns all arguments.
    pub fn all(&self) -> &IndexMap<String, Value> {
        &self.args
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    /// The field name being resolved.
    pub field_name: String,

    /// The key the value is written under (alias or field name).
    pub response_key: String,

    /// The return type, as written (`[User!]!`).
    pub return_type: String,

    /// The parent type name.
    pub parent_type: String,

    /// Path to this field.
    pub path: Vec<PathSegment>,
}

impl ResolverInfo {
    /// Creates new resolver info.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            response_key: field_name.clone(),
            field_name,
            return_type: String::new(),
            parent_type: parent_type.into(),
            path: Vec::new(),
        }
    }

    /// Sets the return type.
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    /// Sets the response key.
    pub fn with_response_key(mut self, key: impl Into<String>) -> Self {
        self.response_key = key.into();
        self
    }

    /// Sets the path.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }
}

/// Everything a resolver sees about the field it resolves.
#[derive(Debug, Clone)]
pub struct FieldContext<'a> {
    /// The parent object value.
    pub object: Arc<Value>,
    pub args: ResolverArgs,
    pub ctx: Context,
    /// The schema definition of the field.
    pub field: &'a FieldDef,
    pub info: ResolverInfo,
    /// Set only for the first execution of a subscription, when the root
    /// resolver is asked for a source stream.
    pub is_subscribe: bool,
}

impl FieldContext<'_> {
    /// The parent object value.
    pub fn object(&self) -> &Value {
        &self.object
    }
}

/// What a resolver hands back: a value now, or a promise of one.
#[derive(Debug)]
pub enum ResolveReturn {
    Value(Value),
    Pending(ResolvePromise),
}

impl From<Value> for ResolveReturn {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<ResolvePromise> for ResolveReturn {
    fn from(promise: ResolvePromise) -> Self {
        Self::Pending(promise)
    }
}

/// Error from a resolver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolverError {
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParseError(String, String),

    /// A user error, optionally with response extensions.
    #[error("{message}")]
    Custom {
        message: String,
        extensions: Option<IndexMap<String, Value>>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Creates a user error.
    pub fn new(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
            extensions: None,
        }
    }

    /// Adds an extension, turning the error into a [`ResolverError::Custom`].
    #[must_use]
    pub fn with_extension(self, key: impl Into<String>, value: Value) -> Self {
        let (message, mut extensions) = match self {
            Self::Custom {
                message,
                extensions,
            } => (message, extensions.unwrap_or_default()),
            other => (other.to_string(), IndexMap::new()),
        };
        extensions.insert(key.into(), value);
        Self::Custom {
            message,
            extensions: Some(extensions),
        }
    }
}

/// Errors that carry GraphQL response extensions.
pub trait ErrorExtensions {
    fn extensions(&self) -> Option<&IndexMap<String, Value>>;
}

impl ErrorExtensions for ResolverError {
    fn extensions(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Custom { extensions, .. } => extensions.as_ref(),
            _ => None,
        }
    }
}

/// Trait for field resolvers.
pub trait Resolver: Send + Sync {
    /// Resolves a field value.
    fn resolve(&self, field: &FieldContext<'_>) -> Result<ResolveReturn, ResolverError>;

    /// Produces the source stream of a subscription root field.
    fn subscribe(&self, field: &FieldContext<'_>) -> Result<SourceStream, ResolverError> {
        Err(ResolverError::new(format!(
            "field `{}.{}` is not a subscription source",
            field.info.parent_type, field.info.field_name
        )))
    }
}

/// A resolver called once per flush with every queued field that shares it.
pub trait BatchResolver: Send + Sync {
    /// Resolves all fields; the result at index `i` belongs to `fields[i]`.
    fn resolve_batch(&self, fields: &[FieldContext<'_>]) -> Vec<Result<ResolveReturn, ResolverError>>;
}

/// A wrapper for resolver functions.
pub struct FnResolver<F> {
    func: F,
}

impl<F> FnResolver<F> {
    /// Creates a new function resolver.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, R> Resolver for FnResolver<F>
where
    F: Fn(&FieldContext<'_>) -> Result<R, ResolverError> + Send + Sync,
    R: Into<ResolveReturn>,
{
    fn resolve(&self, field: &FieldContext<'_>) -> Result<ResolveReturn, ResolverError> {
        (self.func)(field).map(Into::into)
    }
}

/// A wrapper for batch resolver functions.
pub struct FnBatchResolver<F> {
    func: F,
}

impl<F> FnBatchResolver<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> BatchResolver for FnBatchResolver<F>
where
    F: Fn(&[FieldContext<'_>]) -> Vec<Result<ResolveReturn, ResolverError>> + Send + Sync,
{
    fn resolve_batch(&self, fields: &[FieldContext<'_>]) -> Vec<Result<ResolveReturn, ResolverError>> {
        (self.func)(fields)
    }
}

/// A subscription root resolver built from a stream factory.
///
/// Per event the field resolves to the event itself, unless a mapping
/// resolver is supplied.
pub struct StreamResolver<S> {
    subscribe: S,
    map: Option<Box<dyn Resolver>>,
}

impl<S> StreamResolver<S> {
    pub fn new(subscribe: S) -> Self {
        Self {
            subscribe,
            map: None,
        }
    }

    /// Uses `resolver` to turn each event into the field value.
    #[must_use]
    pub fn with_resolver<R: Resolver + 'static>(mut self, resolver: R) -> Self {
        self.map = Some(Box::new(resolver));
        self
    }
}

impl<S> Resolver for StreamResolver<S>
where
    S: Fn(&FieldContext<'_>) -> Result<SourceStream, ResolverError> + Send + Sync,
{
    fn resolve(&self, field: &FieldContext<'_>) -> Result<ResolveReturn, ResolverError> {
        match &self.map {
            Some(resolver) => resolver.resolve(field),
            None => Ok(ResolveReturn::Value(field.object().clone())),
        }
    }

    fn subscribe(&self, field: &FieldContext<'_>) -> Result<SourceStream, ResolverError> {
        (self.subscribe)(field)
    }
}

/// Default resolver that accesses properties from the parent object.
pub struct DefaultResolver;

impl Resolver for DefaultResolver {
    fn resolve(&self, field: &FieldContext<'_>) -> Result<ResolveReturn, ResolverError> {
        property(field.object(), &field.info.field_name).map(ResolveReturn::Value)
    }
}

/// Looks up `name` on `parent`, then its snake_case spelling.
pub(crate) fn property(parent: &Value, name: &str) -> Result<Value, ResolverError> {
    match parent {
        Value::Object(map) => {
            if let Some(value) = map.get(name) {
                Ok(value.clone())
            } else {
                // Try snake_case version
                let snake_case = to_snake_case(name);
                Ok(map.get(&snake_case).cloned().unwrap_or(Value::Null))
            }
        }
        Value::Null => Ok(Value::Null),
        _ => Err(ResolverError::FieldNotFound(name.to_string())),
    }
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// A shared resolver.
pub type SharedResolver = Arc<dyn Resolver>;

/// Resolvers organized by type and field, attached to a schema at build time.
#[derive(Default)]
pub struct ResolverMap {
    /// Resolvers indexed by "TypeName.fieldName".
    resolvers: FxHashMap<String, SharedResolver>,
}

impl ResolverMap {
    /// Creates a new resolver map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver for a specific type and field.
    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.resolvers.insert(key, Arc::new(resolver));
    }

    /// Registers a function as a resolver.
    pub fn register_fn<F, R>(&mut self, type_name: impl Into<String>, field_name: impl Into<String>, f: F)
    where
        F: Fn(&FieldContext<'_>) -> Result<R, ResolverError> + Send + Sync + 'static,
        R: Into<ResolveReturn> + 'static,
    {
        self.register(type_name, field_name, FnResolver::new(f));
    }

    /// Gets a resolver for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&SharedResolver> {
        self.resolvers.get(&format!("{type_name}.{field_name}"))
    }

    /// Iterates `(type, field, resolver)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &SharedResolver)> {
        self.resolvers.iter().filter_map(|(key, resolver)| {
            key.split_once('.')
                .map(|(type_name, field_name)| (type_name, field_name, resolver))
        })
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl Debug for ResolverMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, TypeRef};
    use serde_json::json;

    fn field_context<'a>(field: &'a FieldDef, object: Value, args: ResolverArgs) -> FieldContext<'a> {
        FieldContext {
            object: Arc::new(object),
            args,
            ctx: Context::new(),
            field,
            info: ResolverInfo::new(field.name.clone(), "User"),
            is_subscribe: false,
        }
    }

    fn value_of(result: Result<ResolveReturn, ResolverError>) -> Value {
        match result.unwrap() {
            ResolveReturn::Value(v) => v,
            ResolveReturn::Pending(_) => panic!("expected a value"),
        }
    }

    #[test]
    fn test_resolver_args() {
        let mut args = ResolverArgs::new();
        args.set("id", json!(123));
        args.set("name", json!("test"));

        assert_eq!(args.get_as::<i64>("id"), Some(123));
        assert_eq!(args.get_as::<String>("name"), Some("test".to_string()));
        assert_eq!(args.get_as::<i64>("missing"), None);
        assert!(matches!(
            args.require::<i64>("missing"),
            Err(ResolverError::MissingArgument(_))
        ));
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("firstName"), "first_name");
        assert_eq!(to_snake_case("lastName"), "last_name");
        assert_eq!(to_snake_case("id"), "id");
        assert_eq!(to_snake_case("ID"), "i_d");
    }

    #[test]
    fn test_default_resolver() {
        let field = FieldDef::new("firstName", TypeRef::named("String"));
        let ctx = field_context(&field, json!({"first_name": "Alice"}), ResolverArgs::new());
        assert_eq!(value_of(DefaultResolver.resolve(&ctx)), json!("Alice"));

        let ctx = field_context(&field, json!(5), ResolverArgs::new());
        assert!(DefaultResolver.resolve(&ctx).is_err());
    }

    #[test]
    fn test_fn_resolver() {
        let resolver = FnResolver::new(|field: &FieldContext<'_>| {
            let id: i64 = field.args.require("id")?;
            Ok(json!({"id": id, "name": "User"}))
        });

        let def = FieldDef::new("user", TypeRef::named("User"));
        let mut args = ResolverArgs::new();
        args.set("id", json!(42));
        let ctx = field_context(&def, json!({}), args);

        assert_eq!(value_of(resolver.resolve(&ctx)), json!({"id": 42, "name": "User"}));
    }

    #[test]
    fn test_plain_resolver_refuses_subscribe() {
        let def = FieldDef::new("user", TypeRef::named("User"));
        let ctx = field_context(&def, Value::Null, ResolverArgs::new());
        assert!(DefaultResolver.subscribe(&ctx).is_err());
    }

    #[test]
    fn test_error_extensions() {
        let error = ResolverError::new("denied").with_extension("code", json!("FORBIDDEN"));
        assert_eq!(error.to_string(), "denied");
        assert_eq!(error.extensions().unwrap()["code"], json!("FORBIDDEN"));

        let converted = ResolverError::MissingArgument("id".into()).with_extension("x", json!(1));
        assert_eq!(converted.to_string(), "Missing required argument: id");
    }

    #[test]
    fn test_resolver_map() {
        let mut map = ResolverMap::new();
        map.register_fn("Query", "hello", |_| Ok(json!("Hello, World!")));

        let def = FieldDef::new("hello", TypeRef::named("String"));
        let ctx = field_context(&def, json!({}), ResolverArgs::new());
        let resolver = map.get("Query", "hello").unwrap();
        assert_eq!(value_of(resolver.resolve(&ctx)), json!("Hello, World!"));
        assert!(map.get("Query", "missing").is_none());
        assert_eq!(map.iter().next().map(|(t, f, _)| (t, f)), Some(("Query", "hello")));
    }
}
