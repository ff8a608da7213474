//! Schema definition.
//!
//! A [`Schema`] is built once through [`SchemaBuilder`] and shared behind an
//! `Arc`. Every named type gets a [`TypeId`] (its registry index), which is
//! what the executor uses for lookups on the hot path.

use crate::resolver::{
    BatchResolver, FieldContext, FnBatchResolver, FnResolver, ResolveReturn, Resolver,
    ResolverArgs, ResolverError, ResolverMap, SharedResolver, StreamResolver,
};
use crate::subscription::SourceStream;
use indexmap::IndexMap;
use quill_syntax::OperationType;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Stable identifier of a named type within one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resolves the concrete object type name of an abstract value.
pub type TypeResolverFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Converts a scalar value, or explains why it cannot.
pub type ScalarFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Computes the cost of a field from its coerced arguments.
pub type CostFn = Arc<dyn Fn(&ResolverArgs, &CostContext) -> Cost + Send + Sync>;

/// Errors detected while building a schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema has no query root type")]
    MissingQueryType,

    #[error("type `{0}` is defined more than once")]
    DuplicateType(String),

    #[error("unknown type `{name}` referenced by {referenced_by}")]
    UnknownType { name: String, referenced_by: String },

    #[error("`{name}` must be an object type to be used as {role}")]
    NotAnObjectType { name: String, role: String },

    #[error("`{object}` implements `{name}`, which is not an interface")]
    NotAnInterface { name: String, object: String },

    #[error("`{object}` implements `{interface}` but does not declare field `{field}`")]
    MissingInterfaceField {
        object: String,
        interface: String,
        field: String,
    },

    #[error("`{ty}` is not an output type (used by {owner})")]
    NotOutputType { ty: String, owner: String },

    #[error("`{ty}` is not an input type (used by {owner})")]
    NotInputType { ty: String, owner: String },

    #[error("invalid type reference `{0}`")]
    InvalidTypeRef(String),

    #[error("resolver registered for unknown field `{0}`")]
    UnknownResolverTarget(String),
}

/// A built, validated GraphQL schema.
#[derive(Debug, Clone)]
pub struct Schema {
    types: IndexMap<String, TypeDef>,
    query_type: TypeId,
    mutation_type: Option<TypeId>,
    subscription_type: Option<TypeId>,
    possible_types: FxHashMap<TypeId, Vec<TypeId>>,
}

impl Schema {
    /// Starts a schema builder.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Gets the id of a named type.
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        #[allow(clippy::cast_possible_truncation)]
        self.types.get_index_of(name).map(|i| TypeId(i as u32))
    }

    /// Gets a type by id. Ids are only minted by this schema.
    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    /// Gets a type by name.
    pub fn get_type(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Returns all types.
    pub fn types(&self) -> impl Iterator<Item = (&String, &TypeDef)> {
        self.types.iter()
    }

    pub fn query_type(&self) -> TypeId {
        self.query_type
    }

    pub fn mutation_type(&self) -> Option<TypeId> {
        self.mutation_type
    }

    pub fn subscription_type(&self) -> Option<TypeId> {
        self.subscription_type
    }

    /// The root type for an operation kind.
    pub fn root_type(&self, operation: OperationType) -> Option<TypeId> {
        match operation {
            OperationType::Query => Some(self.query_type),
            OperationType::Mutation => self.mutation_type,
            OperationType::Subscription => self.subscription_type,
        }
    }

    /// Object types that implement an interface or belong to a union.
    pub fn possible_types(&self, abstract_type: TypeId) -> &[TypeId] {
        self.possible_types
            .get(&abstract_type)
            .map_or(&[], Vec::as_slice)
    }

    /// Returns true if a fragment on `condition` applies to values of `object`.
    pub fn type_applies(&self, condition: TypeId, object: TypeId) -> bool {
        condition == object || self.possible_types(condition).contains(&object)
    }

    /// Returns true if the two composite types can describe a common object.
    pub fn types_overlap(&self, a: TypeId, b: TypeId) -> bool {
        let expand = |id: TypeId| -> Vec<TypeId> {
            if self.type_def(id).is_abstract() {
                self.possible_types(id).to_vec()
            } else {
                vec![id]
            }
        };
        let left = expand(a);
        expand(b).iter().any(|t| left.contains(t))
    }
}

/// A type definition.
#[derive(Debug, Clone)]
pub enum TypeDef {
    Scalar(ScalarDef),
    Object(ObjectDef),
    Interface(InterfaceDef),
    Union(UnionDef),
    Enum(EnumDef),
    InputObject(InputObjectDef),
}

impl TypeDef {
    pub fn name(&self) -> &str {
        match self {
            Self::Scalar(s) => &s.name,
            Self::Object(o) => &o.name,
            Self::Interface(i) => &i.name,
            Self::Union(u) => &u.name,
            Self::Enum(e) => &e.name,
            Self::InputObject(i) => &i.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => s.description.as_deref(),
            Self::Object(o) => o.description.as_deref(),
            Self::Interface(i) => i.description.as_deref(),
            Self::Union(u) => u.description.as_deref(),
            Self::Enum(e) => e.description.as_deref(),
            Self::InputObject(i) => i.description.as_deref(),
        }
    }

    /// Output fields of object and interface types.
    pub fn fields(&self) -> Option<&IndexMap<String, FieldDef>> {
        match self {
            Self::Object(o) => Some(&o.fields),
            Self::Interface(i) => Some(&i.fields),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields().and_then(|fields| fields.get(name))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Scalar(_) | Self::Enum(_))
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Interface(_) | Self::Union(_))
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Interface(_) | Self::Union(_))
    }

    pub fn is_input_type(&self) -> bool {
        matches!(self, Self::Scalar(_) | Self::Enum(_) | Self::InputObject(_))
    }

    pub fn is_output_type(&self) -> bool {
        !matches!(self, Self::InputObject(_))
    }

    /// Type resolver of an abstract type.
    pub fn type_resolver(&self) -> Option<&TypeResolverFn> {
        match self {
            Self::Interface(i) => i.resolve_type.as_ref(),
            Self::Union(u) => u.resolve_type.as_ref(),
            _ => None,
        }
    }
}

impl From<ScalarDef> for TypeDef {
    fn from(def: ScalarDef) -> Self {
        Self::Scalar(def)
    }
}

impl From<ObjectDef> for TypeDef {
    fn from(def: ObjectDef) -> Self {
        Self::Object(def)
    }
}

impl From<InterfaceDef> for TypeDef {
    fn from(def: InterfaceDef) -> Self {
        Self::Interface(def)
    }
}

impl From<UnionDef> for TypeDef {
    fn from(def: UnionDef) -> Self {
        Self::Union(def)
    }
}

impl From<EnumDef> for TypeDef {
    fn from(def: EnumDef) -> Self {
        Self::Enum(def)
    }
}

impl From<InputObjectDef> for TypeDef {
    fn from(def: InputObjectDef) -> Self {
        Self::InputObject(def)
    }
}

/// Scalar type definition.
///
/// Built-in scalars are coerced by name; custom scalars use the attached
/// functions and default to passing values through unchanged.
#[derive(Clone)]
pub struct ScalarDef {
    pub name: String,
    pub description: Option<String>,
    pub coerce_input: Option<ScalarFn>,
    pub serialize: Option<ScalarFn>,
}

impl ScalarDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            coerce_input: None,
            serialize: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the function applied to incoming literals and variables.
    #[must_use]
    pub fn with_input_coercer<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.coerce_input = Some(Arc::new(f));
        self
    }

    /// Sets the function applied to resolved values.
    #[must_use]
    pub fn with_serializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ScalarDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarDef")
            .field("name", &self.name)
            .field("has_input_coercer", &self.coerce_input.is_some())
            .field("has_serializer", &self.serialize.is_some())
            .finish_non_exhaustive()
    }
}

/// Object type definition.
#[derive(Debug, Clone)]
pub struct ObjectDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, FieldDef>,
    pub implements: Vec<String>,
}

impl ObjectDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: IndexMap::new(),
            implements: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    #[must_use]
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.implements.push(interface.into());
        self
    }
}

/// Interface type definition.
#[derive(Clone)]
pub struct InterfaceDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, FieldDef>,
    pub resolve_type: Option<TypeResolverFn>,
}

impl InterfaceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: IndexMap::new(),
            resolve_type: None,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// Sets the function naming the concrete type of a value.
    #[must_use]
    pub fn with_type_resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.resolve_type = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for InterfaceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceDef")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("has_type_resolver", &self.resolve_type.is_some())
            .finish_non_exhaustive()
    }
}

/// Union type definition.
#[derive(Clone)]
pub struct UnionDef {
    pub name: String,
    pub description: Option<String>,
    pub members: Vec<String>,
    pub resolve_type: Option<TypeResolverFn>,
}

impl UnionDef {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            description: None,
            members: members.into_iter().map(Into::into).collect(),
            resolve_type: None,
        }
    }

    #[must_use]
    pub fn with_type_resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.resolve_type = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for UnionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionDef")
            .field("name", &self.name)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

/// Enum type definition.
#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub description: Option<String>,
    pub values: IndexMap<String, EnumValueDef>,
}

impl EnumDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            values: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.values.insert(
            name.clone(),
            EnumValueDef {
                name,
                description: None,
                deprecation_reason: None,
            },
        );
        self
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Enum value definition.
#[derive(Debug, Clone)]
pub struct EnumValueDef {
    pub name: String,
    pub description: Option<String>,
    pub deprecation_reason: Option<String>,
}

/// Input object type definition.
#[derive(Debug, Clone)]
pub struct InputObjectDef {
    pub name: String,
    pub description: Option<String>,
    pub fields: IndexMap<String, InputFieldDef>,
}

impl InputObjectDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: InputFieldDef) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }
}

/// Inherited state while computing field costs.
#[derive(Debug, Clone, Copy)]
pub struct CostContext {
    /// Product of the multipliers of every enclosing field.
    pub multiplier: u64,
}

/// The cost of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cost {
    pub cost: u64,
    /// Applied to every field selected beneath this one.
    pub multiplier: u64,
}

impl Cost {
    pub const fn constant(cost: u64) -> Self {
        Self {
            cost,
            multiplier: 1,
        }
    }
}

/// How a field's cost is computed during validation.
#[derive(Clone)]
pub enum FieldCost {
    Constant(u64),
    Dynamic(CostFn),
}

impl FieldCost {
    /// A cost function over the field arguments.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&ResolverArgs, &CostContext) -> Cost + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// A connection-like field returning up to `args[arg]` children.
    ///
    /// Costs `cost` itself and multiplies its children by the argument, or by
    /// `default` when the argument is absent.
    pub fn multiplied_by(cost: u64, arg: &'static str, default: u64) -> Self {
        Self::dynamic(move |args, _| Cost {
            cost,
            multiplier: args.get(arg).and_then(Value::as_u64).unwrap_or(default),
        })
    }

    pub fn evaluate(&self, args: &ResolverArgs, ctx: &CostContext) -> Cost {
        match self {
            Self::Constant(cost) => Cost::constant(*cost),
            Self::Dynamic(f) => f(args, ctx),
        }
    }
}

impl Default for FieldCost {
    fn default() -> Self {
        Self::Constant(1)
    }
}

impl fmt::Debug for FieldCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(cost) => f.debug_tuple("Constant").field(cost).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Field definition.
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    pub arguments: IndexMap<String, InputFieldDef>,
    pub deprecation_reason: Option<String>,
    /// Falls back to property lookup on the parent when unset.
    pub resolver: Option<SharedResolver>,
    /// Takes precedence over `resolver` when set.
    pub batch_resolver: Option<Arc<dyn BatchResolver>>,
    pub cost: FieldCost,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            description: None,
            ty,
            arguments: IndexMap::new(),
            deprecation_reason: None,
            resolver: None,
            batch_resolver: None,
            cost: FieldCost::default(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_argument(mut self, argument: InputFieldDef) -> Self {
        self.arguments.insert(argument.name.clone(), argument);
        self
    }

    #[must_use]
    pub fn with_deprecation(mut self, reason: impl Into<String>) -> Self {
        self.deprecation_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: FieldCost) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_resolver<R: Resolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Resolves the field with a function.
    #[must_use]
    pub fn resolve_with<F, R>(self, f: F) -> Self
    where
        F: Fn(&FieldContext<'_>) -> Result<R, ResolverError> + Send + Sync + 'static,
        R: Into<ResolveReturn> + 'static,
    {
        self.with_resolver(FnResolver::new(f))
    }

    /// Resolves every queued occurrence of the field in one call.
    #[must_use]
    pub fn batch_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&[FieldContext<'_>]) -> Vec<Result<ResolveReturn, ResolverError>>
            + Send
            + Sync
            + 'static,
    {
        self.batch_resolver = Some(Arc::new(FnBatchResolver::new(f)));
        self
    }

    /// Makes this a subscription root field fed by `f`.
    ///
    /// Each event becomes the field value.
    #[must_use]
    pub fn subscribe_with<F>(self, f: F) -> Self
    where
        F: Fn(&FieldContext<'_>) -> Result<SourceStream, ResolverError> + Send + Sync + 'static,
    {
        self.with_resolver(StreamResolver::new(f))
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecation_reason.is_some()
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("arguments", &self.arguments)
            .field("has_resolver", &self.resolver.is_some())
            .field("is_batched", &self.batch_resolver.is_some())
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

/// Argument or input field definition.
#[derive(Debug, Clone)]
pub struct InputFieldDef {
    pub name: String,
    pub description: Option<String>,
    pub ty: TypeRef,
    pub default_value: Option<Value>,
}

impl InputFieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            description: None,
            ty,
            default_value: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Non-null without a default: the caller must supply it.
    pub fn is_required(&self) -> bool {
        self.ty.is_non_null() && self.default_value.is_none()
    }
}

/// Type reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Named(String),
    NonNull(Box<TypeRef>),
    List(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn non_null(inner: TypeRef) -> Self {
        Self::NonNull(Box::new(inner))
    }

    pub fn list(inner: TypeRef) -> Self {
        Self::List(Box::new(inner))
    }

    /// The innermost named type.
    pub fn named_type(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::NonNull(inner) | Self::List(inner) => inner.named_type(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, Self::NonNull(_))
    }

    /// The type with one outer non-null wrapper removed.
    pub fn nullable(&self) -> &TypeRef {
        match self {
            Self::NonNull(inner) => inner,
            other => other,
        }
    }

    /// Converts a variable type from a document.
    pub fn from_ast(ty: &quill_syntax::Type) -> Self {
        match ty {
            quill_syntax::Type::Named(name) => Self::named(name.as_str()),
            quill_syntax::Type::List(inner, _) => Self::list(Self::from_ast(inner)),
            quill_syntax::Type::NonNull(inner, _) => Self::non_null(Self::from_ast(inner)),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::NonNull(inner) => write!(f, "{inner}!"),
            Self::List(inner) => write!(f, "[{inner}]"),
        }
    }
}

impl FromStr for TypeRef {
    type Err = SchemaError;

    /// Parses the written form, e.g. `[String!]!`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let invalid = || SchemaError::InvalidTypeRef(s.to_string());
        if let Some(inner) = text.strip_suffix('!') {
            let inner: TypeRef = inner.parse().map_err(|_| invalid())?;
            if inner.is_non_null() {
                return Err(invalid());
            }
            return Ok(Self::non_null(inner));
        }
        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            return inner.parse().map(Self::list).map_err(|_| invalid());
        }
        let is_name = text
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_name {
            Ok(Self::named(text))
        } else {
            Err(invalid())
        }
    }
}

/// Schema builder.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: IndexMap<String, TypeDef>,
    query_type: Option<String>,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    resolvers: ResolverMap,
    duplicates: Vec<String>,
}

impl SchemaBuilder {
    /// Creates a new schema builder with the built-in scalars registered.
    pub fn new() -> Self {
        let mut builder = Self::default();
        for name in ["Int", "Float", "String", "Boolean", "ID"] {
            builder.types.insert(
                name.to_string(),
                TypeDef::Scalar(
                    ScalarDef::new(name).with_description(format!("Built-in {name} scalar")),
                ),
            );
        }
        builder
    }

    /// Sets the query type.
    #[must_use]
    pub fn query_type(mut self, name: impl Into<String>) -> Self {
        self.query_type = Some(name.into());
        self
    }

    /// Sets the mutation type.
    #[must_use]
    pub fn mutation_type(mut self, name: impl Into<String>) -> Self {
        self.mutation_type = Some(name.into());
        self
    }

    /// Sets the subscription type.
    #[must_use]
    pub fn subscription_type(mut self, name: impl Into<String>) -> Self {
        self.subscription_type = Some(name.into());
        self
    }

    /// Adds a type.
    #[must_use]
    pub fn add_type(mut self, type_def: impl Into<TypeDef>) -> Self {
        let type_def = type_def.into();
        let name = type_def.name().to_string();
        if self.types.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            self.types.insert(name, type_def);
        }
        self
    }

    /// Attaches resolvers registered by `Type.field`.
    #[must_use]
    pub fn resolvers(mut self, resolvers: ResolverMap) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Validates the type graph and builds the schema.
    pub fn build(mut self) -> Result<Schema, SchemaError> {
        if let Some(name) = self.duplicates.first() {
            return Err(SchemaError::DuplicateType(name.clone()));
        }

        for (type_name, field_name, resolver) in self.resolvers.iter() {
            let field = match self.types.get_mut(type_name) {
                Some(TypeDef::Object(o)) => o.fields.get_mut(field_name),
                Some(TypeDef::Interface(i)) => i.fields.get_mut(field_name),
                _ => None,
            };
            let Some(field) = field else {
                return Err(SchemaError::UnknownResolverTarget(format!(
                    "{type_name}.{field_name}"
                )));
            };
            field.resolver = Some(Arc::clone(resolver));
        }

        let query_name = match self.query_type.take() {
            Some(name) => name,
            None if self.types.contains_key("Query") => "Query".to_string(),
            None => return Err(SchemaError::MissingQueryType),
        };
        let query_type = self.root(&query_name, "the query root")?;
        let mutation_type = match self.mutation_type.take() {
            Some(name) => Some(self.root(&name, "the mutation root")?),
            None => None,
        };
        let subscription_type = match self.subscription_type.take() {
            Some(name) => Some(self.root(&name, "the subscription root")?),
            None => None,
        };

        for type_def in self.types.values() {
            self.check_type(type_def)?;
        }

        let mut possible_types: FxHashMap<TypeId, Vec<TypeId>> = FxHashMap::default();
        for (index, type_def) in self.types.values().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let id = TypeId(index as u32);
            match type_def {
                TypeDef::Object(object) => {
                    for interface in &object.implements {
                        if let Some(iface) = self.id_of(interface) {
                            possible_types.entry(iface).or_default().push(id);
                        }
                    }
                }
                TypeDef::Union(union) => {
                    let members = union.members.iter().filter_map(|m| self.id_of(m));
                    possible_types.entry(id).or_default().extend(members);
                }
                _ => {}
            }
        }

        Ok(Schema {
            types: self.types,
            query_type,
            mutation_type,
            subscription_type,
            possible_types,
        })
    }

    fn id_of(&self, name: &str) -> Option<TypeId> {
        #[allow(clippy::cast_possible_truncation)]
        self.types.get_index_of(name).map(|i| TypeId(i as u32))
    }

    fn root(&self, name: &str, role: &str) -> Result<TypeId, SchemaError> {
        match self.types.get(name) {
            Some(TypeDef::Object(_)) => self.id_of(name).ok_or(SchemaError::MissingQueryType),
            Some(_) => Err(SchemaError::NotAnObjectType {
                name: name.to_string(),
                role: role.to_string(),
            }),
            None => Err(SchemaError::UnknownType {
                name: name.to_string(),
                referenced_by: role.to_string(),
            }),
        }
    }

    fn lookup(&self, name: &str, referenced_by: impl FnOnce() -> String) -> Result<&TypeDef, SchemaError> {
        self.types.get(name).ok_or_else(|| SchemaError::UnknownType {
            name: name.to_string(),
            referenced_by: referenced_by(),
        })
    }

    fn check_fields(&self, owner: &str, fields: &IndexMap<String, FieldDef>) -> Result<(), SchemaError> {
        for field in fields.values() {
            let field_owner = || format!("{owner}.{}", field.name);
            let target = self.lookup(field.ty.named_type(), field_owner)?;
            if !target.is_output_type() {
                return Err(SchemaError::NotOutputType {
                    ty: field.ty.to_string(),
                    owner: field_owner(),
                });
            }
            for argument in field.arguments.values() {
                self.check_input(&argument.ty, || {
                    format!("{owner}.{}({}:)", field.name, argument.name)
                })?;
            }
        }
        Ok(())
    }

    fn check_input(&self, ty: &TypeRef, owner: impl Fn() -> String) -> Result<(), SchemaError> {
        let target = self.lookup(ty.named_type(), &owner)?;
        if target.is_input_type() {
            Ok(())
        } else {
            Err(SchemaError::NotInputType {
                ty: ty.to_string(),
                owner: owner(),
            })
        }
    }

    fn check_type(&self, type_def: &TypeDef) -> Result<(), SchemaError> {
        match type_def {
            TypeDef::Scalar(_) | TypeDef::Enum(_) => Ok(()),
            TypeDef::Object(object) => {
                self.check_fields(&object.name, &object.fields)?;
                for name in &object.implements {
                    let TypeDef::Interface(interface) =
                        self.lookup(name, || object.name.clone())?
                    else {
                        return Err(SchemaError::NotAnInterface {
                            name: name.clone(),
                            object: object.name.clone(),
                        });
                    };
                    if let Some(missing) = interface
                        .fields
                        .keys()
                        .find(|f| !object.fields.contains_key(*f))
                    {
                        return Err(SchemaError::MissingInterfaceField {
                            object: object.name.clone(),
                            interface: interface.name.clone(),
                            field: missing.clone(),
                        });
                    }
                }
                Ok(())
            }
            TypeDef::Interface(interface) => self.check_fields(&interface.name, &interface.fields),
            TypeDef::Union(union) => {
                for member in &union.members {
                    if !matches!(self.lookup(member, || union.name.clone())?, TypeDef::Object(_)) {
                        return Err(SchemaError::NotAnObjectType {
                            name: member.clone(),
                            role: format!("a member of union `{}`", union.name),
                        });
                    }
                }
                Ok(())
            }
            TypeDef::InputObject(input) => {
                for field in input.fields.values() {
                    self.check_input(&field.ty, || format!("{}.{}", input.name, field.name))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query() -> ObjectDef {
        ObjectDef::new("Query").with_field(FieldDef::new("hello", TypeRef::named("String")))
    }

    #[test]
    fn test_schema_builder() {
        let schema = SchemaBuilder::new()
            .query_type("Query")
            .add_type(query())
            .build()
            .unwrap();

        let query_id = schema.type_id("Query").unwrap();
        assert_eq!(schema.query_type(), query_id);
        assert_eq!(schema.type_def(query_id).name(), "Query");
        assert!(schema.get_type("Int").is_some());
        assert!(schema.get_type("ID").unwrap().is_leaf());
        assert_eq!(schema.root_type(OperationType::Mutation), None);
    }

    #[test]
    fn test_query_type_defaults_to_query() {
        let schema = SchemaBuilder::new().add_type(query()).build().unwrap();
        assert_eq!(schema.type_def(schema.query_type()).name(), "Query");
    }

    #[test]
    fn test_missing_query_type() {
        assert_eq!(
            SchemaBuilder::new().build().unwrap_err(),
            SchemaError::MissingQueryType
        );
    }

    #[test]
    fn test_unknown_field_type() {
        let err = SchemaBuilder::new()
            .add_type(ObjectDef::new("Query").with_field(FieldDef::new("me", TypeRef::named("User"))))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownType {
                name: "User".into(),
                referenced_by: "Query.me".into()
            }
        );
    }

    #[test]
    fn test_input_object_is_not_output() {
        let err = SchemaBuilder::new()
            .add_type(InputObjectDef::new("In").with_field(InputFieldDef::new("a", TypeRef::named("Int"))))
            .add_type(ObjectDef::new("Query").with_field(FieldDef::new("x", TypeRef::named("In"))))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::NotOutputType { .. }));
    }

    #[test]
    fn test_interface_fields_required() {
        let err = SchemaBuilder::new()
            .add_type(InterfaceDef::new("Node").with_field(FieldDef::new(
                "id",
                TypeRef::non_null(TypeRef::named("ID")),
            )))
            .add_type(ObjectDef::new("User").implements("Node"))
            .add_type(query())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingInterfaceField {
                object: "User".into(),
                interface: "Node".into(),
                field: "id".into()
            }
        );
    }

    #[test]
    fn test_possible_types() {
        let id = || FieldDef::new("id", TypeRef::named("ID"));
        let schema = SchemaBuilder::new()
            .add_type(InterfaceDef::new("Node").with_field(id()))
            .add_type(ObjectDef::new("User").implements("Node").with_field(id()))
            .add_type(ObjectDef::new("Post").implements("Node").with_field(id()))
            .add_type(UnionDef::new("Result", ["User"]))
            .add_type(query())
            .build()
            .unwrap();

        let node = schema.type_id("Node").unwrap();
        let user = schema.type_id("User").unwrap();
        let post = schema.type_id("Post").unwrap();
        let result = schema.type_id("Result").unwrap();
        assert_eq!(schema.possible_types(node), &[user, post]);
        assert!(schema.type_applies(result, user));
        assert!(!schema.type_applies(result, post));
        assert!(schema.types_overlap(node, result));
        assert!(!schema.types_overlap(post, result));
    }

    #[test]
    fn test_duplicate_type() {
        let err = SchemaBuilder::new()
            .add_type(query())
            .add_type(query())
            .build()
            .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateType("Query".into()));
    }

    #[test]
    fn test_resolver_map_attaches() {
        let mut resolvers = ResolverMap::new();
        resolvers.register_fn("Query", "hello", |_| Ok(json!("hi")));
        let schema = SchemaBuilder::new()
            .add_type(query())
            .resolvers(resolvers)
            .build()
            .unwrap();
        let field = schema.get_type("Query").unwrap().field("hello").unwrap();
        assert!(field.resolver.is_some());

        let mut unknown = ResolverMap::new();
        unknown.register_fn("Query", "nope", |_| Ok(json!(null)));
        let err = SchemaBuilder::new()
            .add_type(query())
            .resolvers(unknown)
            .build()
            .unwrap_err();
        assert_eq!(err, SchemaError::UnknownResolverTarget("Query.nope".into()));
    }

    #[test]
    fn test_type_ref_parse_and_display() {
        let ty: TypeRef = "[String!]!".parse().unwrap();
        assert_eq!(
            ty,
            TypeRef::non_null(TypeRef::list(TypeRef::non_null(TypeRef::named("String"))))
        );
        assert_eq!(ty.to_string(), "[String!]!");
        assert_eq!(ty.named_type(), "String");
        assert!("Int!!".parse::<TypeRef>().is_err());
        assert!("[Int".parse::<TypeRef>().is_err());
        assert!("".parse::<TypeRef>().is_err());
    }

    #[test]
    fn test_cost_multiplier() {
        let cost = FieldCost::multiplied_by(1, "first", 10);
        let mut args = ResolverArgs::new();
        let ctx = CostContext { multiplier: 1 };
        assert_eq!(cost.evaluate(&args, &ctx), Cost { cost: 1, multiplier: 10 });
        args.set("first", json!(0));
        assert_eq!(cost.evaluate(&args, &ctx).multiplier, 0);
        assert_eq!(FieldCost::default().evaluate(&args, &ctx), Cost::constant(1));
    }
}
