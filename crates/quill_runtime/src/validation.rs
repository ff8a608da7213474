//! Document validation and cost accounting.
//!
//! Validation collects every error instead of stopping at the first one.
//! Cost is computed afterwards, once variables are known, and is an upper
//! bound on the number of resolver calls the operation can issue provided
//! list-returning fields declare a multiplier.

use crate::coerce::{coerce_argument_values, Variables};
use crate::collect::{collect_fields, should_include};
use crate::error::{ErrorKind, GraphQLError};
use crate::schema::{CostContext, Schema, TypeId, TypeRef};
use quill_core::{LineIndex, Span};
use quill_syntax::{
    Directive, Document, OperationDefinition, OperationType, Selection, SelectionSet, Value,
    MAX_DEPTH,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Picks the operation to run.
pub fn select_operation<'d>(
    document: &'d Document,
    operation_name: Option<&str>,
) -> Result<&'d OperationDefinition, GraphQLError> {
    let mut operations = document.operations();
    let selected = match operation_name {
        Some(name) => document
            .operations()
            .find(|op| op.name() == Some(name))
            .ok_or_else(|| GraphQLError::new(format!("Unknown operation named \"{name}\"."))),
        None => match (operations.next(), operations.next()) {
            (Some(op), None) => Ok(op),
            (None, _) => Err(GraphQLError::new("Must provide an operation.")),
            (Some(_), Some(_)) => Err(GraphQLError::new(
                "Must provide operation name if query contains multiple operations.",
            )),
        },
    };
    selected.map_err(|e| e.with_kind(ErrorKind::Validate))
}

/// Validates `operation` and the fragments it reaches.
pub fn validate(
    schema: &Schema,
    document: &Document,
    operation: &OperationDefinition,
    lines: &LineIndex,
) -> Vec<GraphQLError> {
    let mut nesting = Nesting {
        document,
        fragments: FxHashMap::default(),
        stack: Vec::new(),
    };
    if nesting.depth(&operation.selection_set, 1).is_err() {
        return vec![GraphQLError::new(format!(
            "Operation is nested too deeply; at most {MAX_DEPTH} levels are allowed."
        ))
        .at(lines, operation.span)
        .with_kind(ErrorKind::Validate)];
    }

    let mut validator = Validator {
        schema,
        document,
        lines,
        errors: Vec::new(),
        variable_usages: Vec::new(),
        visited_fragments: FxHashSet::default(),
        fragment_stack: Vec::new(),
        reported_cycles: FxHashSet::default(),
    };
    validator.validate_fragment_definitions();
    validator.validate_operation(operation);
    validator.errors
}

struct TooDeep;

/// Measures selection set nesting with fragments expanded.
struct Nesting<'a> {
    document: &'a Document,
    /// Depth of each fragment body already measured.
    fragments: FxHashMap<&'a str, usize>,
    stack: Vec<&'a str>,
}

impl<'a> Nesting<'a> {
    /// Depth of `set`, which sits at `level`, counting itself.
    fn depth(&mut self, set: &'a SelectionSet, level: usize) -> Result<usize, TooDeep> {
        if level > MAX_DEPTH {
            return Err(TooDeep);
        }
        let mut deepest = 0;
        for selection in &set.selections {
            let inner = match selection {
                Selection::Field(field) => match &field.selection_set {
                    Some(sub) => self.depth(sub, level + 1)?,
                    None => 0,
                },
                Selection::InlineFragment(inline) => self.depth(&inline.selection_set, level + 1)?,
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    if let Some(&depth) = self.fragments.get(name) {
                        if level + depth > MAX_DEPTH {
                            return Err(TooDeep);
                        }
                        depth
                    } else if self.stack.contains(&name) {
                        // Cycles are reported by the validator.
                        0
                    } else if let Some(fragment) = self.document.fragment(name) {
                        self.stack.push(name);
                        let depth = self.depth(&fragment.selection_set, level + 1);
                        self.stack.pop();
                        let depth = depth?;
                        self.fragments.insert(name, depth);
                        depth
                    } else {
                        0
                    }
                }
            };
            deepest = deepest.max(inner);
        }
        Ok(deepest + 1)
    }
}

struct Validator<'a> {
    schema: &'a Schema,
    document: &'a Document,
    lines: &'a LineIndex,
    errors: Vec<GraphQLError>,
    variable_usages: Vec<(&'a str, Span)>,
    visited_fragments: FxHashSet<&'a str>,
    fragment_stack: Vec<&'a str>,
    reported_cycles: FxHashSet<&'a str>,
}

impl<'a> Validator<'a> {
    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.errors.push(
            GraphQLError::new(message)
                .at(self.lines, span)
                .with_kind(ErrorKind::Validate),
        );
    }

    fn validate_fragment_definitions(&mut self) {
        let mut seen: FxHashMap<&str, ()> = FxHashMap::default();
        for fragment in self.document.fragments() {
            let name = fragment.name.as_str();
            if seen.insert(name, ()).is_some() {
                self.error(
                    format!("There can be only one fragment named \"{name}\"."),
                    fragment.name.span,
                );
            }
            let condition = fragment.type_condition.as_str();
            match self.schema.get_type(condition) {
                None => self.error(
                    format!("Unknown type \"{condition}\"."),
                    fragment.type_condition.span,
                ),
                Some(t) if !t.is_composite() => self.error(
                    format!(
                        "Fragment \"{name}\" cannot condition on non composite type \"{condition}\"."
                    ),
                    fragment.type_condition.span,
                ),
                Some(_) => {}
            }
        }
    }

    fn validate_operation(&mut self, operation: &'a OperationDefinition) {
        let mut defined: FxHashSet<&str> = FxHashSet::default();
        for variable in &operation.variables {
            let name = variable.name.as_str();
            if !defined.insert(name) {
                self.error(
                    format!("There can be only one variable named \"${name}\"."),
                    variable.span,
                );
            }
            let ty = TypeRef::from_ast(&variable.ty);
            match self.schema.get_type(ty.named_type()) {
                Some(t) if t.is_input_type() => {}
                Some(_) => self.error(
                    format!("Variable \"${name}\" cannot be non-input type \"{ty}\"."),
                    variable.ty.span(),
                ),
                None => self.error(format!("Unknown type \"{}\".", ty.named_type()), variable.ty.span()),
            }
            self.validate_directives(&variable.directives);
        }
        self.validate_directives(&operation.directives);

        let Some(root) = self.schema.root_type(operation.operation) else {
            self.error(
                format!("Schema is not configured for {}s.", operation.operation),
                operation.span,
            );
            return;
        };

        self.validate_selection_set(root, &operation.selection_set);

        let usages = std::mem::take(&mut self.variable_usages);
        for (name, span) in usages {
            if !defined.contains(name) {
                let message = match operation.name() {
                    Some(op) => format!("Variable \"${name}\" is not defined by operation \"{op}\"."),
                    None => format!("Variable \"${name}\" is not defined."),
                };
                self.error(message, span);
            }
        }

        if operation.operation == OperationType::Subscription {
            let grouped = collect_fields(
                self.schema,
                self.document,
                root,
                [&operation.selection_set],
                &Variables::new(),
            );
            if grouped.len() > 1 {
                let message = match operation.name() {
                    Some(name) => {
                        format!("Subscription \"{name}\" must select only one top level field.")
                    }
                    None => "Anonymous Subscription must select only one top level field.".to_string(),
                };
                self.error(message, operation.selection_set.span);
            }
        }
    }

    fn validate_directives(&mut self, directives: &'a [Directive]) {
        for directive in directives {
            let name = directive.name.as_str();
            if name == "skip" || name == "include" {
                if directive.argument("if").is_none() {
                    self.error(
                        format!(
                            "Directive \"@{name}\" argument \"if\" of type \"Boolean!\" is required, but it was not provided."
                        ),
                        directive.span,
                    );
                }
            } else {
                self.error(format!("Unknown directive \"@{name}\"."), directive.span);
            }
            for argument in &directive.arguments {
                self.record_variables(&argument.value);
            }
        }
    }

    fn record_variables(&mut self, value: &'a Value) {
        match value {
            Value::Variable(name) => self.variable_usages.push((name.as_str(), name.span)),
            Value::List(items, _) => {
                for item in items {
                    self.record_variables(item);
                }
            }
            Value::Object(fields, _) => {
                for (_, item) in fields {
                    self.record_variables(item);
                }
            }
            _ => {}
        }
    }

    fn validate_selection_set(&mut self, parent: TypeId, set: &'a SelectionSet) {
        let schema = self.schema;
        let parent_def = schema.type_def(parent);

        for selection in &set.selections {
            self.validate_directives(selection.directives());
            match selection {
                Selection::Field(field) => {
                    let name = field.name.as_str();
                    for argument in &field.arguments {
                        self.record_variables(&argument.value);
                    }
                    if name == "__typename" {
                        if let Some(sub) = &field.selection_set {
                            self.error(
                                "Field \"__typename\" must not have a selection since type \"String!\" has no subfields.",
                                sub.span,
                            );
                        }
                        continue;
                    }
                    let Some(def) = parent_def.field(name) else {
                        self.error(
                            format!(
                                "Cannot query field \"{name}\" on type \"{}\".",
                                parent_def.name()
                            ),
                            field.span,
                        );
                        continue;
                    };

                    for argument in &field.arguments {
                        if !def.arguments.contains_key(argument.name.as_str()) {
                            self.error(
                                format!(
                                    "Unknown argument \"{}\" on field \"{}.{name}\".",
                                    argument.name,
                                    parent_def.name()
                                ),
                                argument.span,
                            );
                        }
                    }
                    for (arg_name, arg_def) in &def.arguments {
                        if arg_def.is_required() && field.argument(arg_name).is_none() {
                            self.error(
                                format!(
                                    "Field \"{}.{name}\" argument \"{arg_name}\" of type \"{}\" is required, but it was not provided.",
                                    parent_def.name(),
                                    arg_def.ty
                                ),
                                field.span,
                            );
                        }
                    }

                    let Some(target) = schema.type_id(def.ty.named_type()) else {
                        continue;
                    };
                    let target_def = schema.type_def(target);
                    match (&field.selection_set, target_def.is_leaf()) {
                        (Some(sub), true) => self.error(
                            format!(
                                "Field \"{name}\" must not have a selection since type \"{}\" has no subfields.",
                                def.ty
                            ),
                            sub.span,
                        ),
                        (None, false) => self.error(
                            format!(
                                "Field \"{name}\" of type \"{}\" must have a selection of subfields. Did you mean \"{name} {{ ... }}\"?",
                                def.ty
                            ),
                            field.span,
                        ),
                        (Some(sub), false) => self.validate_selection_set(target, sub),
                        (None, true) => {}
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    let Some(fragment) = self.document.fragment(name) else {
                        self.error(format!("Unknown fragment \"{name}\"."), spread.name.span);
                        continue;
                    };
                    let Some(condition) = schema.type_id(fragment.type_condition.as_str()) else {
                        continue;
                    };
                    if !schema.type_def(condition).is_composite() {
                        continue;
                    }
                    if !schema.types_overlap(parent, condition) {
                        self.error(
                            format!(
                                "Fragment \"{name}\" cannot be spread here as objects of type \"{}\" can never be of type \"{}\".",
                                parent_def.name(),
                                fragment.type_condition
                            ),
                            spread.span,
                        );
                    }
                    if self.fragment_stack.contains(&name) {
                        if self.reported_cycles.insert(name) {
                            self.error(
                                format!("Cannot spread fragment \"{name}\" within itself."),
                                spread.span,
                            );
                        }
                        continue;
                    }
                    if self.visited_fragments.insert(name) {
                        self.validate_directives(&fragment.directives);
                        self.fragment_stack.push(name);
                        self.validate_selection_set(condition, &fragment.selection_set);
                        self.fragment_stack.pop();
                    }
                }
                Selection::InlineFragment(inline) => {
                    let target = match &inline.type_condition {
                        None => parent,
                        Some(condition) => match schema.type_id(condition.as_str()) {
                            None => {
                                self.error(format!("Unknown type \"{condition}\"."), condition.span);
                                continue;
                            }
                            Some(id) if !schema.type_def(id).is_composite() => {
                                self.error(
                                    format!(
                                        "Fragment cannot condition on non composite type \"{condition}\"."
                                    ),
                                    condition.span,
                                );
                                continue;
                            }
                            Some(id) => {
                                if !schema.types_overlap(parent, id) {
                                    self.error(
                                        format!(
                                            "Fragment cannot be spread here as objects of type \"{}\" can never be of type \"{condition}\".",
                                            parent_def.name()
                                        ),
                                        inline.span,
                                    );
                                }
                                id
                            }
                        },
                    };
                    self.validate_selection_set(target, &inline.selection_set);
                }
            }
        }
    }
}

/// Computes the cost of an operation.
///
/// Each field costs its declared cost times the product of the multipliers
/// of its enclosing fields. `__typename` is free and skipped fields cost
/// nothing.
pub fn operation_cost(
    schema: &Schema,
    document: &Document,
    operation: &OperationDefinition,
    variables: &Variables,
) -> u64 {
    let Some(root) = schema.root_type(operation.operation) else {
        return 0;
    };
    let mut costing = Costing {
        schema,
        document,
        variables,
        fragment_stack: Vec::new(),
    };
    costing.selection_set(root, &operation.selection_set, 1)
}

struct Costing<'a> {
    schema: &'a Schema,
    document: &'a Document,
    variables: &'a Variables,
    fragment_stack: Vec<&'a str>,
}

impl<'a> Costing<'a> {
    fn selection_set(&mut self, parent: TypeId, set: &'a SelectionSet, multiplier: u64) -> u64 {
        let schema = self.schema;
        let mut total: u64 = 0;

        for selection in &set.selections {
            if !should_include(selection.directives(), self.variables) {
                continue;
            }
            let cost = match selection {
                Selection::Field(field) => {
                    let Some(def) = schema.type_def(parent).field(field.name.as_str()) else {
                        continue;
                    };
                    let args = coerce_argument_values(
                        schema,
                        &def.arguments,
                        &field.arguments,
                        self.variables,
                        field.span,
                    )
                    .unwrap_or_default();
                    let cost = def.cost.evaluate(&args, &CostContext { multiplier });
                    let own = cost.cost.saturating_mul(multiplier);
                    let children = match (&field.selection_set, schema.type_id(def.ty.named_type())) {
                        (Some(sub), Some(child)) => {
                            self.selection_set(child, sub, multiplier.saturating_mul(cost.multiplier))
                        }
                        _ => 0,
                    };
                    own.saturating_add(children)
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.name.as_str();
                    if self.fragment_stack.contains(&name) {
                        continue;
                    }
                    let Some(fragment) = self.document.fragment(name) else {
                        continue;
                    };
                    let Some(condition) = schema.type_id(fragment.type_condition.as_str()) else {
                        continue;
                    };
                    self.fragment_stack.push(name);
                    let cost = self.selection_set(condition, &fragment.selection_set, multiplier);
                    self.fragment_stack.pop();
                    cost
                }
                Selection::InlineFragment(inline) => {
                    let target = match &inline.type_condition {
                        Some(condition) => match schema.type_id(condition.as_str()) {
                            Some(id) => id,
                            None => continue,
                        },
                        None => parent,
                    };
                    self.selection_set(target, &inline.selection_set, multiplier)
                }
            };
            total = total.saturating_add(cost);
        }

        total
    }
}
