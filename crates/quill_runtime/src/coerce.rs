//! Input and output coercion.
//!
//! Variables arrive as JSON and argument literals come from the document;
//! both are coerced against the declared input types before a resolver sees
//! them. Leaf values returned by resolvers go through [`serialize_leaf`].

use crate::resolver::ResolverArgs;
use crate::schema::{InputFieldDef, Schema, TypeDef, TypeRef};
use indexmap::IndexMap;
use quill_core::Span;
use quill_syntax as ast;
use serde_json::{Map, Number, Value};

/// Coerced variable values of one operation.
pub type Variables = IndexMap<String, Value>;

/// A value that could not be coerced to its declared type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct CoercionError {
    pub message: String,
    /// Location of the offending literal or declaration, when known.
    pub span: Option<Span>,
}

impl CoercionError {
    fn new(message: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// Coerces request variables against an operation's declarations.
///
/// Defaults are applied and missing non-null variables are reported. Every
/// problem is collected.
pub fn coerce_variable_values(
    schema: &Schema,
    operation: &ast::OperationDefinition,
    inputs: &Map<String, Value>,
) -> Result<Variables, Vec<CoercionError>> {
    let mut coerced = Variables::new();
    let mut errors = Vec::new();

    for definition in &operation.variables {
        let name = definition.name.as_str();
        let ty = TypeRef::from_ast(&definition.ty);
        let span = Some(definition.span);

        match schema.get_type(ty.named_type()) {
            Some(t) if t.is_input_type() => {}
            _ => {
                errors.push(CoercionError::new(
                    format!("Variable \"${name}\" cannot be of non-input type \"{ty}\"."),
                    span,
                ));
                continue;
            }
        }

        match inputs.get(name) {
            None => {
                if let Some(default) = &definition.default_value {
                    match coerce_literal(schema, &ty, default, &Variables::new()) {
                        Ok(value) => {
                            coerced.insert(name.to_string(), value);
                        }
                        Err(e) => errors.push(e),
                    }
                } else if ty.is_non_null() {
                    errors.push(CoercionError::new(
                        format!("Variable \"${name}\" of required type \"{ty}\" was not provided."),
                        span,
                    ));
                }
            }
            Some(value) => match coerce_input_value(schema, &ty, value) {
                Ok(value) => {
                    coerced.insert(name.to_string(), value);
                }
                Err(reason) => errors.push(CoercionError::new(
                    format!("Variable \"${name}\" got invalid value {value}; {reason}"),
                    span,
                )),
            },
        }
    }

    if errors.is_empty() {
        Ok(coerced)
    } else {
        Err(errors)
    }
}

/// Coerces the arguments of one field occurrence.
///
/// `at` is reported when a required argument is missing altogether.
pub fn coerce_argument_values(
    schema: &Schema,
    definitions: &IndexMap<String, InputFieldDef>,
    arguments: &[ast::Argument],
    variables: &Variables,
    at: Span,
) -> Result<ResolverArgs, CoercionError> {
    let mut coerced = ResolverArgs::new();

    for (name, definition) in definitions {
        let provided = arguments.iter().find(|a| a.name.value == *name);
        let value = match provided.map(|a| &a.value) {
            None => None,
            Some(ast::Value::Variable(var)) if !variables.contains_key(var.as_str()) => {
                if definition.default_value.is_none() && definition.ty.is_non_null() {
                    return Err(CoercionError::new(
                        format!(
                            "Argument \"{name}\" of required type \"{}\" was provided the variable \"${var}\" which was not provided a runtime value.",
                            definition.ty
                        ),
                        Some(var.span),
                    ));
                }
                None
            }
            Some(literal) => Some(coerce_literal(schema, &definition.ty, literal, variables).map_err(
                |e| {
                    CoercionError::new(
                        format!("Argument \"{name}\" has invalid value: {}", e.message),
                        e.span.or(Some(literal.span())),
                    )
                },
            )?),
        };

        match value {
            Some(value) => coerced.set(name.clone(), value),
            None => {
                if let Some(default) = &definition.default_value {
                    coerced.set(name.clone(), default.clone());
                } else if definition.ty.is_non_null() {
                    return Err(CoercionError::new(
                        format!(
                            "Argument \"{name}\" of required type \"{}\" was not provided.",
                            definition.ty
                        ),
                        Some(at),
                    ));
                }
            }
        }
    }

    Ok(coerced)
}

/// Coerces a document literal to `ty`, substituting coerced variables.
pub fn coerce_literal(
    schema: &Schema,
    ty: &TypeRef,
    literal: &ast::Value,
    variables: &Variables,
) -> Result<Value, CoercionError> {
    let span = Some(literal.span());

    if let ast::Value::Variable(name) = literal {
        return match variables.get(name.as_str()) {
            Some(Value::Null) if ty.is_non_null() => Err(CoercionError::new(
                format!("Expected non-null value for \"${name}\", found null."),
                span,
            )),
            Some(value) => Ok(value.clone()),
            None if ty.is_non_null() => Err(CoercionError::new(
                format!("Variable \"${name}\" was not provided."),
                span,
            )),
            None => Ok(Value::Null),
        };
    }

    match ty {
        TypeRef::NonNull(inner) => {
            if matches!(literal, ast::Value::Null(_)) {
                return Err(CoercionError::new(
                    format!("Expected value of type \"{ty}\", found null."),
                    span,
                ));
            }
            coerce_literal(schema, inner, literal, variables)
        }
        _ if matches!(literal, ast::Value::Null(_)) => Ok(Value::Null),
        TypeRef::List(inner) => match literal {
            ast::Value::List(items, _) => items
                .iter()
                .map(|item| coerce_literal(schema, inner, item, variables))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            single => Ok(Value::Array(vec![coerce_literal(
                schema, inner, single, variables,
            )?])),
        },
        TypeRef::Named(name) => match schema.get_type(name) {
            Some(TypeDef::Scalar(scalar)) => {
                let result = match builtin_literal(name, literal) {
                    Some(result) => result,
                    None => {
                        let raw = literal_to_json(literal, variables);
                        match &scalar.coerce_input {
                            Some(coerce) => coerce(&raw),
                            None => Ok(raw),
                        }
                    }
                };
                result.map_err(|reason| CoercionError::new(reason, span))
            }
            Some(TypeDef::Enum(def)) => match literal {
                ast::Value::Enum(value) if def.has_value(value.as_str()) => {
                    Ok(Value::String(value.value.clone()))
                }
                other => Err(CoercionError::new(
                    format!(
                        "Enum \"{}\" cannot represent value: {}",
                        def.name,
                        literal_to_json(other, variables)
                    ),
                    span,
                )),
            },
            Some(TypeDef::InputObject(def)) => {
                let ast::Value::Object(fields, _) = literal else {
                    return Err(CoercionError::new(
                        format!("Expected type \"{}\" to be an object.", def.name),
                        span,
                    ));
                };
                if let Some((unknown, _)) = fields
                    .iter()
                    .find(|(field, _)| !def.fields.contains_key(field.as_str()))
                {
                    return Err(CoercionError::new(
                        format!(
                            "Field \"{unknown}\" is not defined by type \"{}\".",
                            def.name
                        ),
                        Some(unknown.span),
                    ));
                }
                let mut object = Map::new();
                for (field_name, field_def) in &def.fields {
                    let provided = fields
                        .iter()
                        .find(|(field, _)| field.as_str() == field_name)
                        .map(|(_, value)| value)
                        .filter(|value| match value {
                            ast::Value::Variable(var) => variables.contains_key(var.as_str()),
                            _ => true,
                        });
                    match provided {
                        Some(value) => {
                            object.insert(
                                field_name.clone(),
                                coerce_literal(schema, &field_def.ty, value, variables)?,
                            );
                        }
                        None => {
                            if let Some(default) = &field_def.default_value {
                                object.insert(field_name.clone(), default.clone());
                            } else if field_def.ty.is_non_null() {
                                return Err(CoercionError::new(
                                    format!(
                                        "Field \"{}.{field_name}\" of required type \"{}\" was not provided.",
                                        def.name, field_def.ty
                                    ),
                                    span,
                                ));
                            }
                        }
                    }
                }
                Ok(Value::Object(object))
            }
            _ => Err(CoercionError::new(
                format!("Unknown input type \"{name}\"."),
                span,
            )),
        },
    }
}

/// Coerces a JSON input value (a variable) to `ty`.
pub fn coerce_input_value(schema: &Schema, ty: &TypeRef, value: &Value) -> Result<Value, String> {
    match ty {
        TypeRef::NonNull(inner) => {
            if value.is_null() {
                return Err(format!("Expected non-nullable type \"{ty}\" not to be null."));
            }
            coerce_input_value(schema, inner, value)
        }
        _ if value.is_null() => Ok(Value::Null),
        TypeRef::List(inner) => match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    coerce_input_value(schema, inner, item).map_err(|e| format!("{e} At index {i}."))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            single => Ok(Value::Array(vec![coerce_input_value(schema, inner, single)?])),
        },
        TypeRef::Named(name) => match schema.get_type(name) {
            Some(TypeDef::Scalar(scalar)) => match builtin_json(name, value) {
                Some(result) => result,
                None => match &scalar.coerce_input {
                    Some(coerce) => coerce(value),
                    None => Ok(value.clone()),
                },
            },
            Some(TypeDef::Enum(def)) => match value {
                Value::String(s) if def.has_value(s) => Ok(value.clone()),
                other => Err(format!("Enum \"{}\" cannot represent value: {other}", def.name)),
            },
            Some(TypeDef::InputObject(def)) => {
                let Value::Object(fields) = value else {
                    return Err(format!("Expected type \"{}\" to be an object.", def.name));
                };
                if let Some(unknown) = fields.keys().find(|k| !def.fields.contains_key(*k)) {
                    return Err(format!(
                        "Field \"{unknown}\" is not defined by type \"{}\".",
                        def.name
                    ));
                }
                let mut object = Map::new();
                for (field_name, field_def) in &def.fields {
                    match fields.get(field_name) {
                        Some(v) => {
                            let coerced = coerce_input_value(schema, &field_def.ty, v)
                                .map_err(|e| format!("{e} At \"{field_name}\"."))?;
                            object.insert(field_name.clone(), coerced);
                        }
                        None => {
                            if let Some(default) = &field_def.default_value {
                                object.insert(field_name.clone(), default.clone());
                            } else if field_def.ty.is_non_null() {
                                return Err(format!(
                                    "Field \"{field_name}\" of required type \"{}\" was not provided.",
                                    field_def.ty
                                ));
                            }
                        }
                    }
                }
                Ok(Value::Object(object))
            }
            _ => Err(format!("Unknown input type \"{name}\".")),
        },
    }
}

/// Serializes a resolved leaf value for a scalar or enum type.
pub fn serialize_leaf(type_def: &TypeDef, value: &Value) -> Result<Value, String> {
    match type_def {
        TypeDef::Scalar(scalar) => match scalar.name.as_str() {
            "Int" => as_i32(value)
                .map(Value::from)
                .ok_or_else(|| format!("Int cannot represent non-integer value: {value}")),
            "Float" => value
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("Float cannot represent non numeric value: {value}")),
            "String" => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(format!("String cannot represent value: {other}")),
            },
            "Boolean" => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(format!("Boolean cannot represent a non boolean value: {other}")),
            },
            "ID" => id_value(value).ok_or_else(|| format!("ID cannot represent value: {value}")),
            _ => match &scalar.serialize {
                Some(serialize) => serialize(value),
                None => Ok(value.clone()),
            },
        },
        TypeDef::Enum(def) => match value {
            Value::String(s) if def.has_value(s) => Ok(value.clone()),
            other => Err(format!("Enum \"{}\" cannot represent value: {other}", def.name)),
        },
        other => Err(format!("\"{}\" is not a leaf type", other.name())),
    }
}

fn as_i32(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    let int = match n.as_i64() {
        Some(i) => i,
        None => {
            let f = n.as_f64()?;
            if f.fract() != 0.0 {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let truncated = f as i64;
            truncated
        }
    };
    i32::try_from(int).ok().map(i64::from)
}

fn id_value(value: &Value) -> Option<Value> {
    match value {
        Value::String(_) => Some(value.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(Value::String(n.to_string())),
        _ => None,
    }
}

fn builtin_json(name: &str, value: &Value) -> Option<Result<Value, String>> {
    let result = match name {
        "Int" => as_i32(value)
            .map(Value::from)
            .ok_or_else(|| format!("Int cannot represent non 32-bit signed integer value: {value}")),
        "Float" => match value {
            Value::Number(_) => Ok(value.clone()),
            other => Err(format!("Float cannot represent non numeric value: {other}")),
        },
        "String" => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(format!("String cannot represent a non string value: {other}")),
        },
        "Boolean" => match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(format!("Boolean cannot represent a non boolean value: {other}")),
        },
        "ID" => id_value(value).ok_or_else(|| format!("ID cannot represent value: {value}")),
        _ => return None,
    };
    Some(result)
}

fn builtin_literal(name: &str, literal: &ast::Value) -> Option<Result<Value, String>> {
    let result = match (name, literal) {
        ("Int", ast::Value::Int(i, _)) => i32::try_from(*i)
            .map(Value::from)
            .map_err(|_| format!("Int cannot represent non 32-bit signed integer value: {i}")),
        ("Float", ast::Value::Int(i, _)) => {
            #[allow(clippy::cast_precision_loss)]
            let f = *i as f64;
            Ok(Value::from(f))
        }
        ("Float", ast::Value::Float(f, _)) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| format!("Float cannot represent value: {f}")),
        ("String", ast::Value::String(s, _)) => Ok(Value::String(s.clone())),
        ("Boolean", ast::Value::Boolean(b, _)) => Ok(Value::Bool(*b)),
        ("ID", ast::Value::String(s, _)) => Ok(Value::String(s.clone())),
        ("ID", ast::Value::Int(i, _)) => Ok(Value::String(i.to_string())),
        ("Int" | "Float" | "String" | "Boolean" | "ID", other) => Err(format!(
            "{name} cannot represent value: {}",
            literal_to_json(other, &Variables::new())
        )),
        _ => return None,
    };
    Some(result)
}

/// Converts a literal to JSON without type information.
pub fn literal_to_json(literal: &ast::Value, variables: &Variables) -> Value {
    match literal {
        ast::Value::Variable(name) => variables.get(name.as_str()).cloned().unwrap_or(Value::Null),
        ast::Value::Int(i, _) => Value::from(*i),
        ast::Value::Float(f, _) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        ast::Value::String(s, _) => Value::String(s.clone()),
        ast::Value::Boolean(b, _) => Value::Bool(*b),
        ast::Value::Null(_) => Value::Null,
        ast::Value::Enum(name) => Value::String(name.value.clone()),
        ast::Value::List(items, _) => Value::Array(
            items
                .iter()
                .map(|item| literal_to_json(item, variables))
                .collect(),
        ),
        ast::Value::Object(fields, _) => Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.value.clone(), literal_to_json(value, variables)))
                .collect(),
        ),
    }
}
