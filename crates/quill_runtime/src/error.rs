//! Response and error types shared by validation and execution.

use indexmap::IndexMap;
use quill_core::{Diagnostic, LineIndex, Location, Span};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Path segment for error locations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Field name.
    Field(String),
    /// List index.
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(name: &str) -> Self {
        Self::Field(name.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Where an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Validate,
    CoerceArgument,
    Resolve,
    NonNullViolation,
}

/// A GraphQL error as it appears in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<IndexMap<String, Value>>,

    #[serde(skip)]
    pub kind: Option<ErrorKind>,
}

impl GraphQLError {
    /// Creates a new error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Adds a source location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    /// Adds the location of a span, resolved through `lines`.
    pub fn at(self, lines: &LineIndex, span: Span) -> Self {
        self.with_location(lines.span_start(span))
    }

    /// Sets the path.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    /// Adds an extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the error code extension.
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.with_extension("code", Value::String(code.into()))
    }

    /// Converts a parse diagnostic.
    pub fn from_diagnostic(diagnostic: &Diagnostic, lines: &LineIndex) -> Self {
        let message = match &diagnostic.message {
            Some(detail) => format!("{}: {detail}", diagnostic.title),
            None => diagnostic.title.clone(),
        };
        Self {
            message,
            locations: diagnostic.locations(lines),
            path: None,
            extensions: None,
            kind: Some(ErrorKind::Parse),
        }
    }
}

impl std::fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GraphQLError {}

/// Execution response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `None` when the request failed before execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Response {
    /// Creates a response with data.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Creates a response that never reached execution.
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self {
            data: None,
            errors,
            extensions: None,
        }
    }

    /// Creates an error response with a single message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::from_errors(vec![GraphQLError::new(message)])
    }

    /// Returns true if there are errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Adds a response extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Errors that stop an execution as a whole.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("execution cancelled")]
    Cancelled,

    #[error("failed to parse document: {}", first_message(.0))]
    Parse(Vec<GraphQLError>),

    #[error("invalid request: {}", first_message(.0))]
    Validation(Vec<GraphQLError>),

    /// The subscription root resolver failed to produce a source stream.
    #[error("{0}")]
    Subscribe(GraphQLError),
}

impl ExecutionError {
    /// Returns the GraphQL errors carried by this error.
    pub fn into_errors(self) -> Vec<GraphQLError> {
        match self {
            Self::Cancelled => vec![GraphQLError::new("execution cancelled")],
            Self::Parse(errors) | Self::Validation(errors) => errors,
            Self::Subscribe(error) => vec![error],
        }
    }
}

fn first_message(errors: &[GraphQLError]) -> &str {
    errors.first().map_or("unknown error", |e| e.message.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_serialization_omits_empty_fields() {
        let error = GraphQLError::new("boom");
        assert_eq!(serde_json::to_value(&error).unwrap(), json!({"message": "boom"}));
    }

    #[test]
    fn test_error_with_path_and_location() {
        let error = GraphQLError::new("boom")
            .with_location(Location::new(1, 3))
            .with_path(vec!["obj".into(), 0.into(), "required".into()])
            .with_code("INTERNAL");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({
                "message": "boom",
                "locations": [{"line": 1, "column": 3}],
                "path": ["obj", 0, "required"],
                "extensions": {"code": "INTERNAL"}
            })
        );
    }

    #[test]
    fn test_response_null_data_is_serialized() {
        let response = Response {
            data: Some(Value::Null),
            errors: vec![GraphQLError::new("x")],
            extensions: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["data"], Value::Null);
        assert!(value.as_object().unwrap().contains_key("data"));
    }

    #[test]
    fn test_request_error_response_has_no_data() {
        let value = serde_json::to_value(Response::error("bad")).unwrap();
        assert_eq!(value, json!({"errors": [{"message": "bad"}]}));
    }
}
