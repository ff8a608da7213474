//! Typed errors for the server SDK.

use quill_runtime::{ExecutionError, GraphQLError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error codes surfaced to callers and, where relevant, to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Request errors
    BadRequest,
    MethodNotAllowed,
    PayloadTooLarge,
    ParseError,
    ValidationError,

    // Execution errors
    ExecutionError,
    Cancelled,

    // Connection errors
    Unauthorized,
    Forbidden,
    ProtocolError,

    // Server errors
    BindError,
    IoError,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::ParseError => "PARSE_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::BindError => "BIND_ERROR",
            Self::IoError => "IO_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the caller is at fault (4xx equivalent).
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::BadRequest
                | Self::MethodNotAllowed
                | Self::PayloadTooLarge
                | Self::ParseError
                | Self::ValidationError
                | Self::Unauthorized
                | Self::Forbidden
                | Self::ProtocolError
        )
    }

    /// Returns true if this is a server error (5xx equivalent).
    pub const fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::ExecutionError | Self::BindError | Self::IoError | Self::InternalError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDK error: a code plus a human-readable message.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct SdkError {
    pub code: ErrorCode,
    pub message: String,
}

impl SdkError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn is_client_error(&self) -> bool {
        self.code.is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.code.is_server_error()
    }

    /// The error as a GraphQL error carrying its code in `extensions.code`.
    pub fn to_graphql(&self) -> GraphQLError {
        GraphQLError::new(self.message.clone()).with_code(self.code.as_str())
    }
}

impl From<ExecutionError> for SdkError {
    fn from(error: ExecutionError) -> Self {
        let code = match &error {
            ExecutionError::Cancelled => ErrorCode::Cancelled,
            ExecutionError::Parse(_) => ErrorCode::ParseError,
            ExecutionError::Validation(_) => ErrorCode::ValidationError,
            ExecutionError::Subscribe(_) => ErrorCode::ExecutionError,
        };
        Self::new(code, error.to_string())
    }
}

impl From<std::io::Error> for SdkError {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorCode::IoError, error.to_string())
    }
}

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Errors raised while servicing one WebSocket connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported binary frame")]
    Binary,

    #[error("subscriber for {0} already exists")]
    DuplicateId(String),

    #[error("too many initialisation requests")]
    DuplicateInit,

    #[error("connection init rejected: {0}")]
    InitRejected(String),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("write timed out")]
    WriteTimeout,
}
