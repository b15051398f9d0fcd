//! Error types, wire status conversion and HTTP response conversion

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace attached to structured error details
pub const ERROR_NAMESPACE: &str = "console/internal/events";

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// gRPC-style status codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// The operation was cancelled
    Canceled = 1,
    /// Client supplied an invalid argument
    InvalidArgument = 3,
    /// Deadline expired before completion
    DeadlineExceeded = 4,
    /// Entity not found
    NotFound = 5,
    /// Entity already exists
    AlreadyExists = 6,
    /// Caller lacks the required rights
    PermissionDenied = 7,
    /// Quota or rate limit exhausted
    ResourceExhausted = 8,
    /// System not in a state required for the operation
    FailedPrecondition = 9,
    /// Internal invariant broken
    Internal = 13,
    /// Service currently unavailable
    Unavailable = 14,
    /// No valid credentials
    Unauthenticated = 16,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Canceled => "canceled",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// Main error type for the gateway
///
/// Status variants carry a stable machine-readable `name` (e.g.
/// `already_subscribed`) next to the formatted message. The type is `Clone`
/// so a single cancellation cause can be observed by every connection task.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Arc<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Malformed request, identifier or pattern
    #[error("{message}")]
    InvalidArgument { name: &'static str, message: String },

    /// Subscription ID already in use
    #[error("{message}")]
    AlreadyExists { name: &'static str, message: String },

    /// Subscription ID not in use
    #[error("{message}")]
    NotFound { name: &'static str, message: String },

    /// Caller lacks rights, or authentication lapsed
    #[error("{message}")]
    PermissionDenied { name: &'static str, message: String },

    /// Missing or invalid credentials
    #[error("{message}")]
    Unauthenticated { name: &'static str, message: String },

    /// Rate limit exhausted
    #[error("{message}")]
    ResourceExhausted {
        name: &'static str,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Unexpected internal state
    #[error("{message}")]
    Internal { name: &'static str, message: String },

    /// Collaborator temporarily unavailable
    #[error("{message}")]
    Unavailable { name: &'static str, message: String },

    /// Operation not allowed in the current state
    #[error("{message}")]
    FailedPrecondition { name: &'static str, message: String },

    /// Context cancelled
    #[error("context canceled")]
    Canceled,

    /// Context deadline exceeded
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The peer closed the WebSocket
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(name: &'static str, message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            name,
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(name: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            name,
            message: message.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(name: &'static str, message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            name,
            message: message.into(),
        }
    }

    /// Create an unauthenticated error
    pub fn unauthenticated(name: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthenticated {
            name,
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(
        name: &'static str,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::ResourceExhausted {
            name,
            message: message.into(),
            retry_after,
        }
    }

    /// Create an internal error
    pub fn internal(name: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            name,
            message: message.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(name: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            name,
            message: message.into(),
        }
    }

    /// Create a failed precondition error
    pub fn failed_precondition(name: &'static str, message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            name,
            message: message.into(),
        }
    }

    /// Status code of this error
    pub fn code(&self) -> Code {
        match self {
            Self::Config(_) | Self::Internal { .. } => Code::Internal,
            Self::Io(_) | Self::Unavailable { .. } => Code::Unavailable,
            Self::InvalidArgument { .. } => Code::InvalidArgument,
            Self::AlreadyExists { .. } => Code::AlreadyExists,
            Self::NotFound { .. } => Code::NotFound,
            Self::PermissionDenied { .. } => Code::PermissionDenied,
            Self::Unauthenticated { .. } => Code::Unauthenticated,
            Self::ResourceExhausted { .. } => Code::ResourceExhausted,
            Self::FailedPrecondition { .. } => Code::FailedPrecondition,
            Self::Canceled | Self::ConnectionClosed => Code::Canceled,
            Self::DeadlineExceeded => Code::DeadlineExceeded,
        }
    }

    /// Machine-readable error name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::InvalidArgument { name, .. }
            | Self::AlreadyExists { name, .. }
            | Self::NotFound { name, .. }
            | Self::PermissionDenied { name, .. }
            | Self::Unauthenticated { name, .. }
            | Self::ResourceExhausted { name, .. }
            | Self::Internal { name, .. }
            | Self::Unavailable { name, .. }
            | Self::FailedPrecondition { name, .. } => name,
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ConnectionClosed => "connection_closed",
        }
    }

    /// Whether this error marks an orderly shutdown rather than a failure
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Canceled | Self::ConnectionClosed)
    }

    /// Whether this error is a rights denial (as opposed to an infrastructure failure)
    pub fn is_rights_denial(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::Unauthenticated { .. }
        )
    }

    /// Structured status carried by `error` envelopes
    pub fn details(&self) -> ErrorDetails {
        let mut attributes = serde_json::Map::new();
        if let Self::ResourceExhausted {
            retry_after: Some(retry_after),
            ..
        } = self
        {
            attributes.insert(
                "retry_after_ms".to_string(),
                serde_json::Value::from(retry_after.as_millis() as u64),
            );
        }

        ErrorDetails {
            code: self.code() as u32,
            message: self.to_string(),
            details: vec![ErrorDetail {
                namespace: ERROR_NAMESPACE.to_string(),
                name: self.name().to_string(),
                attributes,
            }],
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.code() {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists => StatusCode::CONFLICT,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::Canceled | Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Structured status as carried by the protocol `error` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Numeric status code
    pub code: u32,

    /// Human-readable message
    pub message: String,

    /// Optional structured details
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

/// A single structured error detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error namespace
    pub namespace: String,

    /// Error name within the namespace
    pub name: String,

    /// Error attributes
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// HTTP error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Error code
    pub code: String,

    /// HTTP status code
    pub status: u16,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't expose internal details on the HTTP surface
        let message = match self.code() {
            Code::Internal | Code::Unavailable | Code::Canceled => {
                tracing::error!(error = %self, name = self.name(), "Request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            error: message,
            code: self.name().to_uppercase(),
            status: status.as_u16(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::ResourceExhausted {
            retry_after: Some(retry_after),
            ..
        } = &self
        {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
