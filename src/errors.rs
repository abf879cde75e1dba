use std::{any::Any, fmt};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    BoxError, Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Faults raised while dispatching a single request.
///
/// Every variant is local to the request that produced it; the dispatcher
/// turns it into an error response and keeps serving.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot bind parameter `{param}` from {value:?}: {reason}")]
    Binding {
        param: String,
        value: String,
        reason: String,
    },
    #[error("malformed request body for parameter `{param}`: {reason}")]
    MalformedBody { param: String, reason: String },
    #[error("request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error(
        "unable to resolve dependency `{type_name}` while invoking handler `{handler}`; \
         register it with the dependency resolver"
    )]
    UnresolvedDependency {
        type_name: &'static str,
        handler: String,
    },
    #[error("handler `{handler}` failed: {fault}")]
    Handler { handler: String, fault: HandlerError },
    #[error(
        "handler `{handler}` returned unsupported shape `{shape}`; expected a status code, \
         an outcome, or a pending status, outcome or unit"
    )]
    UnsupportedReturn {
        handler: String,
        shape: &'static str,
    },
    #[error("request was cancelled")]
    Cancelled,
}

/// Coarse classification of a [`DispatchError`], used by logs and observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Binding,
    Dependency,
    Handler,
    UnsupportedReturn,
    Cancelled,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Binding => "binding",
            Self::Dependency => "dependency",
            Self::Handler => "handler",
            Self::UnsupportedReturn => "unsupported_return",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl DispatchError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Binding { .. } | Self::MalformedBody { .. } | Self::PayloadTooLarge { .. } => {
                FaultKind::Binding
            }
            Self::UnresolvedDependency { .. } => FaultKind::Dependency,
            Self::Handler { .. } => FaultKind::Handler,
            Self::UnsupportedReturn { .. } => FaultKind::UnsupportedReturn,
            Self::Cancelled => FaultKind::Cancelled,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Binding { .. } | Self::MalformedBody { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::Handler { fault, .. } => fault
                .status()
                .filter(|status| status.is_client_error() || status.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::UnresolvedDependency { .. } | Self::UnsupportedReturn { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message, details) = match &self {
            Self::Binding { param, value, .. } => (
                "invalid_parameter",
                self.to_string(),
                json!({ "parameter": param, "value": value }),
            ),
            Self::MalformedBody { param, .. } => (
                "malformed_body",
                self.to_string(),
                json!({ "parameter": param }),
            ),
            Self::PayloadTooLarge { limit } => (
                "payload_too_large",
                self.to_string(),
                json!({ "limit": limit }),
            ),
            Self::Cancelled => ("request_cancelled", self.to_string(), json!({})),
            Self::Handler { .. } if !status.is_server_error() => {
                ("handler_error", self.to_string(), json!({}))
            }
            Self::Handler { .. } => (
                "handler_error",
                "internal server error".to_string(),
                json!({}),
            ),
            Self::UnresolvedDependency { .. } => (
                "unresolved_dependency",
                "internal server error".to_string(),
                json!({}),
            ),
            Self::UnsupportedReturn { .. } => (
                "unsupported_return",
                "internal server error".to_string(),
                json!({}),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details,
            }),
        )
            .into_response()
    }
}

/// A fault raised by handler code.
///
/// Wraps the handler's own error unchanged so callers can downcast to the
/// original type. A status may be attached to steer the error response.
pub struct HandlerError {
    status: Option<StatusCode>,
    inner: BoxError,
}

impl HandlerError {
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self {
            status: None,
            inner: err.into(),
        }
    }

    pub fn with_status(status: StatusCode, err: impl Into<BoxError>) -> Self {
        Self {
            status: Some(status),
            inner: err.into(),
        }
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(HandlerPanic(message))
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("status", &self.status)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Panic payload of a handler, captured at the dispatch boundary.
#[derive(Debug, Error)]
#[error("handler panicked: {0}")]
pub struct HandlerPanic(pub String);

/// Rejected route registrations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid HTTP method `{0}`")]
    InvalidMethod(String),
    #[error("route path `{0}` must start with '/'")]
    InvalidPath(String),
}
