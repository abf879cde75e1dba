//! Handler return values and their normalization into an [`Outcome`].

use std::{any::Any, fmt, future::Future};

use axum::http::StatusCode;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;

use crate::errors::{DispatchError, HandlerError};

/// The uniform result of a dispatch: a status and optional data for the
/// codec. Absent data means a status-only response with no body.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: StatusCode,
    pub data: Option<Value>,
}

impl Outcome {
    pub fn status(status: StatusCode) -> Self {
        Self { status, data: None }
    }

    pub fn with_data(status: StatusCode, data: Value) -> Self {
        Self {
            status,
            data: Some(data),
        }
    }

    /// Serializes `data` into the outcome.
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::with_data(status, serde_json::to_value(data)?))
    }
}

/// What a handler hands back when called.
///
/// The pending variants let a handler return work that is still running;
/// the normalizer awaits it.
pub enum Returned {
    Status(StatusCode),
    Outcome(Outcome),
    PendingStatus(BoxFuture<'static, Result<StatusCode, HandlerError>>),
    PendingOutcome(BoxFuture<'static, Result<Outcome, HandlerError>>),
    /// The handler writes the response itself through its
    /// [`ResponseWriter`](crate::http::ResponseWriter).
    PendingUnit(BoxFuture<'static, Result<(), HandlerError>>),
    /// A value of arbitrary type, inspected at normalization time.
    Opaque {
        type_name: &'static str,
        value: Box<dyn Any + Send>,
    },
}

impl Returned {
    pub fn pending_status<F>(future: F) -> Self
    where
        F: Future<Output = Result<StatusCode, HandlerError>> + Send + 'static,
    {
        Self::PendingStatus(future.boxed())
    }

    pub fn pending_outcome<F>(future: F) -> Self
    where
        F: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
    {
        Self::PendingOutcome(future.boxed())
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::PendingUnit(future.boxed())
    }

    pub fn opaque<T: Any + Send>(value: T) -> Self {
        Self::Opaque {
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Outcome(_) => "outcome",
            Self::PendingStatus(_) => "pending status",
            Self::PendingOutcome(_) => "pending outcome",
            Self::PendingUnit(_) => "pending unit",
            Self::Opaque { type_name, .. } => type_name,
        }
    }
}

impl fmt::Debug for Returned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => f.debug_tuple("Status").field(status).finish(),
            Self::Outcome(outcome) => f.debug_tuple("Outcome").field(outcome).finish(),
            other => f.debug_tuple("Returned").field(&other.shape()).finish(),
        }
    }
}

impl From<StatusCode> for Returned {
    fn from(status: StatusCode) -> Self {
        Self::Status(status)
    }
}

impl From<Outcome> for Returned {
    fn from(outcome: Outcome) -> Self {
        Self::Outcome(outcome)
    }
}

impl From<(StatusCode, Value)> for Returned {
    fn from((status, data): (StatusCode, Value)) -> Self {
        Self::Outcome(Outcome::with_data(status, data))
    }
}

/// Turns a handler's return value into an outcome.
///
/// `Ok(None)` means the handler already wrote the response and nothing
/// more may be written.
pub async fn normalize(returned: Returned, handler: &str) -> Result<Option<Outcome>, DispatchError> {
    let handler_fault = |fault| DispatchError::Handler {
        handler: handler.to_string(),
        fault,
    };

    match returned {
        Returned::Status(status) => Ok(Some(Outcome::status(status))),
        Returned::PendingStatus(pending) => {
            let status = pending.await.map_err(handler_fault)?;
            Ok(Some(Outcome::status(status)))
        }
        Returned::Outcome(outcome) => Ok(Some(outcome)),
        Returned::PendingOutcome(pending) => pending.await.map(Some).map_err(handler_fault),
        Returned::PendingUnit(pending) => pending.await.map(|()| None).map_err(handler_fault),
        Returned::Opaque { type_name, value } => normalize_opaque(value, type_name, handler),
    }
}

fn normalize_opaque(
    value: Box<dyn Any + Send>,
    type_name: &'static str,
    handler: &str,
) -> Result<Option<Outcome>, DispatchError> {
    let value = match value.downcast::<StatusCode>() {
        Ok(status) => return Ok(Some(Outcome::status(*status))),
        Err(value) => value,
    };
    let value = match value.downcast::<u16>() {
        Ok(code) => {
            if let Ok(status) = StatusCode::from_u16(*code) {
                return Ok(Some(Outcome::status(status)));
            }
            return Err(DispatchError::UnsupportedReturn {
                handler: handler.to_string(),
                shape: type_name,
            });
        }
        Err(value) => value,
    };
    let value = match value.downcast::<Outcome>() {
        Ok(outcome) => return Ok(Some(*outcome)),
        Err(value) => value,
    };
    match value.downcast::<(StatusCode, Value)>() {
        Ok(pair) => {
            let (status, data) = *pair;
            Ok(Some(Outcome::with_data(status, data)))
        }
        Err(_) => Err(DispatchError::UnsupportedReturn {
            handler: handler.to_string(),
            shape: type_name,
        }),
    }
}
