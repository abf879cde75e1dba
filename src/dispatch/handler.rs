//! Handlers and their invocation.

use std::{any::type_name, fmt, sync::Arc};

use axum::http::StatusCode;
use thiserror::Error;

use super::{
    binder::{bind, BoundValue, Param},
    outcome::Returned,
};
use crate::{
    dependency::DependencyResolver,
    errors::{DispatchError, HandlerError},
    http::InvocationContext,
};

type HandlerFn = dyn Fn(Args) -> Result<Returned, HandlerError> + Send + Sync;

/// Misuse of [`Args`] inside a handler body.
#[derive(Debug, Error)]
pub enum ArgError {
    #[error("handler argument {index} does not exist")]
    Missing { index: usize },
    #[error("handler argument {index} (`{name}`) was already taken")]
    Taken { index: usize, name: String },
    #[error("handler argument {index} (`{name}`) is not a `{expected}`")]
    Type {
        index: usize,
        name: String,
        expected: &'static str,
    },
}

/// Bound arguments in declaration order.
pub struct Args {
    names: Vec<String>,
    values: Vec<Option<BoundValue>>,
}

impl Args {
    fn new(names: Vec<String>, values: Vec<BoundValue>) -> Self {
        Self {
            names,
            values: values.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Moves argument `index` out as a `T`.
    ///
    /// Scalar, body and special parameters are taken as their declared
    /// type; injected dependencies are taken as `Arc<T>`.
    pub fn take<T: 'static>(&mut self, index: usize) -> Result<T, ArgError> {
        let name = self
            .names
            .get(index)
            .cloned()
            .ok_or(ArgError::Missing { index })?;
        let value = self.values[index]
            .take()
            .ok_or_else(|| ArgError::Taken {
                index,
                name: name.clone(),
            })?;

        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => {
                self.values[index] = Some(value);
                Err(ArgError::Type {
                    index,
                    name,
                    expected: type_name::<T>(),
                })
            }
        }
    }
}

/// A route handler: a callable plus the binding descriptor of each of its
/// parameters.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    params: Arc<[Param]>,
    call: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(name: impl Into<String>, call: F) -> Self
    where
        F: Fn(Args) -> Result<Returned, HandlerError> + Send + Sync + 'static,
    {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            params: Arc::from(Vec::new()),
            call: Arc::new(call),
        }
    }

    /// A parameterless handler that always answers `status` with no body.
    pub fn status(name: impl Into<String>, status: StatusCode) -> Self {
        Self::new(name, move |_| Ok(Returned::Status(status)))
    }

    /// Appends the next parameter in declaration order.
    pub fn param(mut self, param: Param) -> Self {
        let mut params = self.params.to_vec();
        params.push(param);
        self.params = Arc::from(params);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        for param in params {
            self = self.param(param);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Param] {
        &self.params
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Binds every parameter of `handler` in order, then calls it.
///
/// The handler is not called at all when any parameter fails to bind.
pub async fn invoke(
    handler: &Handler,
    ctx: &InvocationContext,
    resolver: &dyn DependencyResolver,
) -> Result<Returned, DispatchError> {
    let mut names = Vec::with_capacity(handler.params.len());
    let mut values = Vec::with_capacity(handler.params.len());
    for param in handler.params.iter() {
        values.push(bind(param, ctx, resolver, handler.name()).await?);
        names.push(param.name().to_string());
    }

    (handler.call)(Args::new(names, values)).map_err(|fault| DispatchError::Handler {
        handler: handler.name().to_string(),
        fault,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{body::Body, http::Request};

    use super::*;
    use crate::{
        dependency::ServiceRegistry, dispatch::outcome::Returned,
        http::context::tests::context,
    };

    struct Counter(AtomicUsize);

    fn get(uri: &str) -> InvocationContext {
        context(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request build"),
        )
    }

    #[tokio::test]
    async fn arguments_arrive_in_declaration_order() {
        let handler = Handler::new("sum", |mut args| {
            let a: i64 = args.take(0)?;
            let b: i64 = args.take(1)?;
            let label: String = args.take(2)?;
            assert_eq!(label, "total");
            Ok(Returned::Status(StatusCode::from_u16((a * 100 + b) as u16)?))
        })
        .params([
            Param::query::<i64>("a"),
            Param::query::<i64>("b"),
            Param::query::<String>("label"),
        ]);

        let returned = invoke(&handler, &get("/sum?a=2&b=1&label=total"), &ServiceRegistry::new())
            .await
            .expect("invoked");
        assert!(matches!(returned, Returned::Status(status) if status.as_u16() == 201));
    }

    #[tokio::test]
    async fn binding_failure_prevents_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler = Handler::new("count", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Returned::Status(StatusCode::OK))
        })
        .param(Param::query::<i32>("n"))
        .param(Param::injected::<Counter>("counter"));

        let err = invoke(&handler, &get("/count?n=1"), &ServiceRegistry::new())
            .await
            .expect_err("dependency missing");
        assert!(matches!(err, DispatchError::UnresolvedDependency { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn injected_dependency_is_shared_instance() {
        let registry = ServiceRegistry::new().with(Counter(AtomicUsize::new(0)));
        let handler = Handler::new("bump", |mut args| {
            let counter: Arc<Counter> = args.take(0)?;
            counter.0.fetch_add(1, Ordering::SeqCst);
            Ok(Returned::Status(StatusCode::NO_CONTENT))
        })
        .param(Param::infer::<Counter>("counter"));

        for _ in 0..3 {
            invoke(&handler, &get("/bump"), &registry)
                .await
                .expect("invoked");
        }
        let counter = registry.get::<Counter>().expect("registered");
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handler_fault_is_propagated_unchanged() {
        #[derive(Debug, Error)]
        #[error("foo {0} not found")]
        struct FooMissing(i32);

        let handler = Handler::new("get_foo", |mut args| {
            let id: i32 = args.take(0)?;
            Err(FooMissing(id).into())
        })
        .param(Param::query::<i32>("id"));

        let err = invoke(&handler, &get("/foo?id=9"), &ServiceRegistry::new())
            .await
            .expect_err("handler fails");
        match err {
            DispatchError::Handler { handler, fault } => {
                assert_eq!(handler, "get_foo");
                assert_eq!(fault.downcast_ref::<FooMissing>().map(|e| e.0), Some(9));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn take_reports_misuse() {
        let mut args = Args::new(vec!["n".to_string()], vec![Box::new(5_i32)]);
        assert!(matches!(args.take::<String>(0), Err(ArgError::Type { .. })));
        assert_eq!(args.take::<i32>(0).expect("still there"), 5);
        assert!(matches!(args.take::<i32>(0), Err(ArgError::Taken { .. })));
        assert!(matches!(args.take::<i32>(1), Err(ArgError::Missing { index: 1 })));
    }
}
