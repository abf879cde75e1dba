//! The per-request dispatch loop.
//!
//! Every request walks the same stages:
//!
//! ```text
//! Received -> Routed -> Invoking -> Normalizing -> Responding -> Closed
//!                          |             |
//!                          +--> Faulted <+--> Closed
//! ```
//!
//! A fault in one request is answered with an error response and never
//! affects any other request.

use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::ConnectInfo,
    http::{request::Parts, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    BoxError,
};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::trace;

use super::{
    handler::{invoke, Handler},
    outcome::{normalize, Outcome},
    routes::RouteTable,
};
use crate::{
    auth::{Principal, PrincipalSource},
    codec::{BodyCodec, JsonCodec},
    dependency::{DependencyResolver, ServiceRegistry},
    errors::{DispatchError, HandlerError},
    http::InvocationContext,
    logging::{log_event, DispatchEvent, DispatchObserver, EventKind},
};

pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

type Encoded = (StatusCode, Option<(Vec<u8>, HeaderValue)>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Routed,
    Invoking,
    Normalizing,
    Responding,
    Closed,
    Faulted,
}

impl Stage {
    pub fn can_advance_to(self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Routed)
                | (Self::Routed, Self::Invoking)
                | (Self::Invoking, Self::Normalizing)
                | (Self::Normalizing, Self::Responding)
                | (Self::Responding, Self::Closed)
                | (Self::Invoking | Self::Normalizing, Self::Faulted)
                | (Self::Faulted, Self::Closed)
        )
    }
}

struct StageTracker {
    stage: Stage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal stage transition {:?} -> {:?}",
            self.stage,
            next
        );
        trace!(from = ?self.stage, to = ?next, "dispatch stage");
        self.stage = next;
    }
}

struct Inner {
    routes: RouteTable,
    resolver: Arc<dyn DependencyResolver>,
    codec: Arc<dyn BodyCodec>,
    principals: Option<Arc<dyn PrincipalSource>>,
    observer: Option<Arc<dyn DispatchObserver>>,
    max_body_bytes: usize,
    request_timeout: Option<Duration>,
}

/// Routes each request to its handler, binds and invokes it, normalizes
/// what it returns and writes the response.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub struct DispatcherBuilder {
    routes: RouteTable,
    resolver: Arc<dyn DependencyResolver>,
    codec: Arc<dyn BodyCodec>,
    principals: Option<Arc<dyn PrincipalSource>>,
    observer: Option<Arc<dyn DispatchObserver>>,
    max_body_bytes: usize,
    request_timeout: Option<Duration>,
}

impl DispatcherBuilder {
    pub fn resolver(mut self, resolver: impl DependencyResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn codec(mut self, codec: impl BodyCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn principal_source(mut self, source: impl PrincipalSource + 'static) -> Self {
        self.principals = Some(Arc::new(source));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Cancels and answers 408 for requests whose handler runs longer.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                routes: self.routes,
                resolver: self.resolver,
                codec: self.codec,
                principals: self.principals,
                observer: self.observer,
                max_body_bytes: self.max_body_bytes,
                request_timeout: self.request_timeout,
            }),
        }
    }
}

impl Dispatcher {
    pub fn builder(routes: RouteTable) -> DispatcherBuilder {
        DispatcherBuilder {
            routes,
            resolver: Arc::new(ServiceRegistry::new()),
            codec: Arc::new(JsonCodec::default()),
            principals: None,
            observer: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout: None,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    /// Never fails: faults become error responses. Dropping the returned
    /// future cancels the request's [`CancellationToken`].
    pub async fn dispatch(&self, request: Request<Body>) -> Response {
        let started = Instant::now();
        let mut tracker = StageTracker::new();

        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (mut parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();

        let mut event = DispatchEvent::new(EventKind::Received, parts.method.clone(), path.clone());
        event.remote_addr = remote_addr;
        self.emit(&event);

        let principal = match parts.extensions.remove::<Principal>() {
            Some(principal) => Some(principal),
            None => self.authenticate(&parts).await,
        };

        let (handler, matched) = self.inner.routes.lookup(parts.method.as_str(), &path);
        let handler = Arc::clone(handler);
        tracker.advance(Stage::Routed);
        trace!(handler = handler.name(), matched, "route resolved");
        event.handler = Some(handler.name().to_string());

        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let ctx = InvocationContext::new(
            parts,
            body,
            remote_addr,
            principal,
            cancel.clone(),
            Arc::clone(&self.inner.codec),
            self.inner.max_body_bytes,
        );

        let response = match self.run(&handler, &ctx, &mut tracker, started).await {
            Ok(encoded) => {
                tracker.advance(Stage::Responding);
                if let Some((status, body)) = encoded {
                    ctx.response().apply(status, body);
                }
                let response = ctx.response().take_response();
                event.kind = EventKind::ResponseSent;
                response
            }
            Err(err) => {
                tracker.advance(Stage::Faulted);
                if matches!(err, DispatchError::Cancelled) {
                    cancel.cancel();
                }
                event.kind = EventKind::Faulted(err.kind());
                event.error = Some(err.to_string());
                err.into_response()
            }
        };

        tracker.advance(Stage::Closed);
        event.status = Some(response.status());
        event.elapsed = started.elapsed();
        event.at = chrono::Utc::now();
        self.emit(&event);
        response
    }

    async fn authenticate(&self, parts: &Parts) -> Option<Principal> {
        match &self.inner.principals {
            Some(source) => source.authenticate(parts).await,
            None => None,
        }
    }

    /// Invokes and normalizes, then encodes the outcome so that writing the
    /// response cannot fail.
    async fn run(
        &self,
        handler: &Handler,
        ctx: &InvocationContext,
        tracker: &mut StageTracker,
        started: Instant,
    ) -> Result<Option<Encoded>, DispatchError> {
        let deadline = self.inner.request_timeout.map(|timeout| started + timeout);
        let resolver = self.inner.resolver.as_ref();

        tracker.advance(Stage::Invoking);
        let returned = guarded(invoke(handler, ctx, resolver), handler.name(), deadline).await?;

        tracker.advance(Stage::Normalizing);
        let outcome = guarded(normalize(returned, handler.name()), handler.name(), deadline).await?;

        outcome
            .map(|outcome| self.encode(outcome, handler.name()))
            .transpose()
    }

    fn encode(
        &self,
        outcome: Outcome,
        handler: &str,
    ) -> Result<Encoded, DispatchError> {
        let Some(data) = outcome.data else {
            return Ok((outcome.status, None));
        };

        let codec = self.inner.codec.as_ref();
        let encode_fault = |err: BoxError| DispatchError::Handler {
            handler: handler.to_string(),
            fault: HandlerError::new(err),
        };
        let bytes = codec.encode(&data).map_err(|err| encode_fault(err.into()))?;
        let content_type =
            HeaderValue::from_str(codec.content_type()).map_err(|err| encode_fault(err.into()))?;
        Ok((outcome.status, Some((bytes, content_type))))
    }

    fn emit(&self, event: &DispatchEvent) {
        log_event(event);
        if let Some(observer) = &self.inner.observer {
            observer.on_event(event);
        }
    }
}

/// Runs one stage behind the panic boundary and the request deadline.
async fn guarded<T, F>(stage: F, handler: &str, deadline: Option<Instant>) -> Result<T, DispatchError>
where
    F: Future<Output = Result<T, DispatchError>>,
{
    let caught = AssertUnwindSafe(stage).catch_unwind();
    let result = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, caught).await {
            Ok(result) => result,
            Err(_) => return Err(DispatchError::Cancelled),
        },
        None => caught.await,
    };

    result.unwrap_or_else(|payload| {
        Err(DispatchError::Handler {
            handler: handler.to_string(),
            fault: HandlerError::panicked(payload),
        })
    })
}

impl<B> Service<Request<B>> for Dispatcher
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let dispatcher = self.clone();
        let request = request.map(Body::new);
        async move { Ok(dispatcher.dispatch(request).await) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::header;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        dispatch::{binder::Param, outcome::Returned},
        errors::{FaultKind, HandlerPanic},
        http::ResponseWriter,
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DispatchEvent>>);

    impl DispatchObserver for Recorder {
        fn on_event(&self, event: &DispatchEvent) {
            self.0.lock().expect("recorder lock").push(event.clone());
        }
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request build")
    }

    async fn body_bytes(response: Response) -> Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
    }

    #[test]
    fn stage_transitions_follow_the_lifecycle() {
        assert!(Stage::Received.can_advance_to(Stage::Routed));
        assert!(Stage::Invoking.can_advance_to(Stage::Faulted));
        assert!(Stage::Normalizing.can_advance_to(Stage::Faulted));
        assert!(Stage::Faulted.can_advance_to(Stage::Closed));
        assert!(!Stage::Received.can_advance_to(Stage::Invoking));
        assert!(!Stage::Responding.can_advance_to(Stage::Faulted));
        assert!(!Stage::Closed.can_advance_to(Stage::Received));
    }

    #[tokio::test]
    async fn status_outcome_has_empty_body() {
        let routes = RouteTable::builder()
            .get("/ping", Handler::status("ping", StatusCode::NO_CONTENT))
            .expect("valid route")
            .build();
        let response = Dispatcher::builder(routes)
            .build()
            .dispatch(request("GET", "/ping"))
            .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn outcome_data_is_encoded_with_the_codec() {
        let routes = RouteTable::builder()
            .get(
                "/foo",
                Handler::new("list_foo", |_| {
                    Ok((StatusCode::OK, json!([{"bar": 1}])).into())
                }),
            )
            .expect("valid route")
            .build();
        let response = Dispatcher::builder(routes)
            .codec(JsonCodec::new(false))
            .build()
            .dispatch(request("GET", "/foo"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        assert_eq!(body_bytes(response).await, r#"[{"bar":1}]"#);
    }

    #[tokio::test]
    async fn handler_written_response_is_left_alone() {
        let routes = RouteTable::builder()
            .get(
                "/hello",
                Handler::new("hello", |mut args| {
                    let response: ResponseWriter = args.take(0)?;
                    Ok(Returned::pending(async move {
                        response.set_status(StatusCode::ACCEPTED);
                        response.write_text("hello")?;
                        Ok::<_, HandlerError>(())
                    }))
                })
                .param(Param::infer::<ResponseWriter>("response")),
            )
            .expect("valid route")
            .build();
        let response = Dispatcher::builder(routes)
            .build()
            .dispatch(request("GET", "/hello"))
            .await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_bytes(response).await, "hello");
    }

    #[tokio::test]
    async fn outcome_replaces_partial_handler_output() {
        let routes = RouteTable::builder()
            .get(
                "/foo",
                Handler::new("list_foo", |mut args| {
                    let response: ResponseWriter = args.take(0)?;
                    response.write_text("partial")?;
                    Ok((StatusCode::OK, json!({"a": 1})).into())
                })
                .param(Param::infer::<ResponseWriter>("response")),
            )
            .expect("valid route")
            .build();
        let response = Dispatcher::builder(routes)
            .codec(JsonCodec::new(false))
            .build()
            .dispatch(request("GET", "/foo"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        assert_eq!(body_bytes(response).await, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn success_status_on_handler_fault_becomes_internal_error() {
        let routes = RouteTable::builder()
            .get(
                "/foo",
                Handler::new("list_foo", |_| {
                    Err(HandlerError::with_status(StatusCode::OK, "boom"))
                }),
            )
            .expect("valid route")
            .build();
        let response = Dispatcher::builder(routes)
            .build()
            .dispatch(request("GET", "/foo"))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("json error body");
        assert_eq!(body["code"], "handler_error");
    }

    #[tokio::test]
    async fn panic_is_contained_to_its_request() {
        let routes = RouteTable::builder()
            .get("/boom", Handler::new("boom", |_| panic!("kaboom")))
            .and_then(|b| b.get("/ok", Handler::status("ok", StatusCode::OK)))
            .expect("valid routes")
            .build();
        let dispatcher = Dispatcher::builder(routes).build();

        let response = dispatcher.dispatch(request("GET", "/boom")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).expect("json error body");
        assert_eq!(body["code"], "handler_error");

        let response = dispatcher.dispatch(request("GET", "/ok")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pending_panic_is_caught_during_normalization() {
        let routes = RouteTable::builder()
            .get(
                "/late",
                Handler::new("late", |_| {
                    Ok(Returned::pending_status(async {
                        if true {
                            panic!("late kaboom");
                        }
                        Ok::<_, HandlerError>(StatusCode::OK)
                    }))
                }),
            )
            .expect("valid route")
            .build();
        let recorder = Arc::new(Recorder::default());
        let response = Dispatcher::builder(routes)
            .observer(recorder.clone())
            .build()
            .dispatch(request("GET", "/late"))
            .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let events = recorder.0.lock().expect("recorder lock");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Faulted(FaultKind::Handler));
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_observes_cancellation() {
        let observed = Arc::new(Mutex::new(None::<CancellationToken>));
        let slot = Arc::clone(&observed);
        let routes = RouteTable::builder()
            .get(
                "/slow",
                Handler::new("slow", move |mut args| {
                    let cancel: CancellationToken = args.take(0)?;
                    *slot.lock().expect("slot lock") = Some(cancel);
                    Ok(Returned::pending_status(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, HandlerError>(StatusCode::OK)
                    }))
                })
                .param(Param::infer::<CancellationToken>("cancel")),
            )
            .expect("valid route")
            .build();
        let response = Dispatcher::builder(routes)
            .request_timeout(Some(Duration::from_millis(20)))
            .build()
            .dispatch(request("GET", "/slow"))
            .await;

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let token = observed.lock().expect("slot lock").take().expect("token bound");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn principal_comes_from_extension_or_source() {
        use crate::auth::BearerTokens;

        let routes = RouteTable::builder()
            .get(
                "/me",
                Handler::new("me", |mut args| {
                    let principal: Option<Principal> = args.take(0)?;
                    let name = principal.map(|p| p.name().to_string()).unwrap_or_default();
                    Ok((StatusCode::OK, json!(name)).into())
                })
                .param(Param::infer::<Option<Principal>>("principal")),
            )
            .expect("valid route")
            .build();
        let dispatcher = Dispatcher::builder(routes)
            .codec(JsonCodec::new(false))
            .principal_source(BearerTokens::new([("alice", "secret-token")]))
            .build();

        let mut from_extension = request("GET", "/me");
        from_extension
            .extensions_mut()
            .insert(Principal::new("bob", "Test"));
        let response = dispatcher.dispatch(from_extension).await;
        assert_eq!(body_bytes(response).await, r#""bob""#);

        let from_header = Request::builder()
            .uri("/me")
            .header(header::AUTHORIZATION, "Bearer secret-token")
            .body(Body::empty())
            .expect("request build");
        let response = dispatcher.dispatch(from_header).await;
        assert_eq!(body_bytes(response).await, r#""alice""#);

        let response = dispatcher.dispatch(request("GET", "/me")).await;
        assert_eq!(body_bytes(response).await, r#""""#);
    }

    #[tokio::test]
    async fn events_carry_remote_address_and_status() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::builder(RouteTable::default())
            .observer(recorder.clone())
            .build();

        let mut missing = request("GET", "/nowhere");
        let addr: SocketAddr = "10.0.0.7:4242".parse().expect("socket addr");
        missing.extensions_mut().insert(ConnectInfo(addr));

        let response = dispatcher.oneshot(missing).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let events = recorder.0.lock().expect("recorder lock");
        assert_eq!(events[0].kind, EventKind::Received);
        assert_eq!(events[0].remote_addr, Some(addr));
        assert_eq!(events[1].kind, EventKind::ResponseSent);
        assert_eq!(events[1].status, Some(StatusCode::NOT_FOUND));
        assert_eq!(events[1].handler.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn panic_message_is_kept_in_the_fault() {
        let err = guarded(
            async {
                if true {
                    panic!("inner");
                }
                Ok::<(), DispatchError>(())
            },
            "h",
            None,
        )
        .await
        .expect_err("panic caught");
        match err {
            DispatchError::Handler { fault, .. } => {
                let panic = fault.downcast_ref::<HandlerPanic>().expect("panic fault");
                assert_eq!(panic.0, "inner");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
