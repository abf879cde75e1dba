//! Per-request state handed to the binder and the handler.
//!
//! An [`InvocationContext`] is created by the dispatcher for exactly one
//! request and dropped when that request is answered. [`RawRequest`] and
//! [`ResponseWriter`] are cheap handles into it that handlers may receive as
//! special parameters.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use axum::{
    body::{Body, Bytes},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::Response,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::Principal,
    codec::{self, BodyCodec, CodecError},
};

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds the limit of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Read(String),
    #[error("request body is no longer available")]
    Unavailable,
    #[error("request body is not valid UTF-8")]
    NotUtf8,
    #[error("request was cancelled")]
    Cancelled,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
#[error("header `{name}` is not valid visible ASCII")]
pub struct HeaderError {
    pub name: String,
    pub raw: String,
}

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("request was cancelled before the response was written")]
    Cancelled,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("cannot serialize response data: {0}")]
    Serialize(#[from] serde_json::Error),
}

enum BodyState {
    Unread(Body),
    Buffered(Bytes),
    Lost,
}

struct RequestInner {
    parts: Parts,
    remote_addr: Option<SocketAddr>,
    body: tokio::sync::Mutex<BodyState>,
    max_body_bytes: usize,
    cancel: CancellationToken,
    codec: Arc<dyn BodyCodec>,
}

#[derive(Clone)]
pub struct RawRequest {
    inner: Arc<RequestInner>,
}

impl RawRequest {
    pub fn method(&self) -> &Method {
        &self.inner.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.parts.uri
    }

    pub fn path(&self) -> &str {
        self.inner.parts.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.parts.uri.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.parts.headers
    }

    pub fn parts(&self) -> &Parts {
        &self.inner.parts
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Reads the whole body, at most once per request; later calls return
    /// the buffered bytes. The read is abandoned when the request is
    /// cancelled.
    pub async fn bytes(&self) -> Result<Bytes, BodyError> {
        let mut state = self.inner.body.lock().await;
        let body = match std::mem::replace(&mut *state, BodyState::Lost) {
            BodyState::Buffered(bytes) => {
                *state = BodyState::Buffered(bytes.clone());
                return Ok(bytes);
            }
            BodyState::Lost => return Err(BodyError::Unavailable),
            BodyState::Unread(body) => body,
        };

        let limit = self.inner.max_body_bytes;
        let collected = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(BodyError::Cancelled),
            collected = Limited::new(body, limit).collect() => collected,
        };
        let bytes = collected
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    BodyError::TooLarge { limit }
                } else {
                    BodyError::Read(err.to_string())
                }
            })?
            .to_bytes();

        *state = BodyState::Buffered(bytes.clone());
        Ok(bytes)
    }

    pub async fn text(&self) -> Result<String, BodyError> {
        let bytes = self.bytes().await?;
        let text = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes[..]);
        String::from_utf8(text.to_vec()).map_err(|_| BodyError::NotUtf8)
    }

    /// Decodes the body with the configured codec; a blank body is `None`.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, BodyError> {
        let bytes = self.bytes().await?;
        if codec::is_blank(&bytes) {
            return Ok(None);
        }
        Ok(Some(codec::decode_as(self.inner.codec.as_ref(), &bytes)?))
    }
}

struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Handle to the outgoing response.
///
/// Handlers that write through it and then return a pending unit take full
/// control of the response; the dispatcher adds nothing.
#[derive(Clone)]
pub struct ResponseWriter {
    inner: Arc<Mutex<ResponseState>>,
    cancel: CancellationToken,
    codec: Arc<dyn BodyCodec>,
}

impl ResponseWriter {
    fn new(cancel: CancellationToken, codec: Arc<dyn BodyCodec>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResponseState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Vec::new(),
            })),
            cancel,
            codec,
        }
    }

    fn state(&self) -> MutexGuard<'_, ResponseState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> StatusCode {
        self.state().status
    }

    pub fn set_status(&self, status: StatusCode) {
        self.state().status = status;
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.state().headers.insert(name, value);
    }

    pub fn write(&self, chunk: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        if self.cancel.is_cancelled() {
            return Err(ResponseError::Cancelled);
        }
        self.state().body.extend_from_slice(chunk.as_ref());
        Ok(())
    }

    pub fn write_text(&self, text: &str) -> Result<(), ResponseError> {
        self.write(text)?;
        self.default_content_type(HeaderValue::from_static("text/plain; charset=utf-8"));
        Ok(())
    }

    pub fn write_json<T: Serialize>(&self, value: &T) -> Result<(), ResponseError> {
        let encoded = self.codec.encode(&serde_json::to_value(value)?)?;
        self.write(encoded)?;
        if let Ok(content_type) = HeaderValue::from_str(self.codec.content_type()) {
            self.default_content_type(content_type);
        }
        Ok(())
    }

    fn default_content_type(&self, value: HeaderValue) {
        self.state()
            .headers
            .entry(header::CONTENT_TYPE)
            .or_insert(value);
    }

    /// Applies a normalized outcome, replacing any body the handler wrote.
    /// Runs after the handler finished, so it does not consult the
    /// cancellation token.
    pub(crate) fn apply(&self, status: StatusCode, body: Option<(Vec<u8>, HeaderValue)>) {
        let mut state = self.state();
        state.status = status;
        state.body.clear();
        state.headers.remove(header::CONTENT_TYPE);
        if let Some((bytes, content_type)) = body {
            state.body = bytes;
            state.headers.insert(header::CONTENT_TYPE, content_type);
        }
    }

    pub(crate) fn take_response(&self) -> Response {
        let mut state = self.state();
        let body = std::mem::take(&mut state.body);
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = state.status;
        *response.headers_mut() = std::mem::take(&mut state.headers);
        response
    }
}

pub struct InvocationContext {
    request: RawRequest,
    response: ResponseWriter,
    principal: Option<Principal>,
    cancel: CancellationToken,
    codec: Arc<dyn BodyCodec>,
    query: OnceLock<Vec<(String, String)>>,
}

impl InvocationContext {
    pub fn new(
        parts: Parts,
        body: Body,
        remote_addr: Option<SocketAddr>,
        principal: Option<Principal>,
        cancel: CancellationToken,
        codec: Arc<dyn BodyCodec>,
        max_body_bytes: usize,
    ) -> Self {
        let request = RawRequest {
            inner: Arc::new(RequestInner {
                parts,
                remote_addr,
                body: tokio::sync::Mutex::new(BodyState::Unread(body)),
                max_body_bytes,
                cancel: cancel.clone(),
                codec: Arc::clone(&codec),
            }),
        };
        let response = ResponseWriter::new(cancel.clone(), Arc::clone(&codec));

        Self {
            request,
            response,
            principal,
            cancel,
            codec,
            query: OnceLock::new(),
        }
    }

    pub fn request(&self) -> &RawRequest {
        &self.request
    }

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn codec(&self) -> &dyn BodyCodec {
        self.codec.as_ref()
    }

    /// Query string value for `key`, matched ignoring ASCII case. Repeated
    /// keys are joined with `,`.
    pub fn query_value(&self, key: &str) -> Option<String> {
        let pairs = self.query.get_or_init(|| {
            url::form_urlencoded::parse(self.request.query().unwrap_or_default().as_bytes())
                .into_owned()
                .collect()
        });

        let values: Vec<&str> = pairs
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
            .collect();
        (!values.is_empty()).then(|| values.join(","))
    }

    /// Header value for `name`; several entries are joined with `, `.
    pub fn header_value(&self, name: &str) -> Result<Option<String>, HeaderError> {
        let values = self
            .request
            .headers()
            .get_all(name)
            .iter()
            .map(|value| {
                value.to_str().map(str::to_owned).map_err(|_| HeaderError {
                    name: name.to_string(),
                    raw: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((!values.is_empty()).then(|| values.join(", ")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::http::Request;
    use http_body_util::BodyExt;

    use super::*;
    use crate::codec::JsonCodec;

    pub(crate) fn context(request: Request<Body>) -> InvocationContext {
        context_with_limit(request, 1024)
    }

    pub(crate) fn context_with_limit(request: Request<Body>, limit: usize) -> InvocationContext {
        let (parts, body) = request.into_parts();
        InvocationContext::new(
            parts,
            body,
            None,
            None,
            CancellationToken::new(),
            Arc::new(JsonCodec::new(false)),
            limit,
        )
    }

    #[test]
    fn query_lookup_ignores_case_and_joins_repeats() {
        let ctx = context(
            Request::builder()
                .uri("/foo?Bar=1&bar=2&qux=a%20b")
                .body(Body::empty())
                .expect("request build"),
        );
        assert_eq!(ctx.query_value("bar").as_deref(), Some("1,2"));
        assert_eq!(ctx.query_value("qux").as_deref(), Some("a b"));
        assert_eq!(ctx.query_value("missing"), None);
    }

    #[test]
    fn header_lookup_joins_repeats() {
        let ctx = context(
            Request::builder()
                .uri("/foo")
                .header("x-tag", "a")
                .header("x-tag", "b")
                .body(Body::empty())
                .expect("request build"),
        );
        assert_eq!(
            ctx.header_value("X-Tag").expect("text header").as_deref(),
            Some("a, b")
        );
        assert_eq!(ctx.header_value("x-none").expect("absent header"), None);
    }

    #[test]
    fn non_text_header_is_rejected_not_mangled() {
        let ctx = context(
            Request::builder()
                .uri("/foo")
                .header(
                    "x-name",
                    HeaderValue::from_bytes(b"caf\xE9").expect("opaque header value"),
                )
                .body(Body::empty())
                .expect("request build"),
        );
        let err = ctx.header_value("x-name").expect_err("not text");
        assert_eq!(err.name, "x-name");
        assert_eq!(err.raw, "caf\u{FFFD}");
    }

    #[tokio::test]
    async fn body_is_read_once_and_cached() {
        let ctx = context(
            Request::builder()
                .uri("/foo")
                .body(Body::from("hello"))
                .expect("request build"),
        );
        assert_eq!(ctx.request().bytes().await.expect("first read"), "hello");
        assert_eq!(ctx.request().text().await.expect("second read"), "hello");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let ctx = context_with_limit(
            Request::builder()
                .uri("/foo")
                .body(Body::from("0123456789"))
                .expect("request build"),
            4,
        );
        let err = ctx.request().bytes().await.expect_err("too large");
        assert!(matches!(err, BodyError::TooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn cancelled_request_abandons_body_read() {
        let ctx = context(
            Request::builder()
                .uri("/foo")
                .body(Body::from("hello"))
                .expect("request build"),
        );
        ctx.cancellation().cancel();
        let err = ctx.request().bytes().await.expect_err("cancelled");
        assert!(matches!(err, BodyError::Cancelled));
    }

    #[tokio::test]
    async fn writer_refuses_writes_after_cancellation() {
        let ctx = context(Request::builder().body(Body::empty()).expect("request build"));
        ctx.response().write_text("partial").expect("write");
        ctx.cancellation().cancel();
        assert!(matches!(
            ctx.response().write("more"),
            Err(ResponseError::Cancelled)
        ));

        let response = ctx.response().take_response();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(body, "partial");
    }
}
