//! Request metadata and per-exchange request state.
//!
//! `RequestMeta` wraps the standard `http::Request` type the way the rest of
//! the crate wraps `http` vocabulary: immutable once parsed, shared by
//! reference with the transport for the lifetime of the exchange.
//! `Request` is the mutable per-exchange record owned by the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use http::request::Parts;
use http::{HeaderMap, Method, Request as HttpRequest, Uri, Version};

use crate::lock;

/// Immutable request line and headers, as delivered by the parser.
#[derive(Debug)]
pub struct RequestMeta {
    inner: HttpRequest<()>,
}

impl RequestMeta {
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn is_head(&self) -> bool {
        self.inner.method() == Method::HEAD
    }

    /// The declared request content length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.inner
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }
}

impl AsRef<HttpRequest<()>> for RequestMeta {
    fn as_ref(&self) -> &HttpRequest<()> {
        &self.inner
    }
}

impl From<HttpRequest<()>> for RequestMeta {
    fn from(inner: HttpRequest<()>) -> Self {
        Self { inner }
    }
}

impl From<Parts> for RequestMeta {
    fn from(parts: Parts) -> Self {
        Self { inner: HttpRequest::from_parts(parts, ()) }
    }
}

/// The dispatch currently running for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchType {
    Request,
    Async,
    Error,
}

struct ErrorDisposition {
    status: u16,
    reason: Option<String>,
}

/// Mutable request state scoped to one exchange.
///
/// Created empty when the channel is built, populated at `on_request` and
/// reset by `recycle` on persistent connections.
pub struct Request {
    meta: Mutex<Option<Arc<RequestMeta>>>,
    trailers: Mutex<Option<HeaderMap>>,
    handled: AtomicBool,
    dispatch_type: Mutex<Option<DispatchType>>,
    error: Mutex<Option<ErrorDisposition>>,
    arrived_at: Mutex<Option<Instant>>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self {
            meta: Mutex::new(None),
            trailers: Mutex::new(None),
            handled: AtomicBool::new(false),
            dispatch_type: Mutex::new(None),
            error: Mutex::new(None),
            arrived_at: Mutex::new(None),
        }
    }

    pub fn meta(&self) -> Option<Arc<RequestMeta>> {
        lock(&self.meta).clone()
    }

    pub fn has_meta(&self) -> bool {
        lock(&self.meta).is_some()
    }

    pub(crate) fn set_meta(&self, meta: Arc<RequestMeta>) {
        *lock(&self.meta) = Some(meta);
    }

    pub fn method(&self) -> Option<Method> {
        lock(&self.meta).as_ref().map(|m| m.method().clone())
    }

    pub fn version(&self) -> Option<Version> {
        lock(&self.meta).as_ref().map(|m| m.version())
    }

    pub fn is_head(&self) -> bool {
        lock(&self.meta).as_ref().map(|m| m.is_head()).unwrap_or(false)
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        lock(&self.trailers).clone()
    }

    pub(crate) fn set_trailers(&self, trailers: HeaderMap) {
        *lock(&self.trailers) = Some(trailers);
    }

    /// Whether the application has taken responsibility for this request.
    ///
    /// An unhandled request with an untouched output is turned into a 404 at
    /// completion time.
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::Acquire)
    }

    pub fn set_handled(&self, handled: bool) {
        self.handled.store(handled, Ordering::Release);
    }

    pub fn dispatch_type(&self) -> Option<DispatchType> {
        *lock(&self.dispatch_type)
    }

    pub(crate) fn set_dispatch_type(&self, dispatch: DispatchType) {
        *lock(&self.dispatch_type) = Some(dispatch);
    }

    pub(crate) fn clear_dispatch_type(&self) {
        *lock(&self.dispatch_type) = None;
    }

    /// Records the status and reason an error dispatch should respond with.
    pub(crate) fn set_error(&self, status: u16, reason: Option<String>) {
        *lock(&self.error) = Some(ErrorDisposition { status, reason });
    }

    pub(crate) fn error_status(&self) -> Option<(u16, Option<String>)> {
        lock(&self.error).as_ref().map(|e| (e.status, e.reason.clone()))
    }

    pub(crate) fn mark_arrived(&self) {
        *lock(&self.arrived_at) = Some(Instant::now());
    }

    pub fn arrived_at(&self) -> Option<Instant> {
        *lock(&self.arrived_at)
    }

    pub(crate) fn recycle(&self) {
        *lock(&self.meta) = None;
        *lock(&self.trailers) = None;
        self.handled.store(false, Ordering::Release);
        *lock(&self.dispatch_type) = None;
        *lock(&self.error) = None;
        *lock(&self.arrived_at) = None;
    }
}
