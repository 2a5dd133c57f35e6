//! Response metadata handling.
//!
//! `Response` is the mutable response record of an exchange: status, reason
//! and headers stay editable until the first write commits the response, at
//! which point a frozen `ResponseMeta` snapshot is handed to the transport.

use std::sync::Mutex;

use http::{HeaderMap, HeaderValue, StatusCode, Version};

use crate::lock;

/// Frozen response line and headers handed to the transport on commit.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    headers: HeaderMap,
    content_length: Option<u64>,
}

impl ResponseMeta {
    pub fn new(
        status: StatusCode,
        reason: Option<String>,
        version: Version,
        headers: HeaderMap,
        content_length: Option<u64>,
    ) -> Self {
        Self { status, reason, version, headers, content_length }
    }

    /// A header-less response used when nothing better can be generated.
    pub fn minimal(status: StatusCode) -> Self {
        Self::new(status, None, Version::HTTP_11, HeaderMap::new(), Some(0))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

/// Mutable response state scoped to one exchange.
pub struct Response {
    status: Mutex<StatusCode>,
    reason: Mutex<Option<String>>,
    headers: Mutex<HeaderMap>,
}

impl Response {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(StatusCode::OK),
            reason: Mutex::new(None),
            headers: Mutex::new(HeaderMap::new()),
        }
    }

    pub fn status(&self) -> StatusCode {
        *lock(&self.status)
    }

    pub fn set_status(&self, status: StatusCode) {
        *lock(&self.status) = status;
    }

    pub fn reason(&self) -> Option<String> {
        lock(&self.reason).clone()
    }

    pub fn set_reason(&self, reason: Option<String>) {
        *lock(&self.reason) = reason;
    }

    /// Runs `f` with the mutable header map.
    ///
    /// Header mutations after commit have no effect on the wire; the
    /// committed snapshot has already been taken.
    pub fn with_headers<R>(&self, f: impl FnOnce(&mut HeaderMap) -> R) -> R {
        f(&mut lock(&self.headers))
    }

    pub fn contains_header(&self, name: http::header::HeaderName) -> bool {
        lock(&self.headers).contains_key(name)
    }

    /// Declares the response content length by setting the header.
    pub fn set_content_length(&self, length: u64) {
        if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
            lock(&self.headers).insert(http::header::CONTENT_LENGTH, value);
        }
    }

    /// The declared content length, parsed from the headers.
    pub fn declared_content_length(&self) -> Option<u64> {
        lock(&self.headers)
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    /// True when `written` satisfies the declared content length.
    pub fn is_content_complete(&self, written: u64) -> bool {
        match self.declared_content_length() {
            Some(length) => written >= length,
            None => true,
        }
    }

    /// Drops content-describing headers ahead of an error response.
    pub(crate) fn reset_content_headers(&self) {
        let mut headers = lock(&self.headers);
        headers.remove(http::header::CONTENT_LENGTH);
        headers.remove(http::header::CONTENT_TYPE);
        headers.remove(http::header::TRANSFER_ENCODING);
    }

    /// Takes the commit snapshot from the current state.
    pub(crate) fn new_meta(&self, version: Version) -> ResponseMeta {
        let headers = lock(&self.headers).clone();
        let content_length = self.declared_content_length();
        ResponseMeta::new(self.status(), self.reason(), version, headers, content_length)
    }

    pub(crate) fn recycle(&self) {
        *lock(&self.status) = StatusCode::OK;
        *lock(&self.reason) = None;
        lock(&self.headers).clear();
    }
}

/// True for statuses that forbid a response body (1xx, 204, 304).
pub fn status_has_no_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_accounting() {
        let response = Response::new();
        assert!(response.is_content_complete(0));

        response.set_content_length(5);
        assert_eq!(response.declared_content_length(), Some(5));
        assert!(!response.is_content_complete(4));
        assert!(response.is_content_complete(5));
    }

    #[test]
    fn meta_snapshot_is_frozen() {
        let response = Response::new();
        response.set_status(StatusCode::CREATED);
        response.with_headers(|h| {
            h.insert(http::header::SERVER, HeaderValue::from_static("micro-channel"));
        });

        let meta = response.new_meta(Version::HTTP_11);

        response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        response.with_headers(|h| h.clear());

        assert_eq!(meta.status(), StatusCode::CREATED);
        assert_eq!(meta.headers().len(), 1);
    }

    #[test]
    fn body_forbidden_statuses() {
        assert!(status_has_no_body(StatusCode::CONTINUE));
        assert!(status_has_no_body(StatusCode::SWITCHING_PROTOCOLS));
        assert!(status_has_no_body(StatusCode::NO_CONTENT));
        assert!(status_has_no_body(StatusCode::NOT_MODIFIED));
        assert!(!status_has_no_body(StatusCode::OK));
        assert!(!status_has_no_body(StatusCode::NOT_FOUND));
    }

    #[test]
    fn reset_content_headers_keeps_the_rest() {
        let response = Response::new();
        response.set_content_length(10);
        response.with_headers(|h| {
            h.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            h.insert(http::header::SERVER, HeaderValue::from_static("micro-channel"));
        });

        response.reset_content_headers();

        assert_eq!(response.declared_content_length(), None);
        assert!(!response.contains_header(http::header::CONTENT_TYPE));
        assert!(response.contains_header(http::header::SERVER));
    }
}
