//! The output side of an exchange: buffered content, the commit/send
//! pipeline and write completion accounting.
//!
//! Writes flow through the interceptor chain and terminate at the channel,
//! which commits the response on the first send. The pipeline tracks two
//! counters: `submitted` (bytes accepted into a write, checked against the
//! declared content length at completion) and `written` (bytes confirmed by
//! the transport after the write completed).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::exchange::status_has_no_body;
use crate::lock;
use crate::transport::SendCallback;

/// Transforms response content on its way to the transport.
pub trait WriteInterceptor: Send + Sync {
    fn intercept(&self, content: Bytes, last: bool) -> (Bytes, bool);
}

pub struct OutputPipeline {
    buffer: Mutex<BytesMut>,
    submitted: AtomicU64,
    written: AtomicU64,
    pending: AtomicBool,
    closed: AtomicBool,
    want_write: AtomicBool,
    close_pending: Mutex<Option<SendCallback>>,
    interceptors: Mutex<Vec<Arc<dyn WriteInterceptor>>>,
    write_listener: Mutex<Option<Arc<dyn Fn(&Channel) + Send + Sync>>>,
}

impl OutputPipeline {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(capacity)),
            submitted: AtomicU64::new(0),
            written: AtomicU64::new(0),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            want_write: AtomicBool::new(false),
            close_pending: Mutex::new(None),
            interceptors: Mutex::new(Vec::new()),
            write_listener: Mutex::new(None),
        }
    }

    /// Non-blocking write. The first write commits the response; one write
    /// may be in flight at a time.
    pub fn write(&self, channel: &Channel, content: Bytes, last: bool, callback: SendCallback) {
        if self.closed.load(Ordering::Acquire) {
            callback(Err(Arc::new(ChannelError::illegal_state("output closed"))));
            return;
        }
        if self.pending.swap(true, Ordering::AcqRel) {
            callback(Err(Arc::new(ChannelError::illegal_state("write pending"))));
            return;
        }
        let (content, last) = self.intercept(content, last);
        self.submit(channel, content, last, callback);
    }

    fn intercept(&self, content: Bytes, last: bool) -> (Bytes, bool) {
        let interceptors: Vec<_> = lock(&self.interceptors).clone();
        interceptors
            .iter()
            .fold((content, last), |(content, last), i| i.intercept(content, last))
    }

    /// Hands one frame to the channel's send pipeline. Callers have already
    /// claimed the pending-write slot.
    fn submit(&self, channel: &Channel, content: Bytes, last: bool, callback: SendCallback) {
        self.submitted.fetch_add(content.len() as u64, Ordering::Relaxed);
        if last {
            self.closed.store(true, Ordering::Release);
        }
        let me = channel.weak();
        let finishing: SendCallback = Box::new(move |result| {
            callback(result);
            if let Some(channel) = me.upgrade() {
                channel.output().on_write_finished(&channel);
            }
        });
        let content = if content.is_empty() { None } else { Some(content) };
        channel.send_response(None, content, last, finishing);
    }

    fn on_write_finished(&self, channel: &Channel) {
        self.pending.store(false, Ordering::Release);
        if let Some(callback) = lock(&self.close_pending).take() {
            self.do_close(channel, callback);
            return;
        }
        if self.want_write.swap(false, Ordering::AcqRel)
            && lock(&self.write_listener).is_some()
            && channel.state().on_write_possible()
        {
            channel.reschedule();
        }
    }

    /// Closes the output. Commits an empty (or buffered) response if none
    /// was committed; waits for an in-flight write to finish first.
    pub fn complete(&self, channel: &Channel, callback: SendCallback) {
        if self.pending.load(Ordering::Acquire) {
            *lock(&self.close_pending) = Some(callback);
            return;
        }
        self.do_close(channel, callback);
    }

    fn do_close(&self, channel: &Channel, callback: SendCallback) {
        if self.closed.swap(true, Ordering::AcqRel) {
            callback(Ok(()));
            return;
        }
        let mut content = self.take_buffer();
        let body_forbidden =
            channel.request().is_head() || status_has_no_body(channel.response().status());
        if body_forbidden {
            // HEAD and 1xx/204/304 responses go out empty whatever was
            // buffered; a declared content length is left untouched.
            content = Bytes::new();
        } else if !channel.is_committed() && channel.response().declared_content_length().is_none() {
            channel.response().set_content_length(content.len() as u64);
        }
        debug!(len = content.len(), "closing output");
        self.pending.store(true, Ordering::Release);
        self.submit(channel, content, true, callback);
    }

    /// True when a new non-blocking write would be accepted now. Registers
    /// write interest otherwise.
    pub fn is_ready(&self) -> bool {
        if self.pending.load(Ordering::Acquire) {
            self.want_write.store(true, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Appends to the aggregation buffer without committing. The buffer is
    /// flushed by `complete` or by `Channel::send_response_and_complete`.
    pub fn append(&self, data: &[u8]) {
        lock(&self.buffer).extend_from_slice(data);
    }

    pub(crate) fn take_buffer(&self) -> Bytes {
        lock(&self.buffer).split().freeze()
    }

    /// Discards buffered content.
    pub(crate) fn reset_buffer(&self) {
        lock(&self.buffer).clear();
    }

    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Bytes confirmed written by the transport, post interception.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::AcqRel);
    }

    /// Bytes accepted into writes, post interception.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Reopens the output for a fresh dispatch of the same exchange.
    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn WriteInterceptor>) {
        lock(&self.interceptors).push(interceptor);
    }

    pub(crate) fn set_write_listener(&self, listener: Arc<dyn Fn(&Channel) + Send + Sync>) {
        *lock(&self.write_listener) = Some(listener);
    }

    pub(crate) fn run_write_listener(&self, channel: &Channel) {
        let listener = lock(&self.write_listener).clone();
        if let Some(listener) = listener {
            listener(channel);
        }
    }

    pub(crate) fn recycle(&self) {
        lock(&self.buffer).clear();
        self.submitted.store(0, Ordering::Release);
        self.written.store(0, Ordering::Release);
        self.pending.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.want_write.store(false, Ordering::Release);
        *lock(&self.close_pending) = None;
        lock(&self.interceptors).clear();
        *lock(&self.write_listener) = None;
    }
}
