//! Seams toward the wire: the transport that encodes responses and the
//! endpoint that owns the underlying socket.
//!
//! The channel never touches bytes on the wire. It hands frozen response
//! metadata and content to a [`Transport`] and observes completion through
//! the callback; everything below that line (HTTP/1.x generation, HTTP/2
//! framing, TLS) belongs to the embedder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::ChannelError;
use crate::exchange::{RequestMeta, ResponseMeta};

/// Completion callback for a transport send.
pub type SendCallback = Box<dyn FnOnce(Result<(), Arc<ChannelError>>) + Send>;

/// A callback that drops the result.
pub fn discard() -> SendCallback {
    Box::new(|_| {})
}

/// Response encoder and writer for one connection.
pub trait Transport: Send + Sync {
    /// Sends response data to the peer.
    ///
    /// `response` is non-`None` only on the committing call; subsequent
    /// writes carry content only. `last` marks the final frame of the
    /// response. The callback must be invoked exactly once, after the bytes
    /// have been handed to the wire or the write has failed.
    fn send(
        &self,
        request: Option<&RequestMeta>,
        response: Option<ResponseMeta>,
        content: Option<Bytes>,
        last: bool,
        callback: SendCallback,
    );

    /// Drops the connection in response to a terminal failure.
    fn abort(&self, failure: &Arc<ChannelError>);

    /// Notified when the exchange has fully completed.
    fn on_completed(&self);

    /// Sends an interim `100 Continue` once the application asks for the
    /// request body. Transports that support the expect mechanism override
    /// this.
    fn continue_100(&self, _available: usize) -> Result<(), ChannelError> {
        Err(ChannelError::illegal_state("100-continue not supported by this transport"))
    }
}

/// The socket-level endpoint a connection runs on.
pub trait Endpoint: Send + Sync {
    fn idle_timeout(&self) -> Option<Duration>;

    fn set_idle_timeout(&self, timeout: Option<Duration>);

    fn is_open(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}
