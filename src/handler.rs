//! Application seams: the server entry points and the error handler.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::channel::Channel;
use crate::error::ChannelError;

/// Synchronous application entry points.
///
/// `handle` runs for the initial dispatch of every exchange; `handle_async`
/// runs for dispatches resumed out of an async suspension and defaults to
/// the same code path. Handlers mark the request handled (or write a
/// complete response) to claim it; an unclaimed request becomes a 404.
pub trait Server: Send + Sync {
    fn handle(&self, channel: &Channel) -> Result<(), ChannelError>;

    fn handle_async(&self, channel: &Channel) -> Result<(), ChannelError> {
        self.handle(channel)
    }

    /// A stopped server halts the channel loop at the next action boundary.
    fn is_stopped(&self) -> bool {
        false
    }
}

/// A `Server` built from a closure.
#[derive(Debug)]
pub struct ServerFn<F> {
    f: F,
}

impl<F> Server for ServerFn<F>
where
    F: Fn(&Channel) -> Result<(), ChannelError> + Send + Sync,
{
    fn handle(&self, channel: &Channel) -> Result<(), ChannelError> {
        (self.f)(channel)
    }
}

pub fn make_server<F>(f: F) -> ServerFn<F>
where
    F: Fn(&Channel) -> Result<(), ChannelError> + Send + Sync,
{
    ServerFn { f }
}

/// Generates error responses for failed exchanges.
pub trait ErrorHandler: Send + Sync {
    /// Whether an error page should be generated for requests of `method`.
    fn error_page_for_method(&self, _method: &Method) -> bool {
        true
    }

    /// Error-page dispatch: invoked with the response status and reason
    /// already set; writes the error body through the channel.
    fn handle(&self, channel: &Channel) -> Result<(), ChannelError>;

    /// Body for a synthetic bad-message response. May add headers for the
    /// generated body.
    fn bad_message_error(
        &self,
        _status: StatusCode,
        _reason: &str,
        _headers: &mut HeaderMap,
    ) -> Option<Bytes> {
        None
    }
}
