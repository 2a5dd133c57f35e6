//! Phase-annotated observer notification.
//!
//! A single combined listener is installed at the connector; a small
//! transient list can be added per exchange. All invocations run
//! synchronously on the thread advancing the exchange and must not block.
//! A panicking listener is isolated and logged at debug; it never reaches
//! the driver.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::error::ChannelError;
use crate::exchange::Request;
use crate::lock;

/// Observer of exchange phases.
///
/// The sequence of events on one exchange is a prefix of:
/// `on_request_begin`, `on_before_dispatch`, `on_after_dispatch`,
/// `on_request_content*`, `on_request_content_end`, `on_request_trailers?`,
/// `on_request_end`, `on_response_begin`, `on_response_commit`,
/// `on_response_content*`, `on_response_end`, `on_complete` — with
/// `on_dispatch_failure` / `on_request_failure` / `on_response_failure`
/// replacing the corresponding success event. `on_complete` is always last.
pub trait ChannelListener: Send + Sync {
    /// Invoked just after the request line and headers have been parsed.
    fn on_request_begin(&self, _request: &Request) {}

    /// Invoked just before calling the application.
    fn on_before_dispatch(&self, _request: &Request) {}

    /// Invoked when the application returned a failure or panicked.
    fn on_dispatch_failure(&self, _request: &Request, _failure: &Arc<ChannelError>) {}

    /// Invoked just after the application returns.
    fn on_after_dispatch(&self, _request: &Request) {}

    /// Invoked for every request content chunk, before the application
    /// sees it.
    fn on_request_content(&self, _request: &Request, _content: &Bytes) {}

    /// Invoked when the end of the request content is detected.
    fn on_request_content_end(&self, _request: &Request) {}

    /// Invoked when the request trailers have been parsed.
    fn on_request_trailers(&self, _request: &Request) {}

    /// Invoked when the request has been fully parsed.
    fn on_request_end(&self, _request: &Request) {}

    /// Invoked when request processing failed.
    fn on_request_failure(&self, _request: &Request, _failure: &Arc<ChannelError>) {}

    /// Invoked just before the response is committed.
    fn on_response_begin(&self, _request: &Request) {}

    /// Invoked just after the committing write succeeded.
    fn on_response_commit(&self, _request: &Request) {}

    /// Invoked after a response content chunk has been written.
    fn on_response_content(&self, _request: &Request, _content: &Bytes) {}

    /// Invoked when the response has been fully written.
    fn on_response_end(&self, _request: &Request) {}

    /// Invoked when response processing failed.
    fn on_response_failure(&self, _request: &Request, _failure: &Arc<ChannelError>) {}

    /// Invoked when request and response processing are both complete.
    /// No event follows this one.
    fn on_complete(&self, _request: &Request) {}
}

/// A listener that observes nothing.
pub struct NoopListener;

impl ChannelListener for NoopListener {}

const MAX_TRANSIENT_LISTENERS: usize = 8;

/// Fan-out over the combined connector listener and the transient list.
pub(crate) struct Listeners {
    combined: Arc<dyn ChannelListener>,
    transient: Mutex<Vec<Arc<dyn ChannelListener>>>,
}

macro_rules! notify {
    ($name:ident) => {
        pub(crate) fn $name(&self, request: &Request) {
            self.each(|listener| listener.$name(request));
        }
    };
    ($name:ident, $ty:ty) => {
        pub(crate) fn $name(&self, request: &Request, arg: &$ty) {
            self.each(|listener| listener.$name(request, arg));
        }
    };
}

impl Listeners {
    pub(crate) fn new(combined: Arc<dyn ChannelListener>) -> Self {
        Self { combined, transient: Mutex::new(Vec::new()) }
    }

    /// Adds a per-exchange listener; at most [`MAX_TRANSIENT_LISTENERS`] are
    /// accepted. Cleared on recycle.
    pub(crate) fn add_transient(&self, listener: Arc<dyn ChannelListener>) -> bool {
        let mut transient = lock(&self.transient);
        if transient.len() >= MAX_TRANSIENT_LISTENERS {
            return false;
        }
        transient.push(listener);
        true
    }

    pub(crate) fn clear_transient(&self) {
        lock(&self.transient).clear();
    }

    fn each(&self, f: impl Fn(&dyn ChannelListener)) {
        Self::isolate(&*self.combined, &f);
        let transient: Vec<_> = lock(&self.transient).clone();
        for listener in &transient {
            Self::isolate(&**listener, &f);
        }
    }

    fn isolate(listener: &dyn ChannelListener, f: &impl Fn(&dyn ChannelListener)) {
        if catch_unwind(AssertUnwindSafe(|| f(listener))).is_err() {
            debug!("listener panicked during notification");
        }
    }

    notify!(on_request_begin);
    notify!(on_before_dispatch);
    notify!(on_dispatch_failure, Arc<ChannelError>);
    notify!(on_after_dispatch);
    notify!(on_request_content, Bytes);
    notify!(on_request_content_end);
    notify!(on_request_trailers);
    notify!(on_request_end);
    notify!(on_request_failure, Arc<ChannelError>);
    notify!(on_response_begin);
    notify!(on_response_commit);
    notify!(on_response_content, Bytes);
    notify!(on_response_end);
    notify!(on_response_failure, Arc<ChannelError>);
    notify!(on_complete);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Panicky;

    impl ChannelListener for Panicky {
        fn on_request_begin(&self, _request: &Request) {
            panic!("observer gone wrong");
        }
    }

    struct Counting {
        begins: AtomicUsize,
    }

    impl ChannelListener for Counting {
        fn on_request_begin(&self, _request: &Request) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_the_fanout() {
        let counting = Arc::new(Counting { begins: AtomicUsize::new(0) });
        let listeners = Listeners::new(Arc::new(Panicky));
        assert!(listeners.add_transient(counting.clone()));

        let request = Request::new();
        listeners.on_request_begin(&request);

        assert_eq!(counting.begins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_list_is_bounded() {
        let listeners = Listeners::new(Arc::new(NoopListener));
        for _ in 0..MAX_TRANSIENT_LISTENERS {
            assert!(listeners.add_transient(Arc::new(NoopListener)));
        }
        assert!(!listeners.add_transient(Arc::new(NoopListener)));

        listeners.clear_transient();
        assert!(listeners.add_transient(Arc::new(NoopListener)));
    }
}
