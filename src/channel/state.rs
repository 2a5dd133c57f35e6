//! The per-exchange state machine.
//!
//! Every thread that wants to advance an exchange goes through this type:
//! the channel driver asks it for the next [`Action`] with
//! [`ChannelState::handling`] / [`ChannelState::unhandle`], and every other
//! event source (parser callbacks, write completions, timers, the
//! application's async calls) is absorbed into the state vector, waking the
//! suspended exchange through the executor when needed.
//!
//! The state vector lives under a single mutex and no callback ever runs
//! while it is held; transitions return a `reschedule` flag and the caller
//! wakes the channel outside the lock.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::error::ChannelError;
use crate::exchange::Chunk;
use crate::lock;

/// What the channel driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Initial dispatch into the application handler.
    Dispatch,
    /// Resumption of a suspended exchange through the async handler path.
    AsyncDispatch,
    /// Deliver the async timeout notification to the timeout listeners.
    AsyncTimeout,
    /// Rethrow a failure captured while the exchange was suspended.
    AsyncError,
    /// Generate an error response, possibly through the error handler.
    SendError,
    /// Invoke the registered read-ready notification.
    ReadCallback,
    /// Invoke the registered write-ready notification.
    WriteCallback,
    /// Finish the response and terminate the exchange.
    Complete,
    /// Nothing to do; the exchange is suspended until an external event.
    Wait,
    /// The exchange is over; recycle before reuse.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    /// No thread is advancing the exchange and no wake-up is pending.
    Idle,
    /// A thread is inside the channel loop.
    Handling,
    /// Suspended, waiting for an external event.
    Waiting,
    /// An event arrived while suspended; a handling thread is on its way.
    Woken,
    /// Terminal until recycle.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Dispatched,
    Async,
    Completing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    NotAsync,
    /// `start_async` was called during a dispatch.
    Started,
    /// The application asked for a redispatch.
    Dispatch,
    /// The timeout fired; the notification has not yet resolved the context.
    Expiring,
    /// The timeout notification returned without resolving the context.
    Expired,
    /// The application completed the exchange.
    Complete,
    /// A failure was captured for delivery through the handler path.
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Open,
    Committed,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// No read interest registered.
    Idle,
    /// The application asked for content that was not available.
    Unready,
    /// Content arrived for a registered interest; a read callback is due.
    Ready,
    /// The pump is pulling from the input port.
    Producing,
    /// A terminal EOF chunk has been delivered.
    Eof,
    /// A terminal error chunk has been delivered.
    Errored,
}

struct Vector {
    handle: HandleState,
    request: RequestState,
    async_state: AsyncState,
    output: OutputState,
    input: InputState,
    send_error: bool,
    timeout_delivered: bool,
    write_ready: bool,
    async_failure: Option<Arc<ChannelError>>,
}

impl Vector {
    fn new() -> Self {
        Self {
            handle: HandleState::Idle,
            request: RequestState::Idle,
            async_state: AsyncState::NotAsync,
            output: OutputState::Open,
            input: InputState::Idle,
            send_error: false,
            timeout_delivered: false,
            write_ready: false,
            async_failure: None,
        }
    }

    /// Wakes a suspended exchange. Returns true if the caller must
    /// reschedule the channel.
    fn wake(&mut self) -> bool {
        if self.handle == HandleState::Waiting {
            self.handle = HandleState::Woken;
            true
        } else {
            false
        }
    }
}

pub struct ChannelState {
    vector: Mutex<Vector>,
}

impl ChannelState {
    pub(crate) fn new() -> Self {
        Self { vector: Mutex::new(Vector::new()) }
    }

    /// Takes ownership of the exchange for a handling turn.
    ///
    /// Fails when another thread already holds the exchange or when the
    /// exchange is suspended with no wake-up pending.
    pub fn handling(&self) -> Result<Action, ChannelError> {
        let mut v = lock(&self.vector);
        match v.handle {
            HandleState::Idle => {
                if v.request != RequestState::Idle {
                    return Err(ChannelError::illegal_state(format!(
                        "handling with request {:?}",
                        v.request
                    )));
                }
                v.handle = HandleState::Handling;
                v.request = RequestState::Dispatched;
                Ok(Action::Dispatch)
            }
            HandleState::Woken => {
                v.handle = HandleState::Handling;
                Ok(Self::next_action(&mut v))
            }
            state => Err(ChannelError::illegal_state(format!("handling while {state:?}"))),
        }
    }

    /// Yields the next action after the previous one finished.
    ///
    /// `Wait` suspends the exchange: the handling thread releases it and a
    /// later external event re-enters through [`ChannelState::handling`].
    pub fn unhandle(&self) -> Action {
        let mut v = lock(&self.vector);
        if v.handle != HandleState::Handling {
            error!(state = ?v.handle, "unhandle outside a handling turn");
            return Action::Wait;
        }
        Self::next_action(&mut v)
    }

    fn next_action(v: &mut Vector) -> Action {
        if v.request == RequestState::Completed {
            v.handle = HandleState::Terminated;
            return Action::Terminated;
        }
        if v.send_error {
            v.send_error = false;
            // The error dispatch runs as a fresh handling turn; completion
            // is re-reached through its own unhandle.
            v.request = RequestState::Dispatched;
            return Action::SendError;
        }
        match v.request {
            RequestState::Dispatched | RequestState::Async => match v.async_state {
                AsyncState::NotAsync => {
                    v.request = RequestState::Completing;
                    Action::Complete
                }
                AsyncState::Dispatch => {
                    v.request = RequestState::Dispatched;
                    v.async_state = AsyncState::NotAsync;
                    Action::AsyncDispatch
                }
                AsyncState::Complete => {
                    v.request = RequestState::Completing;
                    Action::Complete
                }
                AsyncState::Started
                | AsyncState::Expiring
                | AsyncState::Expired
                | AsyncState::Errored => Self::async_event(v),
            },
            RequestState::Idle | RequestState::Completing => {
                v.handle = HandleState::Waiting;
                Action::Wait
            }
            RequestState::Completed => {
                v.handle = HandleState::Terminated;
                Action::Terminated
            }
        }
    }

    /// Pending-event arbitration for a dispatched-then-suspended exchange.
    fn async_event(v: &mut Vector) -> Action {
        if v.async_state == AsyncState::Errored && v.async_failure.is_some() {
            return Action::AsyncError;
        }
        if v.async_state == AsyncState::Expiring && !v.timeout_delivered {
            v.timeout_delivered = true;
            return Action::AsyncTimeout;
        }
        if v.input == InputState::Ready {
            v.input = InputState::Idle;
            return Action::ReadCallback;
        }
        if v.write_ready {
            v.write_ready = false;
            return Action::WriteCallback;
        }
        v.request = RequestState::Async;
        v.handle = HandleState::Waiting;
        Action::Wait
    }

    /// `NotAsync -> Started`; only legal during an active dispatch.
    pub fn start_async(&self) -> Result<(), ChannelError> {
        let mut v = lock(&self.vector);
        if v.handle != HandleState::Handling
            || v.request != RequestState::Dispatched
            || v.async_state != AsyncState::NotAsync
        {
            return Err(ChannelError::illegal_state(format!(
                "start_async in {:?}/{:?}",
                v.request, v.async_state
            )));
        }
        v.async_state = AsyncState::Started;
        Ok(())
    }

    /// Async resume: `Started -> Dispatch`. Returns true if the caller must
    /// reschedule the channel.
    pub fn dispatch(&self) -> Result<bool, ChannelError> {
        let mut v = lock(&self.vector);
        match v.async_state {
            AsyncState::Started | AsyncState::Expiring => {
                v.async_state = AsyncState::Dispatch;
                Ok(v.wake())
            }
            state => Err(ChannelError::illegal_state(format!("dispatch in {state:?}"))),
        }
    }

    /// Async completion: any suspended async state to `Complete`.
    pub fn complete(&self) -> Result<bool, ChannelError> {
        let mut v = lock(&self.vector);
        match v.async_state {
            AsyncState::Started
            | AsyncState::Expiring
            | AsyncState::Expired
            | AsyncState::Errored => {
                v.async_state = AsyncState::Complete;
                v.async_failure = None;
                Ok(v.wake())
            }
            state => Err(ChannelError::illegal_state(format!("complete in {state:?}"))),
        }
    }

    /// Timer expiry: `Started -> Expiring`. The timeout notification is
    /// delivered cooperatively by the next handling turn.
    pub fn on_timeout(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.async_state == AsyncState::Started {
            v.async_state = AsyncState::Expiring;
            v.timeout_delivered = false;
            v.wake()
        } else {
            false
        }
    }

    /// Checks whether the timeout notification resolved the context.
    /// Unresolved contexts transition to `Expired` and fall through to an
    /// error response.
    pub(crate) fn timeout_unresolved(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.async_state == AsyncState::Expiring {
            v.async_state = AsyncState::Expired;
            true
        } else {
            false
        }
    }

    /// Absorbs a failure according to where the exchange currently is: a
    /// failing dispatch schedules `SendError`, a suspended async context
    /// captures the failure for `AsyncError` delivery.
    pub fn on_error(&self, failure: Arc<ChannelError>) -> Result<bool, ChannelError> {
        let mut v = lock(&self.vector);
        match (v.request, v.async_state) {
            (RequestState::Dispatched, AsyncState::NotAsync) => {
                if v.output != OutputState::Open {
                    return Err(ChannelError::illegal_state("response committed"));
                }
                v.send_error = true;
                Ok(false)
            }
            (_, AsyncState::Started | AsyncState::Expiring) => {
                v.async_state = AsyncState::Errored;
                v.async_failure = Some(failure);
                Ok(v.wake())
            }
            (request, async_state) => Err(ChannelError::illegal_state(format!(
                "on_error in {request:?}/{async_state:?}"
            ))),
        }
    }

    /// Consumes the captured async failure for rethrowing; the exchange is
    /// back in a plain dispatched turn afterwards.
    pub(crate) fn take_async_failure(&self) -> Option<Arc<ChannelError>> {
        let mut v = lock(&self.vector);
        let failure = v.async_failure.take();
        v.async_state = AsyncState::NotAsync;
        v.request = RequestState::Dispatched;
        failure
    }

    /// Schedules a `SendError` action. Legal only while the response is
    /// uncommitted. Cancels any in-flight async cycle: the error dispatch
    /// supersedes it.
    pub fn send_error(&self) -> Result<bool, ChannelError> {
        let mut v = lock(&self.vector);
        if v.output != OutputState::Open {
            return Err(ChannelError::illegal_state("committed"));
        }
        v.send_error = true;
        v.async_state = AsyncState::NotAsync;
        v.async_failure = None;
        Ok(v.wake())
    }

    /// Marks the exchange as finishing its response.
    pub(crate) fn completing(&self) {
        let mut v = lock(&self.vector);
        if v.request != RequestState::Completed {
            v.request = RequestState::Completing;
        }
    }

    /// The response has fully completed (or terminally failed); the next
    /// action is `Terminated`. Returns true if the caller must reschedule.
    pub fn completed(&self) -> bool {
        let mut v = lock(&self.vector);
        v.request = RequestState::Completed;
        v.wake()
    }

    /// `Open -> Committed`. Returns true exactly on the transition.
    pub fn commit_response(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.output == OutputState::Open {
            v.output = OutputState::Committed;
            true
        } else {
            false
        }
    }

    /// Reverts an informational commit: `Committed -> Open`, leaving the
    /// final response still to come.
    pub fn partial_response(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.output == OutputState::Committed {
            v.output = OutputState::Open;
            true
        } else {
            false
        }
    }

    /// `Committed -> Completed`. Returns true exactly on the transition.
    pub fn complete_response(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.output == OutputState::Committed {
            v.output = OutputState::Completed;
            true
        } else {
            false
        }
    }

    /// Terminal abort. Returns true exactly on the first transition.
    pub fn abort_response(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.output == OutputState::Aborted {
            false
        } else {
            v.output = OutputState::Aborted;
            true
        }
    }

    /// Registers read interest: the application wants content that is not
    /// available yet.
    pub(crate) fn on_read_unready(&self) {
        let mut v = lock(&self.vector);
        if v.input == InputState::Idle {
            v.input = InputState::Unready;
        }
    }

    /// Content became producible. Returns true if the caller must
    /// reschedule the channel to deliver a read callback.
    pub fn on_content_producible(&self) -> bool {
        let mut v = lock(&self.vector);
        if v.input == InputState::Unready {
            v.input = InputState::Ready;
            v.wake()
        } else {
            false
        }
    }

    pub(crate) fn begin_produce(&self) {
        let mut v = lock(&self.vector);
        if !matches!(v.input, InputState::Eof | InputState::Errored) {
            v.input = InputState::Producing;
        }
    }

    pub(crate) fn end_produce(&self, produced: Option<&Chunk>) {
        let mut v = lock(&self.vector);
        v.input = match produced {
            Some(Chunk::Eof) => InputState::Eof,
            Some(Chunk::Error(_)) => InputState::Errored,
            _ if matches!(v.input, InputState::Eof | InputState::Errored) => v.input,
            _ => InputState::Idle,
        };
    }

    /// A pending write finished while write interest was registered.
    pub(crate) fn on_write_possible(&self) -> bool {
        let mut v = lock(&self.vector);
        v.write_ready = true;
        v.wake()
    }

    pub fn is_response_committed(&self) -> bool {
        lock(&self.vector).output != OutputState::Open
    }

    pub fn is_response_completed(&self) -> bool {
        lock(&self.vector).output == OutputState::Completed
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.vector).output == OutputState::Aborted
    }

    /// True once the request lifecycle has fully completed.
    pub fn is_completed(&self) -> bool {
        lock(&self.vector).request == RequestState::Completed
    }

    pub fn is_handling(&self) -> bool {
        lock(&self.vector).handle == HandleState::Handling
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.vector).handle == HandleState::Waiting
    }

    pub fn is_async(&self) -> bool {
        lock(&self.vector).async_state != AsyncState::NotAsync
    }

    pub(crate) fn recycle(&self) {
        let mut v = lock(&self.vector);
        if v.handle != HandleState::Terminated && v.handle != HandleState::Idle {
            debug!(state = %describe(&v), "recycling a live exchange");
        }
        *v = Vector::new();
    }

    /// One-line state summary for logging.
    pub fn describe(&self) -> String {
        describe(&lock(&self.vector))
    }
}

fn describe(v: &Vector) -> String {
    format!(
        "h={:?} r={:?} a={:?} o={:?} i={:?}{}",
        v.handle,
        v.request,
        v.async_state,
        v.output,
        v.input,
        if v.send_error { " sendError" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_exchange_lifecycle() {
        let state = ChannelState::new();
        assert_eq!(state.handling().unwrap(), Action::Dispatch);
        // handler returned without suspending
        assert_eq!(state.unhandle(), Action::Complete);
        // complete-output callback fires inline
        assert!(!state.completed());
        assert_eq!(state.unhandle(), Action::Terminated);
    }

    #[test]
    fn handling_is_exclusive() {
        let state = ChannelState::new();
        assert_eq!(state.handling().unwrap(), Action::Dispatch);
        assert!(state.handling().is_err());
    }

    #[test]
    fn async_suspend_resume() {
        let state = ChannelState::new();
        assert_eq!(state.handling().unwrap(), Action::Dispatch);
        state.start_async().unwrap();
        assert_eq!(state.unhandle(), Action::Wait);
        assert!(state.is_suspended());

        // resume from another thread
        assert!(state.dispatch().unwrap());
        assert_eq!(state.handling().unwrap(), Action::AsyncDispatch);
        assert_eq!(state.unhandle(), Action::Complete);
        assert!(!state.completed());
        assert_eq!(state.unhandle(), Action::Terminated);
    }

    #[test]
    fn async_complete_without_dispatch() {
        let state = ChannelState::new();
        state.handling().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.unhandle(), Action::Wait);

        assert!(state.complete().unwrap());
        assert_eq!(state.handling().unwrap(), Action::Complete);
    }

    #[test]
    fn start_async_outside_dispatch_is_refused() {
        let state = ChannelState::new();
        assert!(state.start_async().is_err());
        state.handling().unwrap();
        state.start_async().unwrap();
        assert!(state.start_async().is_err());
    }

    #[test]
    fn timeout_is_delivered_once_then_expires() {
        let state = ChannelState::new();
        state.handling().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.unhandle(), Action::Wait);

        assert!(state.on_timeout());
        assert_eq!(state.handling().unwrap(), Action::AsyncTimeout);
        // the notification did not resolve the context
        assert!(state.timeout_unresolved());
        assert!(!state.timeout_unresolved());
    }

    #[test]
    fn timeout_resolved_by_complete() {
        let state = ChannelState::new();
        state.handling().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.unhandle(), Action::Wait);

        assert!(state.on_timeout());
        assert_eq!(state.handling().unwrap(), Action::AsyncTimeout);
        state.complete().unwrap();
        assert!(!state.timeout_unresolved());
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn dispatch_failure_schedules_send_error() {
        let state = ChannelState::new();
        state.handling().unwrap();
        assert!(!state.on_error(Arc::new(ChannelError::application("boom"))).unwrap());
        assert_eq!(state.unhandle(), Action::SendError);
        // error response generated without an error page
        state.completing();
        assert!(!state.completed());
        assert_eq!(state.unhandle(), Action::Terminated);
    }

    #[test]
    fn async_failure_is_rethrown() {
        let state = ChannelState::new();
        state.handling().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.unhandle(), Action::Wait);

        assert!(state.on_error(Arc::new(ChannelError::application("late boom"))).unwrap());
        assert_eq!(state.handling().unwrap(), Action::AsyncError);
        assert!(state.take_async_failure().is_some());
        // rethrow lands in on_error as a plain dispatch failure
        assert!(!state.on_error(Arc::new(ChannelError::application("late boom"))).unwrap());
        assert_eq!(state.unhandle(), Action::SendError);
    }

    #[test]
    fn commit_is_once_and_abort_is_idempotent() {
        let state = ChannelState::new();
        assert!(state.commit_response());
        assert!(!state.commit_response());
        assert!(state.complete_response());
        assert!(!state.complete_response());
        assert!(state.abort_response());
        assert!(!state.abort_response());
    }

    #[test]
    fn informational_commit_reverts() {
        let state = ChannelState::new();
        assert!(state.commit_response());
        assert!(state.partial_response());
        assert!(!state.is_response_committed());
        // the final response can commit again
        assert!(state.commit_response());
        assert!(state.complete_response());
        assert!(!state.partial_response());
    }

    #[test]
    fn send_error_during_completion_redispatches() {
        let state = ChannelState::new();
        state.handling().unwrap();
        assert_eq!(state.unhandle(), Action::Complete);
        // the completion step found the request unhandled
        state.send_error().unwrap();
        assert_eq!(state.unhandle(), Action::SendError);
        // an error page dispatch ran; completion is reached again
        assert_eq!(state.unhandle(), Action::Complete);
        state.completed();
        assert_eq!(state.unhandle(), Action::Terminated);
    }

    #[test]
    fn send_error_requires_uncommitted_response() {
        let state = ChannelState::new();
        state.handling().unwrap();
        assert!(state.send_error().is_ok());
        assert!(state.commit_response());
        assert!(state.send_error().is_err());
    }

    #[test]
    fn read_interest_wakes_the_exchange() {
        let state = ChannelState::new();
        state.handling().unwrap();
        state.start_async().unwrap();
        state.on_read_unready();
        assert_eq!(state.unhandle(), Action::Wait);

        assert!(state.on_content_producible());
        assert!(!state.on_content_producible());
        assert_eq!(state.handling().unwrap(), Action::ReadCallback);
        assert_eq!(state.unhandle(), Action::Wait);
    }

    #[test]
    fn write_completion_wakes_the_exchange() {
        let state = ChannelState::new();
        state.handling().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.unhandle(), Action::Wait);

        assert!(state.on_write_possible());
        assert_eq!(state.handling().unwrap(), Action::WriteCallback);
        assert_eq!(state.unhandle(), Action::Wait);
    }

    #[test]
    fn recycle_resets_for_the_next_exchange() {
        let state = ChannelState::new();
        state.handling().unwrap();
        assert_eq!(state.unhandle(), Action::Complete);
        state.completed();
        assert_eq!(state.unhandle(), Action::Terminated);

        state.recycle();
        assert_eq!(state.handling().unwrap(), Action::Dispatch);
    }
}
