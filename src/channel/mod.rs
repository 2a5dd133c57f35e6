//! The channel driver: one exchange's active life cycle.
//!
//! A `Channel` is both the passive receiver of parser events (`on_request`,
//! `on_content`, `on_request_complete`, `on_bad_message`) and the active
//! owner of the request/response life cycle: `handle` pulls actions from the
//! state machine and executes them, dispatching into the application,
//! generating error responses and completing the exchange, suspending and
//! resuming as async events demand.

pub mod input;
pub mod listener;
pub mod output;
pub mod state;

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::channel::oneshot;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tracing::{debug, trace, warn};

use crate::config::Connector;
use crate::error::{clamp_error_status, ChannelError};
use crate::exchange::{
    status_has_no_body, Chunk, DispatchType, Request, RequestMeta, Response, ResponseMeta,
};
use crate::lock;
use crate::scheduling::TimerHandle;
use crate::transport::{Endpoint, SendCallback, Transport};

use input::{InputPort, InputPump};
use listener::{ChannelListener, Listeners};
use output::OutputPipeline;
use state::{Action, ChannelState};

/// One HTTP exchange's driver on a connection.
///
/// The channel exclusively owns its request, response, input and output; it
/// is shared behind an `Arc` so that write completions, timers and async
/// application calls can reach it from other threads. At most one thread
/// advances the exchange at a time; everyone else goes through the state
/// machine.
pub struct Channel {
    me: Weak<Channel>,
    connector: Arc<Connector>,
    endpoint: Arc<dyn Endpoint>,
    transport: Arc<dyn Transport>,
    state: Arc<ChannelState>,
    request: Request,
    response: Response,
    input: InputPump,
    output: OutputPipeline,
    listeners: Listeners,
    requests: AtomicU64,
    committed_meta: Mutex<Option<ResponseMeta>>,
    saved_idle_timeout: Mutex<Option<Option<Duration>>>,
    timer: Mutex<Option<TimerHandle>>,
    timeout_listeners: Mutex<Vec<Arc<dyn Fn(&Channel) + Send + Sync>>>,
}

impl Channel {
    pub fn new(
        connector: Arc<Connector>,
        endpoint: Arc<dyn Endpoint>,
        transport: Arc<dyn Transport>,
        port: Arc<dyn InputPort>,
    ) -> Arc<Self> {
        let state = Arc::new(ChannelState::new());
        let buffer_size = connector.config().output_buffer_size;
        let listeners = Listeners::new(connector.listener().clone());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            input: InputPump::new(port, state.clone()),
            output: OutputPipeline::new(buffer_size),
            state,
            request: Request::new(),
            response: Response::new(),
            listeners,
            connector,
            endpoint,
            transport,
            requests: AtomicU64::new(0),
            committed_meta: Mutex::new(None),
            saved_idle_timeout: Mutex::new(None),
            timer: Mutex::new(None),
            timeout_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn output(&self) -> &OutputPipeline {
        &self.output
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// The number of requests handled on this connection.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Bytes confirmed written to the transport, post interception.
    pub fn bytes_written(&self) -> u64 {
        self.output.written()
    }

    /// The frozen metadata of the committed response, if any.
    pub fn committed_meta(&self) -> Option<ResponseMeta> {
        lock(&self.committed_meta).clone()
    }

    pub fn is_committed(&self) -> bool {
        self.state.is_response_committed()
    }

    pub fn is_persistent(&self) -> bool {
        self.endpoint.is_open()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.endpoint.idle_timeout()
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.endpoint.set_idle_timeout(timeout);
    }

    /// Adds a per-exchange listener; cleared on recycle. Returns false when
    /// the transient list is full.
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) -> bool {
        self.listeners.add_transient(listener)
    }

    pub(crate) fn weak(&self) -> Weak<Channel> {
        self.me.clone()
    }

    pub(crate) fn reschedule(&self) {
        if let Some(channel) = self.me.upgrade() {
            self.connector.executor().execute(Box::new(move || {
                channel.handle();
            }));
        }
    }

    /// Runnable entry point: advances the loop for one scheduling quantum.
    pub fn run(&self) {
        self.handle();
    }

    /// Advances the exchange until it suspends or terminates.
    ///
    /// Returns true if the channel finished handling, false if the exchange
    /// is suspended awaiting an external event.
    pub fn handle(&self) -> bool {
        debug!(state = %self.state.describe(), "handle");

        let mut action = match self.state.handling() {
            Ok(action) => action,
            Err(cause) => {
                debug!(cause = %cause, "handle refused");
                return true;
            }
        };

        loop {
            if self.connector.server().is_stopped() {
                break;
            }
            debug!(action = ?action, "action");
            match action {
                Action::Terminated => {
                    self.on_completed();
                    break;
                }
                Action::Wait => {
                    debug!("suspended");
                    return false;
                }
                action => {
                    if let Err(failure) = self.execute(action) {
                        self.handle_exception(failure);
                    }
                }
            }
            action = self.state.unhandle();
        }

        debug!(state = %self.state.describe(), "exit handle");
        true
    }

    fn execute(&self, action: Action) -> Result<(), Arc<ChannelError>> {
        match action {
            Action::Dispatch => {
                if !self.request.has_meta() {
                    return Err(Arc::new(ChannelError::illegal_state(
                        "dispatch without request metadata",
                    )));
                }
                self.dispatch(DispatchType::Request, &|channel: &Channel| {
                    for customizer in &channel.connector.config().customizers {
                        customizer.customize(channel)?;
                        if channel.request.is_handled() {
                            return Ok(());
                        }
                    }
                    channel.connector.server().handle(channel)
                })
            }
            Action::AsyncDispatch => self.dispatch(DispatchType::Async, &|channel: &Channel| {
                channel.connector.server().handle_async(channel)
            }),
            Action::AsyncTimeout => {
                self.run_timeout_listeners();
                if self.state.timeout_unresolved() {
                    if let Err(cause) =
                        self.send_error(StatusCode::INTERNAL_SERVER_ERROR, Some("async context timeout"))
                    {
                        self.abort(&Arc::new(cause));
                    }
                }
                Ok(())
            }
            Action::AsyncError => Err(self
                .state
                .take_async_failure()
                .unwrap_or_else(|| Arc::new(ChannelError::illegal_state("missing async failure")))),
            Action::SendError => self.send_error_action(),
            Action::ReadCallback => self.guarded(|| self.input.run_read_listener(self)),
            Action::WriteCallback => self.guarded(|| self.output.run_write_listener(self)),
            Action::Complete => self.complete_action(),
            Action::Wait | Action::Terminated => Ok(()),
        }
    }

    fn guarded(&self, f: impl FnOnce()) -> Result<(), Arc<ChannelError>> {
        catch_unwind(AssertUnwindSafe(f))
            .map_err(|panic| Arc::new(ChannelError::application(panic_message(panic.as_ref()))))
    }

    fn dispatch(
        &self,
        dispatch: DispatchType,
        f: &dyn Fn(&Channel) -> Result<(), ChannelError>,
    ) -> Result<(), Arc<ChannelError>> {
        self.request.set_handled(false);
        self.output.reopen();
        self.request.set_dispatch_type(dispatch);
        self.listeners.on_before_dispatch(&self.request);

        let outcome = match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(Arc::new(failure)),
            Err(panic) => Err(Arc::new(ChannelError::application(panic_message(panic.as_ref())))),
        };

        if let Err(failure) = &outcome {
            self.listeners.on_dispatch_failure(&self.request, failure);
        }
        self.listeners.on_after_dispatch(&self.request);
        self.request.clear_dispatch_type();
        outcome
    }

    fn send_error_action(&self) -> Result<(), Arc<ChannelError>> {
        let outcome: Result<(), Arc<ChannelError>> = (|| {
            self.output.reset_buffer();
            self.response.reset_content_headers();

            // The status and reason recorded when the error was raised win
            // over anything the failed dispatch left behind.
            let (status, reason) = self.request.error_status().unwrap_or((500, None));
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            self.response.set_status(status);
            self.response.set_reason(reason);

            // Content left over from the failed dispatch is consumed here;
            // this cannot be deferred to completion because the response
            // will be committed by then.
            self.ensure_consume_all_or_not_persistent();

            let method = self.request.method().unwrap_or(Method::GET);
            let handler = match self.connector.error_handler() {
                Some(handler)
                    if !status_has_no_body(status) && handler.error_page_for_method(&method) =>
                {
                    handler.clone()
                }
                _ => {
                    // No body allowed or nobody to generate one: a minimal
                    // response is all the client gets.
                    self.send_response_and_complete();
                    return Ok(());
                }
            };
            let dispatchable = move |channel: &Channel| {
                handler.handle(channel)?;
                channel.request.set_handled(true);
                Ok(())
            };
            self.dispatch(DispatchType::Error, &dispatchable)
        })();

        if let Err(failure) = outcome {
            debug!(cause = %failure, "could not perform error dispatch, aborting");
            if self.state.is_response_committed() {
                self.abort(&failure);
            } else {
                self.output.reset_buffer();
                self.send_response_and_complete();
            }
        }
        Ok(())
    }

    fn complete_action(&self) -> Result<(), Arc<ChannelError>> {
        if !self.state.is_response_committed() {
            if !self.request.is_handled() && !self.output.is_closed() {
                // The request was not actually handled.
                self.send_error(StatusCode::NOT_FOUND, None).map_err(Arc::new)?;
                return Ok(());
            }
            if self.response.status().as_u16() >= 200 {
                self.ensure_consume_all_or_not_persistent();
            }
        }

        // RFC 7230, section 3.3.
        let written = self.output.submitted() + self.output.buffered() as u64;
        if !self.request.is_head()
            && self.response.status() != StatusCode::NOT_MODIFIED
            && !self.response.is_content_complete(written)
            && self.send_error_or_abort("insufficient content written")
        {
            return Ok(());
        }

        // An upgrade preparation may have scheduled an error response.
        if self.check_and_prepare_upgrade() {
            return Ok(());
        }

        let me = self.me.clone();
        self.output.complete(
            self,
            Box::new(move |result| {
                if let Some(channel) = me.upgrade() {
                    if let Err(failure) = &result {
                        debug!(cause = %failure, "complete output failed");
                        channel.abort(failure);
                    }
                    if channel.state.completed() {
                        channel.reschedule();
                    }
                }
            }),
        );
        Ok(())
    }

    /// Consumes the remaining request content, or marks the response
    /// non-persistent when it cannot: HTTP/1.0 responses lose their
    /// keep-alive tokens, HTTP/1.1 responses gain `Connection: close`.
    pub fn ensure_consume_all_or_not_persistent(&self) {
        let Some(version) = self.request.version() else {
            return;
        };
        if version != Version::HTTP_10 && version != Version::HTTP_11 {
            return;
        }
        if self.input.consume_all() {
            return;
        }
        self.response.with_headers(|headers| {
            let mut tokens =
                connection_tokens(headers, |token| !token.eq_ignore_ascii_case("keep-alive"));
            if version == Version::HTTP_11
                && !tokens.iter().any(|token| token.eq_ignore_ascii_case("close"))
            {
                tokens.push("close".to_string());
            }
            set_connection_tokens(headers, tokens);
        });
    }

    /// Sends an error response, or aborts when the response can no longer
    /// be changed. Returns true if the error response was scheduled.
    pub fn send_error_or_abort(&self, message: &str) -> bool {
        if self.state.is_response_committed() {
            self.abort(&Arc::new(ChannelError::from(io::Error::new(
                io::ErrorKind::Other,
                message.to_string(),
            ))));
            return false;
        }
        match self.send_error(StatusCode::INTERNAL_SERVER_ERROR, Some(message)) {
            Ok(()) => true,
            Err(failure) => {
                trace!(cause = %failure, "ignored");
                self.abort(&Arc::new(failure));
                false
            }
        }
    }

    /// Schedules an error response for this exchange. Fails once the
    /// response is committed.
    pub fn send_error(&self, status: StatusCode, reason: Option<&str>) -> Result<(), ChannelError> {
        self.request.set_error(status.as_u16(), reason.map(str::to_owned));
        self.cancel_async_timer();
        if self.state.send_error()? {
            self.reschedule();
        }
        Ok(())
    }

    /// Classifies a failure, then recovers: committed responses are
    /// aborted, anything earlier is routed into the error pipeline.
    fn handle_exception(&self, failure: Arc<ChannelError>) {
        let uri = self
            .request
            .meta()
            .map(|meta| meta.uri().to_string())
            .unwrap_or_default();

        if failure.is_quiet() || self.connector.server().is_stopped() {
            debug!(uri = %uri, cause = %failure, "exchange failed quietly");
        } else if failure.is_no_stack() {
            if tracing::enabled!(tracing::Level::DEBUG) {
                warn!(uri = %uri, cause = ?failure, "exchange failed");
            } else {
                warn!(uri = %uri, cause = %failure, "exchange failed");
            }
        } else {
            warn!(uri = %uri, cause = ?failure, "handler failure");
        }

        self.listeners.on_request_failure(&self.request, &failure);

        if self.state.is_response_committed() {
            self.abort(&failure);
        } else {
            let status = failure.status();
            self.request.set_error(status.as_u16(), Some(failure.to_string()));
            self.cancel_async_timer();
            match self.state.on_error(failure.clone()) {
                Ok(reschedule) => {
                    if reschedule {
                        self.reschedule();
                    }
                }
                Err(_) => self.abort(&failure),
            }
        }
    }

    /// Terminal cancellation: drops the connection. Idempotent and safe
    /// from any thread.
    pub fn abort(&self, failure: &Arc<ChannelError>) {
        if self.state.abort_response() {
            self.listeners.on_response_failure(&self.request, failure);
            self.transport.abort(failure);
        }
    }

    fn check_and_prepare_upgrade(&self) -> bool {
        self.connector
            .upgrader()
            .map_or(false, |upgrader| upgrader.check_and_prepare_upgrade(self))
    }

    // ------------------------------------------------------------------
    // Parser-driven entry points.

    /// A request line and headers have been parsed.
    pub fn on_request(&self, meta: RequestMeta) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.request.mark_arrived();

        if self.connector.config().send_date_header
            && !self.response.contains_header(http::header::DATE)
        {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
                self.response.with_headers(|headers| {
                    headers.insert(http::header::DATE, value);
                });
            }
        }

        if let Some(idle) = self.connector.config().idle_timeout {
            let current = self.endpoint.idle_timeout();
            if current != Some(idle) {
                *lock(&self.saved_idle_timeout) = Some(current);
                self.endpoint.set_idle_timeout(Some(idle));
            }
        }

        debug!(method = %meta.method(), uri = %meta.uri(), version = ?meta.version(), "request");
        self.request.set_meta(Arc::new(meta));
        self.listeners.on_request_begin(&self.request);
    }

    /// A request content chunk has been parsed. Buffering belongs to the
    /// input port; this only notifies observers.
    pub fn on_content(&self, content: &Bytes) {
        trace!(len = content.len(), "content");
        self.listeners.on_request_content(&self.request, content);
    }

    /// The end of the request content has been detected.
    pub fn on_content_complete(&self) {
        self.listeners.on_request_content_end(&self.request);
    }

    /// The request trailers have been parsed.
    pub fn on_trailers(&self, trailers: HeaderMap) {
        self.request.set_trailers(trailers);
        self.listeners.on_request_trailers(&self.request);
    }

    /// The request has been fully parsed. Returns true if the channel must
    /// be rescheduled.
    pub fn on_request_complete(&self) -> bool {
        let reschedule = self.input.eof();
        self.listeners.on_request_end(&self.request);
        reschedule
    }

    /// The parser could not produce a request. Generates a minimal
    /// synthetic response when the exchange can still take it, and
    /// re-raises the failure for the caller otherwise.
    pub fn on_bad_message(&self, failure: ChannelError) -> Result<(), ChannelError> {
        let (status, reason) = match &failure {
            ChannelError::BadMessage { status, reason } => {
                (clamp_error_status(*status), reason.clone())
            }
            other => (400, other.to_string()),
        };
        let shared = Arc::new(ChannelError::bad_message(status, reason.clone()));
        self.listeners.on_request_failure(&self.request, &shared);

        let action = match self.state.handling() {
            Ok(action) => action,
            Err(cause) => {
                // The bad message cannot be handled in the current state;
                // re-raise so somebody up the stack can.
                self.abort(&Arc::new(cause));
                return Err(ChannelError::bad_message(status, reason));
            }
        };

        if action == Action::Dispatch {
            let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            let mut headers = HeaderMap::new();
            let content = self
                .connector
                .error_handler()
                .and_then(|handler| handler.bad_message_error(status_code, &reason, &mut headers));
            let length = content.as_ref().map_or(0, |bytes| bytes.len() as u64);
            let meta = ResponseMeta::new(
                status_code,
                Some(reason).filter(|r| !r.is_empty()),
                Version::HTTP_11,
                headers,
                Some(length),
            );
            self.state.completing();
            let me = self.me.clone();
            self.send_response(
                Some(meta),
                content,
                true,
                Box::new(move |result| {
                    if let Err(cause) = &result {
                        debug!(cause = %cause, "unable to send bad message response");
                    }
                    if let Some(channel) = me.upgrade() {
                        channel.state.completed();
                    }
                }),
            );
        }

        self.on_completed();
        Ok(())
    }

    /// Idle-timeout restore, final notifications, transport completion.
    pub fn on_completed(&self) {
        debug!(written = self.output.written(), "completed");
        if let Some(saved) = lock(&self.saved_idle_timeout).take() {
            self.endpoint.set_idle_timeout(saved);
        }
        self.cancel_async_timer();
        self.listeners.on_complete(&self.request);
        self.transport.on_completed();
    }

    // ------------------------------------------------------------------
    // Input-side entry points.

    /// True iff a content chunk is immediately available. Otherwise read
    /// interest is registered with the input port.
    pub fn need_content(&self) -> bool {
        self.input.need_content()
    }

    /// The next available content chunk, without blocking.
    pub fn produce_content(&self) -> Option<Chunk> {
        self.input.produce_content()
    }

    /// Content became producible at the input port. Returns true if the
    /// channel must be rescheduled.
    pub fn on_content_producible(&self) -> bool {
        self.input.on_content_producible()
    }

    /// Fails the input. Returns true if the channel must be rescheduled.
    pub fn failed(&self, failure: ChannelError) -> bool {
        self.input.failed(Arc::new(failure))
    }

    /// Fails everything buffered in the input. Returns true if EOF had
    /// already been reached.
    pub fn fail_all_content(&self, failure: ChannelError) -> bool {
        self.input.fail_all_content(&Arc::new(failure))
    }

    /// Registers the callback delivered when registered read interest is
    /// satisfied.
    pub fn set_read_listener(&self, listener: Arc<dyn Fn(&Channel) + Send + Sync>) {
        self.input.set_read_listener(listener);
    }

    // ------------------------------------------------------------------
    // Output-side entry points.

    /// Non-blocking write through the output pipeline; the first write
    /// commits the response.
    pub fn write(&self, content: Bytes, last: bool, callback: SendCallback) {
        self.output.write(self, content, last, callback);
    }

    /// Appends to the output aggregation buffer without committing.
    pub fn buffer_content(&self, data: &[u8]) {
        self.output.append(data);
    }

    /// Discards buffered response content. Fails once committed.
    pub fn reset_content(&self) -> Result<(), ChannelError> {
        if self.state.is_response_committed() {
            return Err(ChannelError::illegal_state("committed"));
        }
        self.output.reset_buffer();
        Ok(())
    }

    /// Registers the callback delivered when a pending write has finished
    /// and the output can take another.
    pub fn set_write_listener(&self, listener: Arc<dyn Fn(&Channel) + Send + Sync>) {
        self.output.set_write_listener(listener);
    }

    /// True when a non-blocking write would be accepted now; registers
    /// write interest otherwise.
    pub fn is_write_ready(&self) -> bool {
        self.output.is_ready()
    }

    /// Sends response data, committing the response if this is the first
    /// send. `meta` may only be passed on the committing call; a non-`None`
    /// `meta` on a committed response fails the callback.
    pub fn send_response(
        &self,
        meta: Option<ResponseMeta>,
        content: Option<Bytes>,
        last: bool,
        callback: SendCallback,
    ) -> bool {
        let committing = self.state.commit_response();
        debug!(
            committing,
            last,
            len = content.as_ref().map_or(0, Bytes::len),
            "send response"
        );

        if committing {
            // Listeners may adjust the response right up to the commit.
            self.listeners.on_response_begin(&self.request);
            let meta = meta.unwrap_or_else(|| {
                self.response
                    .new_meta(self.request.version().unwrap_or(Version::HTTP_11))
            });
            debug!(status = %meta.status(), "commit");
            let informational = meta.status().is_informational();
            *lock(&self.committed_meta) = Some(meta.clone());

            let callback = if informational {
                self.send_1xx_callback(callback)
            } else {
                self.send_callback(callback, content.clone(), true, last)
            };
            let request_meta = self.request.meta();
            self.transport
                .send(request_meta.as_deref(), Some(meta), content, last, callback);
        } else if meta.is_none() {
            let callback = self.send_callback(callback, content.clone(), false, last);
            let request_meta = self.request.meta();
            self.transport
                .send(request_meta.as_deref(), None, content, last, callback);
        } else {
            callback(Err(Arc::new(ChannelError::illegal_state("committed"))));
        }
        committing
    }

    /// Blocking variant of [`Channel::send_response`]: waits for the write
    /// to complete and propagates its failure, aborting the exchange.
    pub fn send_response_blocking(
        &self,
        meta: Option<ResponseMeta>,
        content: Option<Bytes>,
        last: bool,
    ) -> Result<bool, Arc<ChannelError>> {
        let (tx, rx) = oneshot::channel();
        let committing = self.send_response(
            meta,
            content,
            last,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        match futures::executor::block_on(rx) {
            Ok(Ok(())) => Ok(committing),
            Ok(Err(failure)) => {
                debug!(cause = %failure, "unable to send response");
                self.abort(&failure);
                Err(failure)
            }
            Err(_) => {
                let failure = Arc::new(ChannelError::illegal_state("send callback dropped"));
                self.abort(&failure);
                Err(failure)
            }
        }
    }

    /// Sends whatever is buffered as the complete response and terminates
    /// the exchange.
    pub fn send_response_and_complete(&self) {
        self.request.set_handled(true);
        self.state.completing();
        let content = self.output.take_buffer();
        self.output.mark_closed();
        if self.response.declared_content_length().is_none() {
            self.response.set_content_length(content.len() as u64);
        }
        let me = self.me.clone();
        let callback: SendCallback = Box::new(move |result| {
            if let Some(channel) = me.upgrade() {
                if let Err(cause) = &result {
                    debug!(cause = %cause, "minimal response failed");
                }
                if channel.state.completed() {
                    channel.reschedule();
                }
            }
        });
        let content = if content.is_empty() { None } else { Some(content) };
        self.send_response(None, content, true, callback);
    }

    fn send_callback(
        &self,
        inner: SendCallback,
        content: Option<Bytes>,
        commit: bool,
        complete: bool,
    ) -> SendCallback {
        let me = self.me.clone();
        Box::new(move |result| {
            let Some(channel) = me.upgrade() else {
                inner(result);
                return;
            };
            match result {
                Ok(()) => {
                    let length = content.as_ref().map_or(0, |bytes| bytes.len() as u64);
                    channel.output.add_written(length);
                    if commit {
                        channel.listeners.on_response_commit(&channel.request);
                    }
                    if let Some(bytes) = &content {
                        if !bytes.is_empty() {
                            channel.listeners.on_response_content(&channel.request, bytes);
                        }
                    }
                    if complete && channel.state.complete_response() {
                        channel.listeners.on_response_end(&channel.request);
                    }
                    inner(Ok(()));
                }
                Err(failure) => {
                    debug!(cause = %failure, "send failed");
                    if matches!(*failure, ChannelError::BadMessage { .. }) {
                        // A minimal 500 may still fit on the wire.
                        let nested = channel.clone();
                        let original = failure;
                        let request_meta = channel.request.meta();
                        channel.transport.send(
                            request_meta.as_deref(),
                            Some(ResponseMeta::minimal(StatusCode::INTERNAL_SERVER_ERROR)),
                            None,
                            true,
                            Box::new(move |retry| {
                                if retry.is_ok() {
                                    nested.output.mark_closed();
                                } else {
                                    nested.abort(&original);
                                }
                                inner(Err(original));
                            }),
                        );
                    } else {
                        channel.abort(&failure);
                        inner(Err(failure));
                    }
                }
            }
        })
    }

    fn send_1xx_callback(&self, inner: SendCallback) -> SendCallback {
        let me = self.me.clone();
        Box::new(move |result| {
            let Some(channel) = me.upgrade() else {
                inner(result);
                return;
            };
            match result {
                Ok(()) => {
                    // Informational sends revert the commit; the final
                    // response is still to come.
                    if channel.state.partial_response() {
                        inner(Ok(()));
                    } else {
                        inner(Err(Arc::new(ChannelError::illegal_state(
                            "no informational response pending",
                        ))));
                    }
                }
                Err(failure) => {
                    channel.abort(&failure);
                    inner(Err(failure));
                }
            }
        })
    }

    /// Asks the transport for an interim `100 Continue`.
    pub fn continue_100(&self, available: usize) -> Result<(), ChannelError> {
        self.transport.continue_100(available)
    }

    // ------------------------------------------------------------------
    // Async life cycle.

    /// Suspends the exchange after the current dispatch returns. A timer is
    /// armed with `timeout`, falling back to the configured default.
    pub fn start_async(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.state.start_async()?;
        self.request.set_handled(true);
        if let Some(delay) = timeout.or(self.connector.config().async_timeout) {
            let me = self.me.clone();
            let timer = self.connector.scheduler().schedule(
                delay,
                Box::new(move || {
                    if let Some(channel) = me.upgrade() {
                        channel.on_async_timeout();
                    }
                }),
            );
            *lock(&self.timer) = Some(timer);
        }
        Ok(())
    }

    /// Resumes a suspended exchange through the async handler path.
    pub fn async_dispatch(&self) -> Result<(), ChannelError> {
        self.cancel_async_timer();
        if self.state.dispatch()? {
            self.reschedule();
        }
        Ok(())
    }

    /// Completes a suspended exchange without a further dispatch.
    pub fn async_complete(&self) -> Result<(), ChannelError> {
        self.cancel_async_timer();
        if self.state.complete()? {
            self.reschedule();
        }
        Ok(())
    }

    /// Registers an async timeout observer; invoked cooperatively when the
    /// context expires. An observer that resolves the exchange (dispatch,
    /// complete, error response) prevents the fallback 500.
    pub fn add_timeout_listener(&self, listener: Arc<dyn Fn(&Channel) + Send + Sync>) {
        lock(&self.timeout_listeners).push(listener);
    }

    fn on_async_timeout(&self) {
        if self.state.on_timeout() {
            self.reschedule();
        }
    }

    fn run_timeout_listeners(&self) {
        let listeners: Vec<_> = lock(&self.timeout_listeners).clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
                debug!("timeout listener panicked");
            }
        }
    }

    fn cancel_async_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
    }

    /// Resets the channel for the next exchange on a persistent connection.
    pub fn recycle(&self) {
        debug!("recycle");
        self.cancel_async_timer();
        self.request.recycle();
        self.response.recycle();
        self.output.recycle();
        self.input.recycle();
        self.state.recycle();
        *lock(&self.committed_meta) = None;
        *lock(&self.saved_idle_timeout) = None;
        lock(&self.timeout_listeners).clear();
        self.listeners.clear_transient();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn connection_tokens(headers: &HeaderMap, keep: impl Fn(&str) -> bool) -> Vec<String> {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter(|token| keep(token))
        .map(str::to_string)
        .collect()
}

fn set_connection_tokens(headers: &mut HeaderMap, tokens: Vec<String>) {
    if tokens.is_empty() {
        headers.remove(http::header::CONNECTION);
    } else if let Ok(value) = HeaderValue::from_str(&tokens.join(", ")) {
        headers.insert(http::header::CONNECTION, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_tokens_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("keep-alive, upgrade"),
        );
        let tokens = connection_tokens(&headers, |t| !t.eq_ignore_ascii_case("keep-alive"));
        set_connection_tokens(&mut headers, tokens);

        assert_eq!(
            headers.get(http::header::CONNECTION),
            Some(&HeaderValue::from_static("upgrade"))
        );
    }

    #[test]
    fn lone_keep_alive_clears_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("Keep-Alive"),
        );
        let tokens = connection_tokens(&headers, |t| !t.eq_ignore_ascii_case("keep-alive"));
        set_connection_tokens(&mut headers, tokens);

        assert!(headers.get(http::header::CONNECTION).is_none());
    }

    #[test]
    fn multiple_connection_headers_are_merged() {
        let mut headers = HeaderMap::new();
        headers.append(
            http::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers.append(http::header::CONNECTION, HeaderValue::from_static("te"));
        let mut tokens = connection_tokens(&headers, |t| !t.eq_ignore_ascii_case("keep-alive"));
        tokens.push("close".to_string());
        set_connection_tokens(&mut headers, tokens);

        assert_eq!(
            headers.get(http::header::CONNECTION),
            Some(&HeaderValue::from_static("te, close"))
        );
        assert_eq!(headers.get_all(http::header::CONNECTION).iter().count(), 1);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
        assert_eq!(panic_message(&42_u32), "handler panicked");
    }
}
