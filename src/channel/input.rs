//! The input side of an exchange: demand-driven delivery of request content
//! from the transport to the application.
//!
//! The protocol glue implements [`InputPort`]; the [`InputPump`] bridges a
//! port and the state machine, registering read interest when the
//! application outruns the parser and computing when a suspended exchange
//! must be rescheduled. [`ChunkQueue`] is the buffering port used by
//! HTTP/1-style embedders and by the tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::channel::state::ChannelState;
use crate::channel::Channel;
use crate::error::ChannelError;
use crate::exchange::Chunk;
use crate::lock;

/// Protocol-side content source, implemented per transport.
pub trait InputPort: Send + Sync {
    /// True iff a chunk is immediately available. When none is, the port
    /// must arrange for `Channel::on_content_producible` to be called once
    /// content arrives; asking again while that demand is outstanding is
    /// idempotent.
    fn need_content(&self) -> bool;

    /// The next available chunk without blocking, or `None`. Once a special
    /// chunk has been produced, every later call produces the same special
    /// chunk and `need_content` stays true.
    fn produce_content(&self) -> Option<Chunk>;

    /// Fails and drains everything currently buffered. Returns true if EOF
    /// had already been reached, i.e. nothing more will arrive.
    fn fail_all_content(&self, failure: &Arc<ChannelError>) -> bool;

    /// Marks the input terminally failed; buffered chunks are still
    /// delivered first.
    fn fail(&self, failure: Arc<ChannelError>);

    /// Marks end-of-input.
    fn eof(&self);
}

/// Bridges the input port and the state machine.
pub struct InputPump {
    port: Arc<dyn InputPort>,
    state: Arc<ChannelState>,
    read_listener: Mutex<Option<Arc<dyn Fn(&Channel) + Send + Sync>>>,
}

impl InputPump {
    pub(crate) fn new(port: Arc<dyn InputPort>, state: Arc<ChannelState>) -> Self {
        Self { port, state, read_listener: Mutex::new(None) }
    }

    /// True iff a chunk is immediately available; otherwise read interest is
    /// registered and a read callback is delivered once content arrives.
    pub fn need_content(&self) -> bool {
        if self.port.need_content() {
            true
        } else {
            self.state.on_read_unready();
            false
        }
    }

    /// Pulls the next chunk without blocking.
    pub fn produce_content(&self) -> Option<Chunk> {
        self.state.begin_produce();
        let chunk = self.port.produce_content();
        self.state.end_produce(chunk.as_ref());
        chunk
    }

    /// Content arrived at the port. Returns true if the channel must be
    /// rescheduled.
    pub fn on_content_producible(&self) -> bool {
        self.state.on_content_producible()
    }

    /// End-of-input. Returns true if the channel must be rescheduled.
    pub fn eof(&self) -> bool {
        self.port.eof();
        self.state.on_content_producible()
    }

    /// Terminal input failure. Returns true if the channel must be
    /// rescheduled.
    pub fn failed(&self, failure: Arc<ChannelError>) -> bool {
        debug!(cause = %failure, "input failed");
        self.port.fail(failure);
        self.state.on_content_producible()
    }

    /// Fails everything buffered. Returns true if EOF had already been seen.
    pub fn fail_all_content(&self, failure: &Arc<ChannelError>) -> bool {
        self.port.fail_all_content(failure)
    }

    /// Best-effort drain during completion: true iff the remaining input is
    /// consumed down to EOF without blocking and without error.
    pub fn consume_all(&self) -> bool {
        loop {
            match self.port.produce_content() {
                Some(Chunk::Data(_)) => continue,
                Some(Chunk::Eof) => return true,
                Some(Chunk::Error(_)) => return false,
                None => {
                    if !self.port.need_content() {
                        return false;
                    }
                }
            }
        }
    }

    pub(crate) fn set_read_listener(&self, listener: Arc<dyn Fn(&Channel) + Send + Sync>) {
        *lock(&self.read_listener) = Some(listener);
    }

    pub(crate) fn run_read_listener(&self, channel: &Channel) {
        let listener = lock(&self.read_listener).clone();
        if let Some(listener) = listener {
            listener(channel);
        }
    }

    pub(crate) fn recycle(&self) {
        *lock(&self.read_listener) = None;
    }
}

struct QueueInner {
    chunks: VecDeque<Bytes>,
    special: Option<Chunk>,
    demand: bool,
}

/// Buffering [`InputPort`]: the parser pushes, the pump pulls.
///
/// Chunks are delivered in arrival order; a terminal chunk is never
/// reordered before data that arrived earlier, except through
/// `fail_all_content` which drains the buffer by contract.
pub struct ChunkQueue {
    inner: Mutex<QueueInner>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self { inner: Mutex::new(QueueInner { chunks: VecDeque::new(), special: None, demand: false }) }
    }

    /// Buffers a data chunk. Returns true if a consumer was waiting for it,
    /// in which case the embedder calls `Channel::on_content_producible`.
    pub fn push(&self, data: Bytes) -> bool {
        let mut q = lock(&self.inner);
        if q.special.is_some() {
            warn!(len = data.len(), "content after end of input dropped");
            return false;
        }
        q.chunks.push_back(data);
        std::mem::take(&mut q.demand)
    }

    /// True while a consumer is waiting for content that is not there yet.
    pub fn has_demand(&self) -> bool {
        lock(&self.inner).demand
    }

    /// Resets the queue for the next exchange on a persistent connection.
    pub fn recycle(&self) {
        let mut q = lock(&self.inner);
        q.chunks.clear();
        q.special = None;
        q.demand = false;
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputPort for ChunkQueue {
    fn need_content(&self) -> bool {
        let mut q = lock(&self.inner);
        if !q.chunks.is_empty() || q.special.is_some() {
            true
        } else {
            q.demand = true;
            false
        }
    }

    fn produce_content(&self) -> Option<Chunk> {
        let mut q = lock(&self.inner);
        if let Some(data) = q.chunks.pop_front() {
            return Some(Chunk::Data(data));
        }
        q.special.clone()
    }

    fn fail_all_content(&self, failure: &Arc<ChannelError>) -> bool {
        let mut q = lock(&self.inner);
        q.chunks.clear();
        match &q.special {
            Some(Chunk::Eof) => true,
            Some(_) => false,
            None => {
                q.special = Some(Chunk::Error(failure.clone()));
                false
            }
        }
    }

    fn fail(&self, failure: Arc<ChannelError>) {
        let mut q = lock(&self.inner);
        if q.special.is_none() {
            q.special = Some(Chunk::Error(failure));
        }
        q.demand = false;
    }

    fn eof(&self) {
        let mut q = lock(&self.inner);
        if q.special.is_none() {
            q.special = Some(Chunk::Eof);
        }
        q.demand = false;
    }
}
