//! The request/response processing core of an embedded HTTP server.
//!
//! A [`Channel`] sits between a byte-oriented parser/transport and an
//! application handler, driving one HTTP exchange at a time: dispatch,
//! async suspension and resumption, error handling, response commit and
//! completion. Parsers, wire encoders and sockets stay outside, behind the
//! `transport` and `channel::input` seams.

pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod scheduling;
pub mod transport;

pub use channel::state::Action;
pub use channel::Channel;
pub use error::ChannelError;
pub use exchange::Chunk;

pub(crate) use help::lock;

mod help {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Locks a mutex, tolerating poison: a panicked listener must not take
    /// the whole exchange down with it.
    pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
