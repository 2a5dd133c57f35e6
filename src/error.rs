//! Failure taxonomy for exchange processing.
//!
//! Every failure that flows through a channel is classified into one of the
//! variants below. The classification decides how the driver logs the failure
//! and how it recovers: quiet failures are only visible at debug level,
//! no-stack failures (malformed requests, transport errors, timeouts) are
//! logged without a cause chain, and anything escaping the application
//! handler is logged in full.

use std::io;

use http::StatusCode;
use thiserror::Error;

/// The top-level error type for channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Malformed request reported by the parser.
    ///
    /// `status` is clamped into `400..=599` before a response is generated.
    #[error("bad message: {status} {reason}")]
    BadMessage { status: u16, reason: String },

    /// Internal signal suppressed from normal logging.
    #[error("{reason}")]
    Quiet { reason: String },

    /// Transport level I/O failure.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Idle or async-context timeout.
    #[error("timeout: {reason}")]
    Timeout { reason: String },

    /// An operation was attempted in a state that forbids it.
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    /// Anything escaping the application handler.
    #[error("application error: {reason}")]
    Application { reason: String },
}

impl ChannelError {
    /// Creates a new BadMessage error
    pub fn bad_message<S: ToString>(status: u16, reason: S) -> Self {
        Self::BadMessage { status, reason: reason.to_string() }
    }

    /// Creates a new Quiet error
    pub fn quiet<S: ToString>(reason: S) -> Self {
        Self::Quiet { reason: reason.to_string() }
    }

    /// Creates a new Timeout error
    pub fn timeout<S: ToString>(reason: S) -> Self {
        Self::Timeout { reason: reason.to_string() }
    }

    /// Creates a new IllegalState error
    pub fn illegal_state<S: ToString>(reason: S) -> Self {
        Self::IllegalState { reason: reason.to_string() }
    }

    /// Creates a new Application error
    pub fn application<S: ToString>(reason: S) -> Self {
        Self::Application { reason: reason.to_string() }
    }

    /// True for failures that are suppressed from normal logging.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::Quiet { .. })
    }

    /// True for failures logged without a cause chain at the default level.
    pub fn is_no_stack(&self) -> bool {
        matches!(self, Self::BadMessage { .. } | Self::Io { .. } | Self::Timeout { .. })
    }

    /// The response status this failure maps to when it reaches the error
    /// pipeline before the response is committed.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadMessage { status, .. } => StatusCode::from_u16(clamp_error_status(*status))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Clamps a bad-message status into the error range `400..=599`.
pub fn clamp_error_status(status: u16) -> u16 {
    if (400..=599).contains(&status) {
        status
    } else {
        400
    }
}
