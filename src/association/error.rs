//! Association error types.

use std::io;

use thiserror::Error;

use super::AssociationState;
use crate::timer::RtxTimerId;

/// Errors surfaced by [`Association`](super::Association) and
/// [`Stream`](crate::stream::Stream) operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssociationError {
    /// The stream is closing or closed, or the association is shutting down.
    #[error("stream closed")]
    StreamClosed,

    /// `open_stream` on an identifier already in use.
    #[error("stream {0} already exists")]
    StreamAlreadyExists(u16),

    /// Message larger than the configured maximum.
    #[error("message of {size} bytes exceeds max message size {max}")]
    MessageTooLarge {
        /// Message size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The read buffer cannot hold the next message; the message is kept.
    #[error("short buffer: message needs {needed} bytes, buffer holds {available}")]
    ShortBuffer {
        /// Message size.
        needed: usize,
        /// Buffer size.
        available: usize,
    },

    /// Operation not allowed in the current association state.
    #[error("operation not allowed in state {0}")]
    InvalidState(AssociationState),

    /// The handshake could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A retransmission timer exhausted its retries.
    #[error("{0} retransmission limit reached")]
    RetransmissionFailure(RtxTimerId),

    /// The peer aborted the association.
    #[error("aborted by peer: {0}")]
    Aborted(String),

    /// The peer broke the protocol; the association was aborted.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport failure underneath the association.
    #[error("i/o error: {0}")]
    Io(String),

    /// The association is closed.
    #[error("association closed")]
    Closed,

    /// The configuration was rejected before the association started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AssociationError {
    /// Whether the error ends the association. Non-fatal errors only reject
    /// the operation that produced them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_)
                | Self::RetransmissionFailure(_)
                | Self::Aborted(_)
                | Self::ProtocolViolation(_)
                | Self::Io(_)
                | Self::Closed
        )
    }
}

impl From<io::Error> for AssociationError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
