//! The error type of channel and session operations.
use thiserror::Error;

use crate::{codec::CodecError, header::PartyId, mailbox::MailboxError, namespace::SessionId};

/// Errors of [`crate::rpc::Rpc`] and [`crate::session::Session`] operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The other party sent invalid data, the current protocol run was aborted.
    ///
    /// The channel and all other sessions remain usable.
    #[error("protocol aborted: {0}")]
    Abort(AbortReason),
    /// Waiting for a packet failed.
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    /// A packet could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The transport failed to open a connection or to move a frame.
    #[error("transport error while {phase}: {reason}")]
    Transport {
        /// What the channel was doing when the error occurred.
        phase: String,
        /// The error raised by the transport.
        reason: String,
    },
    /// No further sub-session can be derived below `parent`.
    #[error("cannot derive sub-session {ordinal} below {parent}")]
    NamespaceExhausted {
        /// The session that tried to compose another sub-protocol.
        parent: SessionId,
        /// The ordinal that could not be allocated.
        ordinal: u32,
    },
    /// A value could not be serialized into a payload block.
    #[error("could not serialize value: {0}")]
    Serialize(String),
    /// A task of the worker pool failed.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl Error {
    /// Whether this error aborted a protocol run because of the other party.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort(_))
    }

    pub(crate) fn transport(phase: impl Into<String>, reason: impl std::fmt::Debug) -> Self {
        Error::Transport {
            phase: phase.into(),
            reason: format!("{reason:?}"),
        }
    }
}

/// Why a peer's data was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// The packet did not contain the expected number of payload blocks.
    #[error("expected {expected} payload blocks from {from}, got {actual}")]
    BlockCount {
        /// The party that sent the packet.
        from: PartyId,
        /// The expected number of blocks.
        expected: usize,
        /// The number of blocks that was received.
        actual: usize,
    },
    /// A value was outside of its valid range.
    #[error("value out of range: {0}")]
    OutOfRange(String),
    /// The size of some received data did not match.
    #[error("size mismatch, expected {expected} but got {actual}")]
    SizeMismatch {
        /// The expected size.
        expected: usize,
        /// The received size.
        actual: usize,
    },
    /// A payload block could not be decoded.
    #[error("malformed payload from {from}: {detail}")]
    Malformed {
        /// The party that sent the packet.
        from: PartyId,
        /// Description of the decoding failure.
        detail: String,
    },
}
