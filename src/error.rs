use std::time::Duration;

use thiserror::Error;

use crate::Core::substrate::{Channel, Rank};
use crate::Deep::MessageState;

pub type SubstrateResult<T> = Result<T, SubstrateError>;
pub type DeepResult<T> = Result<T, DeepCopyError>;

/// Failures reported by a messaging substrate for a single transfer.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("peer {0} is not attached to the fabric")]
    UnknownPeer(Rank),

    #[error("length mismatch on channel {channel}: expected {expected} bytes, got {actual}")]
    Truncated {
        channel: Channel,
        expected: usize,
        actual: usize,
    },

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("packed buffer overrun: {needed} bytes at offset {offset}, capacity {capacity}")]
    Overrun {
        offset: usize,
        needed: usize,
        capacity: usize,
    },

    #[error("unsupported substrate operation: {0}")]
    Unsupported(&'static str),

    #[error("substrate i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SubstrateError {
    pub fn other(msg: impl Into<String>) -> Self {
        SubstrateError::Other(msg.into())
    }
}

/// Errors surfaced by deep-copy messages.
///
/// `ordinal` is the position of the failing descriptor in replay order.
/// Every variant leaves the message in a destroy-only state.
#[derive(Debug, Error)]
pub enum DeepCopyError {
    #[error("transport error at descriptor #{ordinal}: {source}")]
    Transport {
        ordinal: usize,
        #[source]
        source: SubstrateError,
    },

    #[error("manifest mismatch at descriptor #{ordinal}: {reason}")]
    ManifestMismatch { ordinal: usize, reason: String },

    #[error("allocation of {size} bytes (align {align}) failed at descriptor #{ordinal}")]
    AllocationFailure {
        ordinal: usize,
        size: usize,
        align: usize,
    },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("message is {0:?} and cannot perform this operation")]
    InvalidState(MessageState),
}

impl DeepCopyError {
    pub fn mismatch(ordinal: usize, reason: impl Into<String>) -> Self {
        DeepCopyError::ManifestMismatch {
            ordinal,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        DeepCopyError::InvalidDescriptor(reason.into())
    }

    /// Map a substrate failure at `ordinal`. Length disagreements, including
    /// reads past the end of a packed buffer, are a manifest mismatch between
    /// the peers, not a transport fault.
    pub fn from_substrate(ordinal: usize, source: SubstrateError) -> Self {
        match source {
            SubstrateError::Truncated {
                expected, actual, ..
            } => DeepCopyError::mismatch(
                ordinal,
                format!("receiver expected {expected} bytes, peer sent {actual}"),
            ),
            SubstrateError::Overrun {
                offset,
                needed,
                capacity,
            } => DeepCopyError::mismatch(
                ordinal,
                format!("{needed} bytes at offset {offset} overrun a {capacity}-byte packed buffer"),
            ),
            source => DeepCopyError::Transport { ordinal, source },
        }
    }
}
