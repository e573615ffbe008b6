use std::io;

use thiserror::Error;

use crate::topology::Rank;

pub type Result<T, E = MergeError> = std::result::Result<T, E>;

/// Errors raised while parsing a wire frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid message type: {0}")]
    InvalidType(u8),

    #[error("invalid flags: {0:#06x}")]
    InvalidFlags(u16),

    #[error("CRC32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("payload of {len} bytes does not match counts in header")]
    PayloadMismatch { len: usize },

    #[error("item marks do not match the chunk")]
    InvalidMarks,

    #[error("length {len} does not fit a frame field")]
    TooLarge { len: usize },

    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("compression failed: {0}")]
    Compression(String),
}

/// Failures of the point-to-point layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {peer} disconnected")]
    Disconnected { peer: Rank },

    #[error("process {rank} is the root and has no parent")]
    NoParent { rank: Rank },

    #[error("process {rank} has no child at index {index}")]
    NoSuchChild { rank: Rank, index: usize },
}

/// Errors surfaced by a [`Session`](crate::session::Session)
#[derive(Error, Debug)]
pub enum MergeError {
    /// Local state or the output stream could not be set up somewhere in the group
    #[error("allocation failure: the output stream could not be opened on every process")]
    AllocFailure,

    /// A single item does not fit in an empty buffer; the session stays usable
    #[error("item of {size} units exceeds buffer capacity {capacity}")]
    ItemTooLarge { size: usize, capacity: usize },

    /// A finished signal arrived while data was still pending
    #[error("unexpected termination on rank {rank}: {reason}")]
    UnexpectedTermination { rank: Rank, reason: String },

    /// A frame of the wrong type arrived at a protocol step
    #[error("unexpected {got} message on rank {rank} while {expected}")]
    UnexpectedMessage {
        rank: Rank,
        got: &'static str,
        expected: &'static str,
    },

    #[error("operation needs a {expected:?} session")]
    VariantMismatch { expected: crate::kind::Variant },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A previous fatal error left the session unusable
    #[error("session is unusable after a previous fatal error")]
    Poisoned,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MergeError {
    /// Whether the session must be abandoned after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MergeError::ItemTooLarge { .. } | MergeError::VariantMismatch { .. }
        )
    }
}
