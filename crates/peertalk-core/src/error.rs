//! Error types for the PeerTalk session engine.
//!
//! Every fallible operation in the engine returns one of the sub-errors below,
//! or the umbrella [`Error`] that wraps them. Nothing in the core panics on
//! malformed network input: a corrupt packet is always a recoverable decode
//! failure that the caller logs and drops.
//!
//! # Error Codes
//!
//! [`Error::code`] maps each error onto the stable negative integer codes used
//! by the C-compatible API (`0` is success). Hosts that bridge to legacy
//! applications can surface these unchanged.

use std::borrow::Cow;

use thiserror::Error;

use crate::peer::{PeerId, PeerState};
use crate::queue::Backpressure;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Core engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire codec error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Peer table or state machine error
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// Send queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Fragmentation or reassembly error
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid argument supplied by the caller
    #[error("invalid parameter: {0}")]
    InvalidParam(Cow<'static, str>),

    /// Message exceeds what the peer can accept and cannot be fragmented
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge {
        /// Message length
        len: usize,
        /// Largest sendable length
        max: usize,
    },
}

impl Error {
    /// Stable numeric code for this error (negative; `0` means success).
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::Codec(e) => e.code(),
            Error::Peer(e) => e.code(),
            Error::Queue(e) => e.code(),
            Error::Fragment(FragmentError::TooLarge { .. } | FragmentError::ChunkTooSmall(_)) => {
                -16
            }
            Error::Fragment(_) => -1,
            Error::Config(_) => -1,
            Error::InvalidParam(_) => -1,
            Error::MessageTooLarge { .. } => -16,
        }
    }

    /// Returns true if the operation may succeed if retried later.
    ///
    /// Transient errors are the backpressure family: a full queue, a throttled
    /// send, or an exhausted peer table. Protocol errors are never transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Queue(QueueError::Full { .. } | QueueError::Throttled { .. })
                | Error::Peer(PeerError::NoFreeSlot { .. })
        )
    }

    /// Create an invalid parameter error with static context
    #[must_use]
    pub const fn invalid_param(context: &'static str) -> Self {
        Error::InvalidParam(Cow::Borrowed(context))
    }
}

/// Wire codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer too short to hold the structure
    #[error("truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Expected minimum size
        expected: usize,
        /// Actual size available
        actual: usize,
    },

    /// Magic bytes do not match the format
    #[error("bad magic: expected 0x{expected:08X}, got 0x{actual:08X}")]
    BadMagic {
        /// Magic for the format being decoded
        expected: u32,
        /// Magic found in the buffer
        actual: u32,
    },

    /// Unsupported protocol version
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Packet or message type outside the valid range
    #[error("invalid type: 0x{0:02X}")]
    InvalidType(u8),

    /// Name longer than the wire format allows
    #[error("name too long: {0} bytes (max 31)")]
    NameTooLong(usize),

    /// A field carries a value outside its allowed range
    #[error("invalid field {field}: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u32,
    },

    /// Checksum trailer does not match the computed checksum
    #[error("checksum mismatch: expected 0x{expected:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch {
        /// Checksum carried in the trailer
        expected: u16,
        /// Checksum computed over the data
        computed: u16,
    },

    /// Output buffer cannot hold the encoded structure
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Payload longer than the length field can express
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl CodecError {
    fn code(&self) -> i32 {
        match self {
            CodecError::Truncated { .. } => -22,
            CodecError::BadMagic { .. } => -21,
            CodecError::BadVersion(_) => -23,
            CodecError::ChecksumMismatch { .. } => -20,
            CodecError::BufferTooSmall { .. } => -9,
            CodecError::PayloadTooLarge(_) => -16,
            CodecError::InvalidType(_)
            | CodecError::NameTooLong(_)
            | CodecError::InvalidField { .. } => -1,
        }
    }
}

/// Peer table and state machine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Every peer slot is occupied
    #[error("no free peer slot (capacity {capacity})")]
    NoFreeSlot {
        /// Configured peer capacity
        capacity: usize,
    },

    /// No live peer with this identifier
    #[error("peer {0} not found")]
    NotFound(PeerId),

    /// Handle refers to a slot that has since been recycled
    #[error("stale handle for peer {0}")]
    StaleHandle(PeerId),

    /// Requested transition is not on the allow-list
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: PeerState,
        /// Requested state
        to: PeerState,
    },

    /// Peer is already in the requested state
    #[error("peer already {0}")]
    AlreadyInState(PeerState),

    /// Operation requires a connected peer
    #[error("peer {id} not connected (state {state})")]
    NotConnected {
        /// Peer identifier
        id: PeerId,
        /// Current state
        state: PeerState,
    },
}

impl PeerError {
    fn code(&self) -> i32 {
        match self {
            PeerError::NoFreeSlot { .. } => -26,
            PeerError::NotFound(_) | PeerError::StaleHandle(_) => -11,
            PeerError::InvalidTransition { .. } | PeerError::AlreadyInState(_) => -10,
            PeerError::NotConnected { .. } => -18,
        }
    }
}

/// Send queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue is at capacity
    #[error("queue full ({capacity} slots)")]
    Full {
        /// Queue capacity
        capacity: usize,
    },

    /// Send rejected by backpressure policy
    #[error("send throttled at {level:?} backpressure (pressure {pressure}%)")]
    Throttled {
        /// Level that caused the rejection
        level: Backpressure,
        /// Pressure percentage at the time of rejection
        pressure: u8,
    },

    /// Payload exceeds the slot size
    #[error("payload of {len} bytes exceeds slot size {max}")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Slot size
        max: usize,
    },

    /// Queue capacity must be a non-zero power of two
    #[error("capacity {0} is not a power of two")]
    NotPowerOfTwo(usize),
}

impl QueueError {
    fn code(&self) -> i32 {
        match self {
            QueueError::Full { .. } => -9,
            QueueError::Throttled { .. } => -25,
            QueueError::PayloadTooLarge { .. } => -16,
            QueueError::NotPowerOfTwo(_) => -24,
        }
    }
}

/// Fragmentation and reassembly errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    /// Non-FIRST fragment arrived with nothing being reassembled
    #[error("fragment without active reassembly (message {0})")]
    NoActiveReassembly(u16),

    /// Fragment belongs to a different message than the one in flight
    #[error("fragment for message {actual} while reassembling {expected}")]
    MessageIdMismatch {
        /// Message being reassembled
        expected: u16,
        /// Message id carried by the fragment
        actual: u16,
    },

    /// Fragment data lies outside the declared total length
    #[error("fragment out of bounds: offset {offset} + {len} > total {total}")]
    OutOfBounds {
        /// Fragment offset
        offset: usize,
        /// Fragment data length
        len: usize,
        /// Declared total length
        total: usize,
    },

    /// LAST fragment arrived before every byte was received
    #[error("incomplete message: {received} of {total} bytes")]
    Incomplete {
        /// Bytes received
        received: usize,
        /// Declared total length
        total: usize,
    },

    /// FIRST fragment declared an empty message
    #[error("fragmented message declares zero length")]
    ZeroLength,

    /// Declared total exceeds the largest message this side reassembles
    #[error("fragmented message of {total} bytes exceeds limit {max}")]
    TooLarge {
        /// Declared total length
        total: usize,
        /// Reassembly limit
        max: usize,
    },

    /// Effective message size leaves too little room for fragment data
    #[error("max message {0} too small for fragmentation")]
    ChunkTooSmall(usize),
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub Cow<'static, str>);

impl ConfigError {
    /// Create a configuration error with static context
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        ConfigError(Cow::Borrowed(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let truncated: Error = CodecError::Truncated {
            expected: 14,
            actual: 3,
        }
        .into();
        assert_eq!(truncated.code(), -22);

        let crc: Error = CodecError::ChecksumMismatch {
            expected: 1,
            computed: 2,
        }
        .into();
        assert_eq!(crc.code(), -20);

        let full: Error = QueueError::Full { capacity: 32 }.into();
        assert_eq!(full.code(), -9);

        let gone: Error = PeerError::NotFound(PeerId::new(3)).into();
        assert_eq!(gone.code(), -11);
    }

    #[test]
    fn test_transient_classification() {
        let full: Error = QueueError::Full { capacity: 8 }.into();
        assert!(full.is_transient());

        let throttled: Error = QueueError::Throttled {
            level: Backpressure::Heavy,
            pressure: 80,
        }
        .into();
        assert!(throttled.is_transient());

        let magic: Error = CodecError::BadMagic {
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(!magic.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = PeerError::InvalidTransition {
            from: PeerState::Unused,
            to: PeerState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition: UNUSED -> CONNECTED"
        );
    }
}
