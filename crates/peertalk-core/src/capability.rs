//! Capability negotiation.
//!
//! After a session reaches CONNECTED both sides send a
//! [`CapabilityMessage`]. The limits used for a peer are the intersection of
//! what each side advertised; until a message arrives the conservative legacy
//! defaults apply.

use crate::codec::capability::{
    CapabilityFlags, CapabilityMessage, LEGACY_CHUNK, LEGACY_MAX_MESSAGE, LEGACY_PRESSURE,
    MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE,
};

/// Limits in force for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Largest message either side accepts
    pub max_message_size: u16,
    /// Chunk size for streamed transfers
    pub chunk_size: u16,
    /// Features both sides support
    pub flags: CapabilityFlags,
    /// Last buffer pressure the peer reported
    pub remote_pressure: u8,
    /// Whether a capability message has been received
    pub negotiated: bool,
}

impl Negotiated {
    /// Limits assumed for a peer that has not negotiated
    pub const LEGACY: Self = Self {
        max_message_size: LEGACY_MAX_MESSAGE,
        chunk_size: LEGACY_CHUNK,
        flags: CapabilityFlags::from_bits(0),
        remote_pressure: LEGACY_PRESSURE,
        negotiated: false,
    };

    /// Intersect local and remote capabilities.
    ///
    /// The effective max is `min(local, remote)` clamped to the negotiable
    /// range; the chunk is the smaller preferred chunk, never above the max.
    #[must_use]
    pub fn between(local: &CapabilityMessage, remote: &CapabilityMessage) -> Self {
        let max_message_size = local
            .max_message_size
            .min(remote.max_message_size)
            .clamp(MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE);
        let chunk_size = local
            .preferred_chunk
            .min(remote.preferred_chunk)
            .clamp(1, max_message_size);

        Self {
            max_message_size,
            chunk_size,
            flags: CapabilityFlags::from_bits(local.flags.bits() & remote.flags.bits()),
            remote_pressure: remote.buffer_pressure,
            negotiated: true,
        }
    }

    /// Effective max as a byte count
    #[must_use]
    pub fn max_message(&self) -> usize {
        usize::from(self.max_message_size)
    }
}

impl Default for Negotiated {
    fn default() -> Self {
        Self::LEGACY
    }
}
