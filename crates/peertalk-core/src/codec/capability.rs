//! Capability message TLV encoding.
//!
//! The payload of a [`MessageType::Capability`](super::message::MessageType)
//! frame is a sequence of `tag:u8, len:u8, value[len]` entries:
//!
//! | Tag  | Field            | Value |
//! |------|------------------|-------|
//! | 0x01 | max message size | u16   |
//! | 0x02 | preferred chunk  | u16   |
//! | 0x03 | buffer pressure  | u8    |
//! | 0x04 | capability flags | u16   |
//!
//! Unknown tags are skipped so newer peers can add fields. Tags missing from
//! a message keep the conservative legacy defaults.

use super::ensure_len;
use crate::error::CodecError;

/// Smallest negotiable message size
pub const MIN_MESSAGE_SIZE: u16 = 256;

/// Largest negotiable message size
pub const MAX_MESSAGE_SIZE: u16 = 8192;

/// Max message size assumed for peers that never negotiate
pub const LEGACY_MAX_MESSAGE: u16 = 512;

/// Chunk size assumed for peers that never negotiate
pub const LEGACY_CHUNK: u16 = 256;

/// Buffer pressure assumed for peers that never negotiate
pub const LEGACY_PRESSURE: u8 = 50;

const TAG_MAX_MESSAGE: u8 = 0x01;
const TAG_PREFERRED_CHUNK: u8 = 0x02;
const TAG_BUFFER_PRESSURE: u8 = 0x03;
const TAG_FLAGS: u8 = 0x04;

const TLV_HEADER: usize = 2;

/// Encoded size of a message carrying all four tags
pub const CAPABILITY_MESSAGE_SIZE: usize = 4 * TLV_HEADER + 2 + 2 + 1 + 2;

/// Capability flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilityFlags(u16);

impl CapabilityFlags {
    /// Peer reassembles fragmented messages
    pub const FRAGMENTATION: u16 = 0x0001;
    /// Peer supports the chunked streaming API
    pub const STREAMING: u16 = 0x0002;

    /// Create flags from raw bits
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Add FRAGMENTATION flag
    #[must_use]
    pub fn with_fragmentation(mut self) -> Self {
        self.0 |= Self::FRAGMENTATION;
        self
    }

    /// Add STREAMING flag
    #[must_use]
    pub fn with_streaming(mut self) -> Self {
        self.0 |= Self::STREAMING;
        self
    }

    /// Check if FRAGMENTATION is set
    #[must_use]
    pub fn supports_fragmentation(&self) -> bool {
        self.0 & Self::FRAGMENTATION != 0
    }

    /// Check if STREAMING is set
    #[must_use]
    pub fn supports_streaming(&self) -> bool {
        self.0 & Self::STREAMING != 0
    }

    /// Get raw value
    #[must_use]
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Values advertised in one capability message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityMessage {
    /// Largest message the sender accepts
    pub max_message_size: u16,
    /// Chunk size the sender prefers for streaming
    pub preferred_chunk: u16,
    /// Sender's receive-side buffer pressure, 0-100
    pub buffer_pressure: u8,
    /// Sender's feature flags
    pub flags: CapabilityFlags,
}

impl Default for CapabilityMessage {
    fn default() -> Self {
        Self {
            max_message_size: LEGACY_MAX_MESSAGE,
            preferred_chunk: LEGACY_CHUNK,
            buffer_pressure: LEGACY_PRESSURE,
            flags: CapabilityFlags::default(),
        }
    }
}

impl CapabilityMessage {
    /// Encode all four tags.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidField` if a value is out of range, so a
    /// peer never advertises something it would itself reject.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;

        let mut buf = Vec::with_capacity(CAPABILITY_MESSAGE_SIZE);
        buf.extend_from_slice(&[TAG_MAX_MESSAGE, 2]);
        buf.extend_from_slice(&self.max_message_size.to_be_bytes());
        buf.extend_from_slice(&[TAG_PREFERRED_CHUNK, 2]);
        buf.extend_from_slice(&self.preferred_chunk.to_be_bytes());
        buf.extend_from_slice(&[TAG_BUFFER_PRESSURE, 1, self.buffer_pressure]);
        buf.extend_from_slice(&[TAG_FLAGS, 2]);
        buf.extend_from_slice(&self.flags.bits().to_be_bytes());
        Ok(buf)
    }

    /// Decode a TLV payload.
    ///
    /// # Errors
    ///
    /// `CodecError::Truncated` when an entry runs past the buffer;
    /// `CodecError::InvalidField` when a known tag has the wrong length or an
    /// out-of-range value.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut caps = Self::default();
        let mut pos = 0;

        while pos < buf.len() {
            ensure_len(buf, pos + TLV_HEADER)?;
            let tag = buf[pos];
            let len = usize::from(buf[pos + 1]);
            let start = pos + TLV_HEADER;
            ensure_len(buf, start + len)?;
            let value = &buf[start..start + len];

            match tag {
                TAG_MAX_MESSAGE => caps.max_message_size = expect_u16(tag, value)?,
                TAG_PREFERRED_CHUNK => caps.preferred_chunk = expect_u16(tag, value)?,
                TAG_BUFFER_PRESSURE => {
                    if value.len() != 1 {
                        return Err(bad_length(tag, value.len()));
                    }
                    caps.buffer_pressure = value[0];
                }
                TAG_FLAGS => caps.flags = CapabilityFlags::from_bits(expect_u16(tag, value)?),
                _ => {
                    tracing::trace!("Skipping unknown capability tag 0x{:02X}", tag);
                }
            }
            pos = start + len;
        }

        caps.validate()?;
        Ok(caps)
    }

    fn validate(&self) -> Result<(), CodecError> {
        if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&self.max_message_size) {
            return Err(CodecError::InvalidField {
                field: "max_message_size",
                value: u32::from(self.max_message_size),
            });
        }
        if self.preferred_chunk == 0 {
            return Err(CodecError::InvalidField {
                field: "preferred_chunk",
                value: 0,
            });
        }
        if self.buffer_pressure > 100 {
            return Err(CodecError::InvalidField {
                field: "buffer_pressure",
                value: u32::from(self.buffer_pressure),
            });
        }
        Ok(())
    }
}

fn expect_u16(tag: u8, value: &[u8]) -> Result<u16, CodecError> {
    match value {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(bad_length(tag, value.len())),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn bad_length(tag: u8, len: usize) -> CodecError {
    CodecError::InvalidField {
        field: "tlv_length",
        value: (u32::from(tag) << 8) | (len as u32 & 0xFF),
    }
}
