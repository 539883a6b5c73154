//! Fragment header.
//!
//! Prepended to each fragment's data inside a DATA frame carrying
//! [`MessageFlags::FRAGMENT`](super::message::MessageFlags::FRAGMENT).
//!
//! ```text
//!  0       2       4       6   7   8
//! +-------+-------+-------+---+---+
//! | msgid | total | offset|flg|rsv|
//! +-------+-------+-------+---+---+
//! ```

use super::{ensure_len, ensure_room, read_u16, write_u16};
use crate::error::CodecError;

/// Fragment header size
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Fragment position flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FragmentFlags(u8);

impl FragmentFlags {
    /// First fragment of a message
    pub const FIRST: u8 = 0x01;
    /// Last fragment of a message
    pub const LAST: u8 = 0x02;

    const KNOWN: u8 = Self::FIRST | Self::LAST;

    /// Create flags from raw bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Add FIRST flag
    #[must_use]
    pub fn with_first(mut self) -> Self {
        self.0 |= Self::FIRST;
        self
    }

    /// Add LAST flag
    #[must_use]
    pub fn with_last(mut self) -> Self {
        self.0 |= Self::LAST;
        self
    }

    /// Check if FIRST is set
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.0 & Self::FIRST != 0
    }

    /// Check if LAST is set
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.0 & Self::LAST != 0
    }

    /// Get raw byte value
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Decoded fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Identifier shared by every fragment of one message
    pub message_id: u16,
    /// Length of the original, unfragmented message
    pub total_length: u16,
    /// Byte offset of this fragment's data in the original message
    pub offset: u16,
    /// FIRST / LAST markers
    pub flags: FragmentFlags,
}

impl FragmentHeader {
    /// Encode into `buf`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::BufferTooSmall` if `buf` is shorter than 8 bytes.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        ensure_room(buf, FRAGMENT_HEADER_SIZE)?;
        write_u16(buf, 0, self.message_id);
        write_u16(buf, 2, self.total_length);
        write_u16(buf, 4, self.offset);
        buf[6] = self.flags.as_u8();
        buf[7] = 0;
        Ok(FRAGMENT_HEADER_SIZE)
    }

    /// Encode into a fixed array
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        // cannot fail: exact-size buffer
        let _ = self.encode(&mut buf);
        buf
    }

    /// Decode a fragment header.
    ///
    /// # Errors
    ///
    /// `CodecError::Truncated` for short input; `CodecError::InvalidField`
    /// when unknown flag bits are set, the declared total is zero, or the
    /// offset lies beyond the total.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, FRAGMENT_HEADER_SIZE)?;

        let message_id = read_u16(buf, 0);
        let total_length = read_u16(buf, 2);
        let offset = read_u16(buf, 4);
        let flags = buf[6];

        if flags & !FragmentFlags::KNOWN != 0 {
            return Err(CodecError::InvalidField {
                field: "fragment_flags",
                value: u32::from(flags),
            });
        }
        if total_length == 0 {
            return Err(CodecError::InvalidField {
                field: "total_length",
                value: 0,
            });
        }
        if offset >= total_length {
            return Err(CodecError::InvalidField {
                field: "offset",
                value: u32::from(offset),
            });
        }

        Ok(Self {
            message_id,
            total_length,
            offset,
            flags: FragmentFlags::from_bits(flags),
        })
    }

    /// Split a fragment payload into its header and data.
    ///
    /// # Errors
    ///
    /// As for [`decode`](Self::decode).
    pub fn split(payload: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let header = Self::decode(payload)?;
        Ok((header, &payload[FRAGMENT_HEADER_SIZE..]))
    }
}
