//! Reliable message frames (`PTMG`).
//!
//! ```text
//!  0       4   5   6   7   8       10            10+n    12+n
//! +-------+---+---+---+---+-------+-------------+-------+
//! | PTMG  |ver|typ|flg|seq|  len  | payload[n]  | CRC16 |
//! +-------+---+---+---+---+-------+-------------+-------+
//! ```
//!
//! The header decoder validates the fixed 10 bytes only. On a stream
//! transport the payload may not have arrived yet, so the CRC over
//! header+payload is checked once the whole frame is buffered, either by the
//! caller or by [`Message::parse`].

use super::crc::{checksum16, checksum16_update};
use super::{CHECKSUM_SIZE, MAGIC_MESSAGE, check_magic, ensure_len, ensure_room, read_u16, write_u16};
use crate::PROTOCOL_VERSION;
use crate::error::CodecError;

/// Fixed reliable frame header size
pub const MESSAGE_HEADER_SIZE: usize = 10;

/// Largest payload the 16-bit length field can carry
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Reliable channel message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application data
    Data = 0x01,
    /// Keepalive / RTT probe
    Ping = 0x02,
    /// Response to PING
    Pong = 0x03,
    /// Graceful session close
    Disconnect = 0x04,
    /// Acknowledgment
    Ack = 0x05,
    /// Connection or message rejected
    Reject = 0x06,
    /// Capability TLV exchange
    Capability = 0x07,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Pong),
            0x04 => Ok(Self::Disconnect),
            0x05 => Ok(Self::Ack),
            0x06 => Ok(Self::Reject),
            0x07 => Ok(Self::Capability),
            _ => Err(CodecError::InvalidType(value)),
        }
    }
}

/// Message flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// Sent over the unreliable channel
    pub const UNRELIABLE: u8 = 0b0000_0001;
    /// Payload may be replaced by a newer one with the same key
    pub const COALESCABLE: u8 = 0b0000_0010;
    /// Bypass transport send coalescing
    pub const NO_DELAY: u8 = 0b0000_0100;
    /// Payload is a batch of length-prefixed messages
    pub const BATCH: u8 = 0b0000_1000;
    /// Payload starts with a fragment header
    pub const FRAGMENT: u8 = 0b0001_0000;

    /// Create new empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from raw bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Add BATCH flag
    #[must_use]
    pub fn with_batch(mut self) -> Self {
        self.0 |= Self::BATCH;
        self
    }

    /// Add FRAGMENT flag
    #[must_use]
    pub fn with_fragment(mut self) -> Self {
        self.0 |= Self::FRAGMENT;
        self
    }

    /// Check if BATCH is set
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.0 & Self::BATCH != 0
    }

    /// Check if FRAGMENT is set
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.0 & Self::FRAGMENT != 0
    }

    /// Get raw byte value
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Decoded reliable frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub message_type: MessageType,
    /// Message flags
    pub flags: MessageFlags,
    /// Per-peer wrapping sequence number
    pub sequence: u8,
    /// Length of the payload that follows the header
    pub payload_len: u16,
}

impl MessageHeader {
    /// Total on-wire size of the frame this header describes
    #[must_use]
    pub fn frame_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + usize::from(self.payload_len) + CHECKSUM_SIZE
    }

    /// Encode the 10-byte header into `buf`.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::BufferTooSmall` if `buf` is shorter than the header.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        ensure_room(buf, MESSAGE_HEADER_SIZE)?;
        buf[0..4].copy_from_slice(&MAGIC_MESSAGE.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.message_type as u8;
        buf[6] = self.flags.as_u8();
        buf[7] = self.sequence;
        write_u16(buf, 8, self.payload_len);
        Ok(MESSAGE_HEADER_SIZE)
    }

    /// Decode and validate a frame header.
    ///
    /// Ladder: truncation, magic, version, type range. The CRC is not checked
    /// here.
    ///
    /// # Errors
    ///
    /// Returns the first `CodecError` encountered.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, MESSAGE_HEADER_SIZE)?;
        check_magic(buf, MAGIC_MESSAGE)?;
        if buf[4] != PROTOCOL_VERSION {
            return Err(CodecError::BadVersion(buf[4]));
        }
        let message_type = MessageType::try_from(buf[5])?;

        Ok(Self {
            message_type,
            flags: MessageFlags::from_bits(buf[6]),
            sequence: buf[7],
            payload_len: read_u16(buf, 8),
        })
    }
}

/// Zero-copy view of a complete, checksum-verified reliable frame
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    header: MessageHeader,
    payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// Parse a complete frame from the start of `data`.
    ///
    /// Trailing bytes beyond the frame are ignored; use
    /// [`frame_len`](Self::frame_len) to advance a receive buffer.
    ///
    /// # Errors
    ///
    /// Header errors as for [`MessageHeader::decode`], then
    /// `CodecError::Truncated` if the payload or trailer is incomplete and
    /// `CodecError::ChecksumMismatch` if the CRC fails.
    pub fn parse(data: &'a [u8]) -> Result<Self, CodecError> {
        let header = MessageHeader::decode(data)?;
        let frame_len = header.frame_len();
        ensure_len(data, frame_len)?;

        let body = frame_len - CHECKSUM_SIZE;
        let expected = read_u16(data, body);
        let computed = checksum16(&data[..body]);
        if expected != computed {
            return Err(CodecError::ChecksumMismatch { expected, computed });
        }

        Ok(Self {
            header,
            payload: &data[MESSAGE_HEADER_SIZE..body],
        })
    }

    /// The decoded header
    #[must_use]
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Get the message type
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Get the flags
    #[must_use]
    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    /// Get the sequence number
    #[must_use]
    pub fn sequence(&self) -> u8 {
        self.header.sequence
    }

    /// Get the payload slice (zero-copy)
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Bytes this frame occupied in the input
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.header.frame_len()
    }
}

/// Builder for constructing reliable frames
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder<'a> {
    message_type: Option<MessageType>,
    flags: MessageFlags,
    sequence: u8,
    payload: &'a [u8],
}

impl<'a> MessageBuilder<'a> {
    /// Create a new message builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message type
    #[must_use]
    pub fn message_type(mut self, mt: MessageType) -> Self {
        self.message_type = Some(mt);
        self
    }

    /// Set the flags
    #[must_use]
    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the sequence number
    #[must_use]
    pub fn sequence(mut self, seq: u8) -> Self {
        self.sequence = seq;
        self
    }

    /// Set the payload
    #[must_use]
    pub fn payload(mut self, data: &'a [u8]) -> Self {
        self.payload = data;
        self
    }

    /// Build the frame (header, payload, CRC) into a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::PayloadTooLarge` if the payload exceeds 65535 bytes.
    pub fn build(self) -> Result<Vec<u8>, CodecError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;
        let header = MessageHeader {
            message_type: self.message_type.unwrap_or(MessageType::Data),
            flags: self.flags,
            sequence: self.sequence,
            payload_len,
        };

        let mut buf = vec![0u8; header.frame_len()];
        header.encode(&mut buf)?;
        buf[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + self.payload.len()]
            .copy_from_slice(self.payload);

        let crc = checksum16_update(
            checksum16(&buf[..MESSAGE_HEADER_SIZE]),
            self.payload,
        );
        let body = MESSAGE_HEADER_SIZE + self.payload.len();
        write_u16(&mut buf, body, crc);

        Ok(buf)
    }
}
