//! Wire codec for the PeerTalk protocol.
//!
//! Pure, bounds-checked translation between typed records and byte buffers.
//! The codec has no knowledge of peers or sessions: decoders either return a
//! fully validated record or an error, and never touch engine state.
//!
//! All multi-byte integers are big-endian (network byte order).
//!
//! | Format              | Magic  | Header        | Trailer                 |
//! |---------------------|--------|---------------|-------------------------|
//! | Discovery           | `PTLK` | 12 + name     | CRC-16                  |
//! | Reliable frame      | `PTMG` | 10            | CRC-16 (header+payload) |
//! | Unreliable datagram | `PTUD` | 8             | none                    |
//! | Fragment header     | -      | 8             | inherits frame CRC      |
//! | Capability TLV      | -      | variable      | inherits frame CRC      |

pub mod batch;
pub mod capability;
pub mod crc;
pub mod discovery;
pub mod fragment;
pub mod message;
pub mod udp;

use crate::error::CodecError;

/// `"PTLK"` - discovery broadcast magic
pub const MAGIC_DISCOVERY: u32 = 0x5054_4C4B;

/// `"PTMG"` - reliable message frame magic
pub const MAGIC_MESSAGE: u32 = 0x5054_4D47;

/// `"PTUD"` - unreliable datagram magic
pub const MAGIC_UDP: u32 = 0x5054_5544;

/// Size of every CRC-16 trailer
pub const CHECKSUM_SIZE: usize = 2;

/// Verify that `buf` holds at least `expected` bytes.
#[inline]
pub(crate) fn ensure_len(buf: &[u8], expected: usize) -> Result<(), CodecError> {
    if buf.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Verify the 4-byte magic at the start of `buf` (length already checked).
#[inline]
pub(crate) fn check_magic(buf: &[u8], expected: u32) -> Result<(), CodecError> {
    let actual = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if actual != expected {
        return Err(CodecError::BadMagic { expected, actual });
    }
    Ok(())
}

/// Verify that an output buffer can hold `needed` bytes.
#[inline]
pub(crate) fn ensure_room(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

/// Which wire format a raw buffer claims to be, judged by its magic alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `PTLK` discovery broadcast
    Discovery,
    /// `PTMG` reliable frame
    Message,
    /// `PTUD` unreliable datagram
    Datagram,
}

impl PacketKind {
    /// Classify a buffer by its leading magic.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Truncated` for buffers shorter than four bytes and
    /// `CodecError::BadMagic` when the magic matches no known format.
    pub fn sniff(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, 4)?;
        match u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) {
            MAGIC_DISCOVERY => Ok(Self::Discovery),
            MAGIC_MESSAGE => Ok(Self::Message),
            MAGIC_UDP => Ok(Self::Datagram),
            actual => Err(CodecError::BadMagic {
                expected: MAGIC_MESSAGE,
                actual,
            }),
        }
    }
}
