//! Unreliable datagrams (`PTUD`).
//!
//! An 8-byte header followed by the payload. There is no checksum trailer;
//! the datagram transport supplies its own.

use super::{MAGIC_UDP, check_magic, ensure_len, ensure_room, read_u16, write_u16};
use crate::error::CodecError;

/// Fixed datagram header size
pub const UDP_HEADER_SIZE: usize = 8;

/// Largest payload that fits one Ethernet-sized datagram
pub const MAX_UDP_PAYLOAD: usize = 1400;

/// Zero-copy view of a decoded datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram<'a> {
    /// Port the sender's datagram socket is bound to
    pub sender_port: u16,
    /// Datagram payload
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Create a datagram view over `payload`
    #[must_use]
    pub fn new(sender_port: u16, payload: &'a [u8]) -> Self {
        Self {
            sender_port,
            payload,
        }
    }

    /// Number of bytes [`encode`](Self::encode) will write
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        UDP_HEADER_SIZE + self.payload.len()
    }

    /// Encode into `buf`, returning bytes written.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::PayloadTooLarge` if the payload does not fit the
    /// 16-bit length, or `CodecError::BufferTooSmall` if `buf` is too short.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;
        let size = self.encoded_len();
        ensure_room(buf, size)?;

        buf[0..4].copy_from_slice(&MAGIC_UDP.to_be_bytes());
        write_u16(buf, 4, self.sender_port);
        write_u16(buf, 6, payload_len);
        buf[UDP_HEADER_SIZE..size].copy_from_slice(self.payload);
        Ok(size)
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::PayloadTooLarge` for payloads over 65535 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a datagram.
    ///
    /// # Errors
    ///
    /// `CodecError::Truncated` when the buffer is shorter than the header or
    /// than the declared payload, `CodecError::BadMagic` on a magic mismatch.
    pub fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        ensure_len(buf, UDP_HEADER_SIZE)?;
        check_magic(buf, MAGIC_UDP)?;

        let sender_port = read_u16(buf, 4);
        let payload_len = usize::from(read_u16(buf, 6));
        ensure_len(buf, UDP_HEADER_SIZE + payload_len)?;

        Ok(Self {
            sender_port,
            payload: &buf[UDP_HEADER_SIZE..UDP_HEADER_SIZE + payload_len],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_roundtrip() {
        let dg = Datagram::new(7355, b"position 10,20");
        let bytes = dg.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"PTUD");
        assert_eq!(bytes.len(), UDP_HEADER_SIZE + 14);
        assert_eq!(Datagram::decode(&bytes).unwrap(), dg);
    }

    #[test]
    fn test_datagram_too_short() {
        assert!(matches!(
            Datagram::decode(b"PTUD"),
            Err(CodecError::Truncated { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn test_datagram_declared_length_overflows_buffer() {
        let mut bytes = Datagram::new(1, b"abc").to_bytes().unwrap();
        bytes[7] = 4;
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(CodecError::Truncated { expected: 12, actual: 11 })
        ));
    }

    #[test]
    fn test_datagram_bad_magic() {
        let mut bytes = Datagram::new(1, b"abc").to_bytes().unwrap();
        bytes[2] = b'M';
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(CodecError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_datagram_encode_buffer_too_small() {
        let dg = Datagram::new(1, &[0u8; 32]);
        let mut buf = [0u8; 16];
        assert!(matches!(
            dg.encode(&mut buf),
            Err(CodecError::BufferTooSmall { needed: 40, available: 16 })
        ));
    }
}
