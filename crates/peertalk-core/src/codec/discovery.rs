//! Discovery broadcast packets (`PTLK`).
//!
//! ```text
//!  0       4   5   6       8       10  11  12          12+n    14+n
//! +-------+---+---+-------+-------+---+---+-----------+-------+
//! | PTLK  |ver|typ| flags | port  |trn|len| name[len] | CRC16 |
//! +-------+---+---+-------+-------+---+---+-----------+-------+
//! ```
//!
//! The CRC covers everything before the trailer.

use std::fmt;

use super::crc::checksum16;
use super::{CHECKSUM_SIZE, MAGIC_DISCOVERY, check_magic, ensure_len, ensure_room, read_u16, write_u16};
use crate::PROTOCOL_VERSION;
use crate::error::CodecError;

/// Fixed header size before the name
pub const DISCOVERY_HEADER_SIZE: usize = 12;

/// Smallest valid packet: header plus trailer with an empty name
pub const DISCOVERY_MIN_SIZE: usize = DISCOVERY_HEADER_SIZE + CHECKSUM_SIZE;

/// Longest peer name carried on the wire
pub const MAX_PEER_NAME: usize = 31;

/// Largest possible encoded packet
pub const DISCOVERY_MAX_SIZE: usize = DISCOVERY_MIN_SIZE + MAX_PEER_NAME;

/// Discovery packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DiscoveryType {
    /// Periodic presence broadcast
    Announce = 0x01,
    /// Ask every listener to announce
    Query = 0x02,
    /// Peer is leaving the network
    Goodbye = 0x03,
}

impl TryFrom<u8> for DiscoveryType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Announce),
            0x02 => Ok(Self::Query),
            0x03 => Ok(Self::Goodbye),
            _ => Err(CodecError::InvalidType(value)),
        }
    }
}

/// Peer role flags advertised in discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PeerFlags(u16);

impl PeerFlags {
    /// Peer is hosting the session
    pub const HOST: u16 = 0x0001;
    /// Peer accepts inbound connections
    pub const ACCEPTING: u16 = 0x0002;
    /// Peer is a read-only spectator
    pub const SPECTATOR: u16 = 0x0004;
    /// Application-defined readiness
    pub const READY: u16 = 0x0008;

    /// Create flags from a raw bitmask
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Add HOST flag
    #[must_use]
    pub fn with_host(mut self) -> Self {
        self.0 |= Self::HOST;
        self
    }

    /// Add ACCEPTING flag
    #[must_use]
    pub fn with_accepting(mut self) -> Self {
        self.0 |= Self::ACCEPTING;
        self
    }

    /// Check if HOST is set
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.0 & Self::HOST != 0
    }

    /// Check if ACCEPTING is set
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.0 & Self::ACCEPTING != 0
    }

    /// Get raw value
    #[must_use]
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Transports a peer can be reached over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Transports(u8);

impl Transports {
    /// Reliable stream transport
    pub const TCP: u8 = 0x01;
    /// Datagram transport
    pub const UDP: u8 = 0x02;
    /// AppleTalk ADSP
    pub const APPLETALK: u8 = 0x04;

    /// Create from a raw bitmask
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Check whether every bit in `mask` is set
    #[must_use]
    pub fn contains(&self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    /// Get raw value
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// A display name of at most [`MAX_PEER_NAME`] bytes.
///
/// Stored inline so peer records stay fixed-size. Names are byte strings on
/// the wire; legacy hosts may send non-UTF-8 encodings, so the raw bytes are
/// kept and only rendered lossily.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerName {
    bytes: [u8; MAX_PEER_NAME],
    len: u8,
}

impl PeerName {
    /// The empty name
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_PEER_NAME],
        len: 0,
    };

    /// Build a name from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::NameTooLong` if `raw` exceeds 31 bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() > MAX_PEER_NAME {
            return Err(CodecError::NameTooLong(raw.len()));
        }
        let mut bytes = [0u8; MAX_PEER_NAME];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    /// Build a name from a string, cutting it to 31 bytes on a char boundary.
    #[must_use]
    pub fn truncated(name: &str) -> Self {
        let mut end = name.len().min(MAX_PEER_NAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        // cannot fail: end <= MAX_PEER_NAME
        Self::from_bytes(&name.as_bytes()[..end]).unwrap_or(Self::EMPTY)
    }

    /// Raw name bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Name length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// True for the empty name
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PeerName {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Decoded discovery packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPacket {
    /// Packet type
    pub packet_type: DiscoveryType,
    /// Role flags of the sender
    pub flags: PeerFlags,
    /// Port the sender accepts reliable connections on
    pub sender_port: u16,
    /// Transports the sender supports
    pub transports: Transports,
    /// Sender display name
    pub name: PeerName,
}

impl DiscoveryPacket {
    /// Create a packet of the given type with default flags and transports
    #[must_use]
    pub fn new(packet_type: DiscoveryType, name: PeerName, sender_port: u16) -> Self {
        Self {
            packet_type,
            flags: PeerFlags::default(),
            sender_port,
            transports: Transports::from_bits(Transports::TCP | Transports::UDP),
            name,
        }
    }

    /// Number of bytes [`encode`](Self::encode) will write
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        DISCOVERY_MIN_SIZE + self.name.len()
    }

    /// Encode into `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::BufferTooSmall` if `buf` cannot hold the packet.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let size = self.encoded_len();
        ensure_room(buf, size)?;

        let name_len = self.name.len();
        buf[0..4].copy_from_slice(&MAGIC_DISCOVERY.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.packet_type as u8;
        write_u16(buf, 6, self.flags.bits());
        write_u16(buf, 8, self.sender_port);
        buf[10] = self.transports.bits();
        buf[11] = name_len as u8;
        buf[DISCOVERY_HEADER_SIZE..DISCOVERY_HEADER_SIZE + name_len]
            .copy_from_slice(self.name.as_bytes());

        let body = DISCOVERY_HEADER_SIZE + name_len;
        let crc = checksum16(&buf[..body]);
        write_u16(buf, body, crc);

        Ok(size)
    }

    /// Encode into a freshly allocated buffer
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        // cannot fail: buffer sized by encoded_len
        let _ = self.encode(&mut buf);
        buf
    }

    /// Decode and validate a discovery packet.
    ///
    /// Validation order: minimum length, magic, version, type, name length,
    /// declared length against the buffer, then the CRC trailer.
    ///
    /// # Errors
    ///
    /// Returns the first `CodecError` encountered along that ladder.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len(buf, DISCOVERY_MIN_SIZE)?;
        check_magic(buf, MAGIC_DISCOVERY)?;

        if buf[4] != PROTOCOL_VERSION {
            return Err(CodecError::BadVersion(buf[4]));
        }
        let packet_type = DiscoveryType::try_from(buf[5])?;

        let name_len = usize::from(buf[11]);
        if name_len > MAX_PEER_NAME {
            return Err(CodecError::NameTooLong(name_len));
        }

        let body = DISCOVERY_HEADER_SIZE + name_len;
        ensure_len(buf, body + CHECKSUM_SIZE)?;

        let expected = read_u16(buf, body);
        let computed = checksum16(&buf[..body]);
        if expected != computed {
            return Err(CodecError::ChecksumMismatch { expected, computed });
        }

        Ok(Self {
            packet_type,
            flags: PeerFlags::from_bits(read_u16(buf, 6)),
            sender_port: read_u16(buf, 8),
            transports: Transports::from_bits(buf[10]),
            name: PeerName::from_bytes(&buf[DISCOVERY_HEADER_SIZE..body])?,
        })
    }
}
