//! Batched DATA payloads.
//!
//! Many small messages (input events, position updates) can share one frame
//! marked [`MessageFlags::BATCH`](super::message::MessageFlags::BATCH). Each
//! entry is prefixed with a 4-byte header: big-endian length plus two
//! reserved bytes.

use super::{ensure_len, read_u16};
use crate::error::CodecError;

/// Largest batch payload: Ethernet MTU minus a generous TCP/IP margin
pub const BATCH_MAX_SIZE: usize = 1400;

/// Per-entry prefix size
pub const BATCH_ENTRY_HEADER: usize = 4;

/// Accumulates messages into one batch payload
#[derive(Debug, Clone)]
pub struct Batch {
    buffer: Vec<u8>,
    count: usize,
    limit: usize,
}

impl Batch {
    /// Create an empty batch with its full buffer reserved up front
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(BATCH_MAX_SIZE)
    }

    /// Create an empty batch whose payload stays within `limit` bytes
    /// (never more than [`BATCH_MAX_SIZE`])
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.min(BATCH_MAX_SIZE);
        Self {
            buffer: Vec::with_capacity(limit),
            count: 0,
            limit,
        }
    }

    /// Whether `len` more bytes of message would still fit
    #[must_use]
    pub fn fits(&self, len: usize) -> bool {
        self.buffer.len() + BATCH_ENTRY_HEADER + len <= self.limit
    }

    /// Append one message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::BufferTooSmall` if the message does not fit; the
    /// batch is left unchanged.
    pub fn push(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if !self.fits(data.len()) {
            return Err(CodecError::BufferTooSmall {
                needed: self.buffer.len() + BATCH_ENTRY_HEADER + data.len(),
                available: self.limit,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = data.len() as u16;
        self.buffer.extend_from_slice(&len.to_be_bytes());
        self.buffer.extend_from_slice(&[0, 0]);
        self.buffer.extend_from_slice(data);
        self.count += 1;
        Ok(())
    }

    /// Number of messages in the batch
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// True if no message has been added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded payload bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Reset for reuse, keeping the allocation
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.count = 0;
    }

    /// Iterate the entries of a received batch payload
    #[must_use]
    pub fn entries(payload: &[u8]) -> BatchEntries<'_> {
        BatchEntries { payload, pos: 0 }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the entries of a batch payload.
///
/// Yields an error and then stops if an entry is truncated.
#[derive(Debug, Clone)]
pub struct BatchEntries<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for BatchEntries<'a> {
    type Item = Result<&'a [u8], CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.payload.len() {
            return None;
        }
        let rest = &self.payload[self.pos..];
        if let Err(e) = ensure_len(rest, BATCH_ENTRY_HEADER) {
            self.pos = self.payload.len();
            return Some(Err(e));
        }
        let len = usize::from(read_u16(rest, 0));
        if let Err(e) = ensure_len(rest, BATCH_ENTRY_HEADER + len) {
            self.pos = self.payload.len();
            return Some(Err(e));
        }
        self.pos += BATCH_ENTRY_HEADER + len;
        Some(Ok(&rest[BATCH_ENTRY_HEADER..BATCH_ENTRY_HEADER + len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_roundtrip() {
        let mut batch = Batch::new();
        batch.push(b"first").unwrap();
        batch.push(b"").unwrap();
        batch.push(b"third message").unwrap();
        assert_eq!(batch.count(), 3);
        assert_eq!(batch.as_bytes().len(), 3 * BATCH_ENTRY_HEADER + 5 + 13);

        let entries: Vec<_> = Batch::entries(batch.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries, vec![&b"first"[..], &b""[..], &b"third message"[..]]);
    }

    #[test]
    fn test_batch_full() {
        let mut batch = Batch::new();
        let chunk = [0x55u8; 696];
        batch.push(&chunk).unwrap();
        batch.push(&chunk).unwrap();
        assert_eq!(batch.as_bytes().len(), BATCH_MAX_SIZE);
        assert!(matches!(
            batch.push(b"x"),
            Err(CodecError::BufferTooSmall { .. })
        ));
        assert_eq!(batch.count(), 2);

        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.fits(BATCH_MAX_SIZE - BATCH_ENTRY_HEADER));
    }

    #[test]
    fn test_batch_limit() {
        let mut batch = Batch::with_limit(512);
        assert!(batch.fits(508));
        assert!(!batch.fits(509));
        batch.push(&[0u8; 200]).unwrap();
        assert!(matches!(
            batch.push(&[0u8; 400]),
            Err(CodecError::BufferTooSmall { available: 512, .. })
        ));

        // never above the datagram-sized ceiling
        assert!(!Batch::with_limit(8192).fits(BATCH_MAX_SIZE));
    }

    #[test]
    fn test_batch_truncated_entry() {
        let mut batch = Batch::new();
        batch.push(b"hello").unwrap();
        let bytes = batch.as_bytes();
        let mut iter = Batch::entries(&bytes[..bytes.len() - 2]);
        assert!(matches!(iter.next(), Some(Err(CodecError::Truncated { .. }))));
        assert!(iter.next().is_none());
    }
}
