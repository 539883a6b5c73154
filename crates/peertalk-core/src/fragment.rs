//! Transparent fragmentation and per-peer reassembly.
//!
//! A payload larger than a peer's effective message size is split by
//! [`fragment`] into pieces of `max - 8` data bytes, each prefixed with a
//! [`FragmentHeader`]. The receiver feeds them to its [`Reassembler`], which
//! rebuilds one message at a time.
//!
//! Fragments travel over the reliable stream and so arrive in order. A gap
//! leaves the message incomplete and the LAST fragment reports an error.

use crate::codec::fragment::{FRAGMENT_HEADER_SIZE, FragmentFlags, FragmentHeader};
use crate::error::FragmentError;

/// Smallest per-fragment data size worth sending
pub const MIN_FRAGMENT_DATA: usize = 64;

/// Split `data` into fragments that each fit in `max_message` bytes.
///
/// # Errors
///
/// - `FragmentError::ZeroLength` for an empty payload
/// - `FragmentError::TooLarge` if `data` does not fit the 16-bit length field
/// - `FragmentError::ChunkTooSmall` if `max_message` leaves fewer than
///   [`MIN_FRAGMENT_DATA`] bytes per fragment
pub fn fragment(
    message_id: u16,
    data: &[u8],
    max_message: usize,
) -> Result<Fragments<'_>, FragmentError> {
    if data.is_empty() {
        return Err(FragmentError::ZeroLength);
    }
    let total_length = u16::try_from(data.len()).map_err(|_| FragmentError::TooLarge {
        total: data.len(),
        max: usize::from(u16::MAX),
    })?;
    let chunk = max_message.saturating_sub(FRAGMENT_HEADER_SIZE);
    if chunk < MIN_FRAGMENT_DATA {
        return Err(FragmentError::ChunkTooSmall(max_message));
    }

    Ok(Fragments {
        data,
        message_id,
        total_length,
        chunk,
        offset: 0,
    })
}

/// Iterator over the fragments of one message
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    data: &'a [u8],
    message_id: u16,
    total_length: u16,
    chunk: usize,
    offset: usize,
}

impl Fragments<'_> {
    /// Data bytes carried by each full fragment
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = (FragmentHeader, &'a [u8]);

    #[allow(clippy::cast_possible_truncation)]
    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.data.len().checked_sub(self.offset)?;
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(self.chunk);

        let mut flags = FragmentFlags::default();
        if self.offset == 0 {
            flags = flags.with_first();
        }
        if remaining <= self.chunk {
            flags = flags.with_last();
        }

        let header = FragmentHeader {
            message_id: self.message_id,
            total_length: self.total_length,
            offset: self.offset as u16,
            flags,
        };
        let piece = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some((header, piece))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.data.len().saturating_sub(self.offset);
        let n = remaining.div_ceil(self.chunk);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

/// Result of feeding one fragment to a [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More fragments are expected
    Pending,
    /// The message is complete
    Complete(Vec<u8>),
}

/// Rebuilds one fragmented message at a time
#[derive(Debug, Clone)]
pub struct Reassembler {
    buffer: Vec<u8>,
    message_id: u16,
    total: usize,
    filled: usize,
    active: bool,
    max_total: usize,
}

impl Reassembler {
    /// Create a reassembler accepting messages up to `max_total` bytes
    #[must_use]
    pub fn new(max_total: usize) -> Self {
        Self {
            buffer: Vec::new(),
            message_id: 0,
            total: 0,
            filled: 0,
            active: false,
            max_total,
        }
    }

    /// Feed one fragment.
    ///
    /// A FIRST fragment always starts a new message, abandoning any partial
    /// one. Every error also resets the reassembler.
    ///
    /// # Errors
    ///
    /// - `FragmentError::NoActiveReassembly` for a non-FIRST fragment with
    ///   nothing in flight
    /// - `FragmentError::MessageIdMismatch` for a fragment of another message
    /// - `FragmentError::OutOfBounds` when the data runs past the total
    /// - `FragmentError::Incomplete` when LAST arrives before every byte
    /// - `FragmentError::ZeroLength` or `FragmentError::TooLarge` for a FIRST
    ///   fragment declaring an unusable total
    pub fn process(
        &mut self,
        header: &FragmentHeader,
        data: &[u8],
    ) -> Result<Reassembly, FragmentError> {
        let result = self.apply(header, data);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn apply(&mut self, header: &FragmentHeader, data: &[u8]) -> Result<Reassembly, FragmentError> {
        if header.flags.is_first() {
            self.begin(header)?;
        } else if !self.active {
            return Err(FragmentError::NoActiveReassembly(header.message_id));
        } else if header.message_id != self.message_id {
            return Err(FragmentError::MessageIdMismatch {
                expected: self.message_id,
                actual: header.message_id,
            });
        }

        let offset = usize::from(header.offset);
        let end = offset + data.len();
        if end > self.total {
            return Err(FragmentError::OutOfBounds {
                offset,
                len: data.len(),
                total: self.total,
            });
        }

        self.buffer[offset..end].copy_from_slice(data);
        if offset <= self.filled {
            self.filled = self.filled.max(end);
        }

        if !header.flags.is_last() {
            return Ok(Reassembly::Pending);
        }
        if self.filled != self.total {
            return Err(FragmentError::Incomplete {
                received: self.filled,
                total: self.total,
            });
        }

        let message = std::mem::take(&mut self.buffer);
        tracing::debug!(
            "Reassembled message {} ({} bytes)",
            self.message_id,
            message.len()
        );
        self.reset();
        Ok(Reassembly::Complete(message))
    }

    fn begin(&mut self, header: &FragmentHeader) -> Result<(), FragmentError> {
        let total = usize::from(header.total_length);
        if total == 0 {
            return Err(FragmentError::ZeroLength);
        }
        if total > self.max_total {
            return Err(FragmentError::TooLarge {
                total,
                max: self.max_total,
            });
        }
        if self.active {
            tracing::debug!(
                "Abandoning partial message {} ({}/{} bytes) for message {}",
                self.message_id,
                self.filled,
                self.total,
                header.message_id
            );
        }

        self.buffer.clear();
        self.buffer.resize(total, 0);
        self.message_id = header.message_id;
        self.total = total;
        self.filled = 0;
        self.active = true;
        Ok(())
    }

    /// Drop any partial message
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.message_id = 0;
        self.total = 0;
        self.filled = 0;
        self.active = false;
    }

    /// True while a message is partially received
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bytes received and expected for the message in flight
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        (self.filled, self.total)
    }
}
