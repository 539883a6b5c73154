//! CRC-16 used by every checksummed PeerTalk format.
//!
//! Polynomial 0x1021 in reflected form (0x8408), initial value 0, no final
//! XOR (the CRC-16/KERMIT parameterisation). The lookup table is built at
//! compile time so the per-byte cost is one table load, one shift and two
//! XORs, with no multiply or divide.
//!
//! The update form lets callers checksum non-contiguous regions, e.g. a frame
//! header followed by a payload held in a separate buffer, without copying.

/// Reflected polynomial
const POLY: u16 = 0x8408;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// Compute the CRC-16 of `data`.
#[must_use]
pub fn checksum16(data: &[u8]) -> u16 {
    checksum16_update(0, data)
}

/// Continue a CRC-16 computation over another region.
///
/// `checksum16_update(checksum16(a), b) == checksum16(a ++ b)`.
#[must_use]
#[inline]
pub fn checksum16_update(crc: u16, data: &[u8]) -> u16 {
    data.iter().fold(crc, |crc, &byte| {
        (crc >> 8) ^ TABLE[usize::from((crc ^ u16::from(byte)) & 0xFF)]
    })
}

/// Check `data` against an expected CRC-16.
#[must_use]
pub fn checksum16_check(data: &[u8], expected: u16) -> bool {
    checksum16(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(checksum16(b"123456789"), 0x2189);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(checksum16(&[]), 0);
    }

    #[test]
    fn test_table_spot_values() {
        assert_eq!(TABLE[0], 0x0000);
        assert_eq!(TABLE[1], 0x1189);
        assert_eq!(TABLE[128], 0x8408);
        assert_eq!(TABLE[255], 0x0F78);
    }

    #[test]
    fn test_update_matches_contiguous() {
        let data = b"PeerTalk header and payload";
        let (head, tail) = data.split_at(10);
        assert_eq!(checksum16_update(checksum16(head), tail), checksum16(data));
    }

    #[test]
    fn test_check() {
        assert!(checksum16_check(b"123456789", 0x2189));
        assert!(!checksum16_check(b"123456788", 0x2189));
    }
}
