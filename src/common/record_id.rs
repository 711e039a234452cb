//! Record locator type.

use std::fmt;

/// Locates a record in some external heap file: a (page, slot) pair.
///
/// The index layer treats this as an opaque value: it is stored next to
/// keys in leaf pages and handed back by scans, but never dereferenced
/// here. Encoded as 8 little-endian bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Page of the heap file holding the record.
    pub page_no: u32,
    /// Slot within that page.
    pub slot_no: u32,
}

impl RecordId {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Create a new RecordId.
    #[inline]
    pub fn new(page_no: u32, slot_no: u32) -> Self {
        Self { page_no, slot_no }
    }

    /// Decode from 8 little-endian bytes.
    ///
    /// # Panics
    /// Panics if `bytes.len() < RecordId::SIZE`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE, "buffer too small for RecordId");
        Self {
            page_no: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            slot_no: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Encode to 8 little-endian bytes.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.page_no.to_le_bytes());
        out[4..8].copy_from_slice(&self.slot_no.to_le_bytes());
        out
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid({}, {})", self.page_no, self.slot_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let rid = RecordId::new(7, 3);
        let decoded = RecordId::from_bytes(&rid.to_bytes());
        assert_eq!(rid, decoded);
    }

    #[test]
    fn byte_layout() {
        let rid = RecordId::new(0x04030201, 0x08070605);
        let bytes = rid.to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[3], 0x04);
        assert_eq!(bytes[4], 0x05);
        assert_eq!(bytes[7], 0x08);
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", RecordId::new(9, 2)), "Rid(9, 2)");
    }
}
