//! Page header and type definitions.
//!
//! Every page starts with a [`PageHeader`]:
//! - [`PageType`] discriminator
//! - CRC32 checksum for integrity
//! - LSN reserved for a future WAL layer

/// Type of page stored on disk.
///
/// `#[repr(u8)]` guarantees a 1-byte representation for serialization.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Uninitialized or corrupted page.
    #[default]
    Invalid = 0,
    /// The file-entry catalog (page 0 of the database file).
    Catalog = 1,
    /// A B+Tree header page (one per tree).
    BTreeHeader = 2,
    /// A B+Tree internal (index) node.
    BTreeInternal = 3,
    /// A B+Tree leaf node.
    BTreeLeaf = 4,
    /// Page on the free list.
    Free = 5,
}

impl PageType {
    /// Convert from u8, returning Invalid for unknown values.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Catalog,
            2 => PageType::BTreeHeader,
            3 => PageType::BTreeInternal,
            4 => PageType::BTreeLeaf,
            5 => PageType::Free,
            _ => PageType::Invalid,
        }
    }
}

/// Metadata stored at the beginning of every page.
///
/// # Layout (13 bytes)
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       1     page_type (PageType as u8)
/// 1       4     checksum (CRC32, little-endian)
/// 5       8     lsn (little-endian, reserved)
/// ```
///
/// The checksum is computed over the whole page with the checksum field
/// itself zeroed, so verification needs no special carve-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Type of this page.
    pub page_type: PageType,
    /// CRC32 checksum of the page contents.
    pub checksum: u32,
    /// Log sequence number of the last modification (reserved).
    pub lsn: u64,
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 13;

    pub const OFFSET_PAGE_TYPE: usize = 0;
    pub const OFFSET_CHECKSUM: usize = 1;
    pub const OFFSET_LSN: usize = 5;

    /// Create a new header with the given page type; checksum and LSN zero.
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            checksum: 0,
            lsn: 0,
        }
    }

    /// Read a header from the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        let page_type = PageType::from_u8(data[Self::OFFSET_PAGE_TYPE]);

        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]);
        let checksum = u32::from_le_bytes(checksum_bytes);

        let mut lsn_bytes = [0u8; 8];
        lsn_bytes.copy_from_slice(&data[Self::OFFSET_LSN..Self::OFFSET_LSN + 8]);
        let lsn = u64::from_le_bytes(lsn_bytes);

        Self {
            page_type,
            checksum,
            lsn,
        }
    }

    /// Write this header to the beginning of a byte slice.
    ///
    /// # Panics
    /// Panics if `data.len() < PageHeader::SIZE`.
    pub fn write_to(&self, data: &mut [u8]) {
        assert!(data.len() >= Self::SIZE, "buffer too small for PageHeader");

        data[Self::OFFSET_PAGE_TYPE] = self.page_type as u8;
        data[Self::OFFSET_CHECKSUM..Self::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&self.checksum.to_le_bytes());
        data[Self::OFFSET_LSN..Self::OFFSET_LSN + 8].copy_from_slice(&self.lsn.to_le_bytes());
    }

    /// Compute the CRC32 checksum of a page, with the checksum field
    /// fed in as zeros so the checksum doesn't include itself.
    pub fn compute_checksum(page_data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_data[..Self::OFFSET_CHECKSUM]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page_data[Self::OFFSET_CHECKSUM + 4..]);
        hasher.finalize()
    }

    /// Verify that the stored checksum matches the computed checksum.
    pub fn verify_checksum(&self, page_data: &[u8]) -> bool {
        self.checksum == Self::compute_checksum(page_data)
    }
}
