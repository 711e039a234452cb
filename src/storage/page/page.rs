//! Page - the fundamental 4KB unit of storage.

use crate::common::config::PAGE_SIZE;

use super::page_header::PageHeader;

/// A page of data (4KB, 4KB-aligned).
///
/// This is the unit of I/O between disk and memory. The buffer pool
/// holds these in frames; the index layer overlays typed node views on
/// top of the raw bytes.
///
/// Aligned to 4096 bytes so the buffer works with O_DIRECT-style I/O
/// without copies. `Clone` is deliberately test-only: copying 4KB
/// should be explicit in production paths.
#[repr(align(4096))]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// Create a new zeroed page.
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Get immutable slice of page data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable slice of page data.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero out the entire page.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    /// Get the size of a page.
    #[inline]
    pub const fn size() -> usize {
        PAGE_SIZE
    }

    /// Read the page header.
    pub fn header(&self) -> PageHeader {
        PageHeader::from_bytes(&self.data)
    }

    /// Write a page header.
    pub fn set_header(&mut self, header: &PageHeader) {
        header.write_to(&mut self.data);
    }

    /// Compute and store a checksum in the header. Call after all
    /// modifications to the page are complete.
    pub fn update_checksum(&mut self) {
        let checksum = PageHeader::compute_checksum(&self.data);
        self.data[PageHeader::OFFSET_CHECKSUM..PageHeader::OFFSET_CHECKSUM + 4]
            .copy_from_slice(&checksum.to_le_bytes());
    }

    /// Verify the page checksum is valid.
    pub fn verify_checksum(&self) -> bool {
        self.header().verify_checksum(&self.data)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clone for Page {
    fn clone(&self) -> Self {
        let mut new_page = Page::new();
        new_page.data.copy_from_slice(&self.data);
        new_page
    }
}
