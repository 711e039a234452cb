//! Configuration constants for stratadb.

/// Size of a page in bytes.
///
/// 4KB matches the OS page size on most systems and keeps disk I/O
/// aligned to what storage devices do internally. With 32-bit page ids
/// this caps a database file at 16TB.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of pages addressable with a u32 PageId.
pub const MAX_PAGES: u64 = (u32::MAX as u64) + 1;

/// Maximum theoretical database size in bytes.
pub const MAX_DB_SIZE_BYTES: u64 = MAX_PAGES * PAGE_SIZE as u64;

/// Minimum page occupancy enforced by the full delete policy,
/// as a percentage of a node's usable capacity.
pub const MIN_OCCUPANCY_PERCENT: usize = 50;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(PAGE_SIZE.is_power_of_two());
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn max_db_size() {
        let expected = 16 * 1024u64 * 1024 * 1024 * 1024;
        assert_eq!(MAX_DB_SIZE_BYTES, expected);
    }
}
