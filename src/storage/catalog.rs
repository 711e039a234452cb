//! File-entry catalog: maps index file names to header page ids.
//!
//! One [`Catalog`] page sits at page 0 of every database file. Opening a
//! tree looks its name up here; creating one registers the freshly
//! allocated header page; destroying one removes the entry.

use std::sync::Arc;

use crate::buffer::BufferPoolManager;
use crate::common::config::PAGE_SIZE;
use crate::common::{Error, PageId, Result};
use crate::storage::page::{PageHeader, PageType};

/// Maximum file name length in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Fixed location of the catalog page.
const CATALOG_PAGE: PageId = PageId(0);

/// Offset of the entry count field (right after the page header).
const OFFSET_COUNT: usize = PageHeader::SIZE;
/// Offset of the first entry.
const OFFSET_ENTRIES: usize = OFFSET_COUNT + 2;

/// The name → header-page directory of a database file.
///
/// # Entry layout
/// Entries are packed sequentially: `name_len: u16`, `name` bytes,
/// `header_page: u32`. Removal compacts the tail down. With 64-byte
/// names a page holds at least 58 entries, plenty for a single file.
pub struct Catalog {
    bpm: Arc<BufferPoolManager>,
}

impl Catalog {
    /// Open the catalog of a database file, initializing page 0 on a
    /// fresh file.
    pub fn open(bpm: Arc<BufferPoolManager>) -> Result<Self> {
        match bpm.fetch_page_read(CATALOG_PAGE) {
            Ok(guard) => {
                if guard.header().page_type != PageType::Catalog {
                    return Err(Error::corrupted(CATALOG_PAGE, "page 0 is not a catalog page"));
                }
                drop(guard);
            }
            Err(Error::PageNotFound(_)) => {
                let mut guard = bpm.new_page()?;
                if guard.page_id() != CATALOG_PAGE {
                    return Err(Error::corrupted(
                        guard.page_id(),
                        "catalog must occupy page 0 of a fresh file",
                    ));
                }
                guard.set_header(&PageHeader::new(PageType::Catalog));
                set_count(guard.as_mut_slice(), 0);
            }
            Err(e) => return Err(e),
        }
        Ok(Self { bpm })
    }

    /// Look up the header page registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<Option<PageId>> {
        check_name(name)?;
        let guard = self.bpm.fetch_page_read(CATALOG_PAGE)?;
        let data = guard.as_slice();

        let mut offset = OFFSET_ENTRIES;
        for _ in 0..count(data) {
            let (entry_name, header_page, next) = read_entry(data, offset);
            if entry_name == name.as_bytes() {
                return Ok(Some(header_page));
            }
            offset = next;
        }
        Ok(None)
    }

    /// Register `name` → `header_page`.
    ///
    /// # Errors
    /// `Error::FileExists` if the name is already taken, `Error::CatalogFull`
    /// if the page has no room for the entry.
    pub fn register(&self, name: &str, header_page: PageId) -> Result<()> {
        check_name(name)?;
        if self.lookup(name)?.is_some() {
            return Err(Error::FileExists(name.to_string()));
        }

        let mut guard = self.bpm.fetch_page_write(CATALOG_PAGE)?;
        let data = guard.as_mut_slice();
        let n = count(data);

        let mut offset = OFFSET_ENTRIES;
        for _ in 0..n {
            let (_, _, next) = read_entry(data, offset);
            offset = next;
        }

        let needed = 2 + name.len() + 4;
        if offset + needed > PAGE_SIZE {
            return Err(Error::CatalogFull);
        }

        data[offset..offset + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        data[offset + 2..offset + 2 + name.len()].copy_from_slice(name.as_bytes());
        data[offset + 2 + name.len()..offset + needed]
            .copy_from_slice(&header_page.0.to_le_bytes());
        set_count(data, n + 1);
        Ok(())
    }

    /// Remove the entry for `name`. Returns whether an entry existed.
    pub fn unregister(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let mut guard = self.bpm.fetch_page_write(CATALOG_PAGE)?;
        let data = guard.as_mut_slice();
        let n = count(data);

        let mut offset = OFFSET_ENTRIES;
        for _ in 0..n {
            let (entry_name, _, next) = read_entry(data, offset);
            if entry_name == name.as_bytes() {
                // Compact the tail over the removed entry.
                let tail_end = end_of_entries(data, n);
                data.copy_within(next..tail_end, offset);
                set_count(data, n - 1);
                return Ok(true);
            }
            offset = next;
        }
        Ok(false)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::FileNameTooLong(name.len()));
    }
    Ok(())
}

fn count(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[OFFSET_COUNT], data[OFFSET_COUNT + 1]])
}

fn set_count(data: &mut [u8], n: u16) {
    data[OFFSET_COUNT..OFFSET_COUNT + 2].copy_from_slice(&n.to_le_bytes());
}

/// Read the entry at `offset`, returning (name, header page, next offset).
fn read_entry(data: &[u8], offset: usize) -> (&[u8], PageId, usize) {
    let name_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
    let name = &data[offset + 2..offset + 2 + name_len];
    let pid_off = offset + 2 + name_len;
    let pid = u32::from_le_bytes([
        data[pid_off],
        data[pid_off + 1],
        data[pid_off + 2],
        data[pid_off + 3],
    ]);
    (name, PageId::new(pid), pid_off + 4)
}

fn end_of_entries(data: &[u8], n: u16) -> usize {
    let mut offset = OFFSET_ENTRIES;
    for _ in 0..n {
        let (_, _, next) = read_entry(data, offset);
        offset = next;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    fn create_catalog() -> (Catalog, Arc<BufferPoolManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(10, dm));
        let catalog = Catalog::open(Arc::clone(&bpm)).unwrap();
        (catalog, bpm, dir)
    }

    #[test]
    fn register_and_lookup() {
        let (catalog, _bpm, _dir) = create_catalog();

        assert_eq!(catalog.lookup("orders").unwrap(), None);
        catalog.register("orders", PageId::new(7)).unwrap();
        assert_eq!(catalog.lookup("orders").unwrap(), Some(PageId::new(7)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let (catalog, _bpm, _dir) = create_catalog();

        catalog.register("orders", PageId::new(7)).unwrap();
        assert!(matches!(
            catalog.register("orders", PageId::new(8)),
            Err(Error::FileExists(_))
        ));
    }

    #[test]
    fn unregister_compacts() {
        let (catalog, _bpm, _dir) = create_catalog();

        catalog.register("a", PageId::new(1)).unwrap();
        catalog.register("bb", PageId::new(2)).unwrap();
        catalog.register("ccc", PageId::new(3)).unwrap();

        assert!(catalog.unregister("bb").unwrap());
        assert!(!catalog.unregister("bb").unwrap());

        assert_eq!(catalog.lookup("a").unwrap(), Some(PageId::new(1)));
        assert_eq!(catalog.lookup("bb").unwrap(), None);
        assert_eq!(catalog.lookup("ccc").unwrap(), Some(PageId::new(3)));
    }

    #[test]
    fn name_length_enforced() {
        let (catalog, _bpm, _dir) = create_catalog();
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            catalog.register(&long, PageId::new(1)),
            Err(Error::FileNameTooLong(_))
        ));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let dm = DiskManager::create(&path).unwrap();
            let bpm = Arc::new(BufferPoolManager::new(10, dm));
            let catalog = Catalog::open(Arc::clone(&bpm)).unwrap();
            catalog.register("orders", PageId::new(5)).unwrap();
            bpm.flush_all_pages().unwrap();
        }

        {
            let dm = DiskManager::open(&path).unwrap();
            let bpm = Arc::new(BufferPoolManager::new(10, dm));
            let catalog = Catalog::open(Arc::clone(&bpm)).unwrap();
            assert_eq!(catalog.lookup("orders").unwrap(), Some(PageId::new(5)));
        }
    }
}
