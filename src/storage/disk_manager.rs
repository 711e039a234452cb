//! Disk Manager - low-level file I/O for database pages.
//!
//! The [`DiskManager`] handles all direct file operations: reading and
//! writing pages, allocating new pages, and recycling freed ones.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::common::config::PAGE_SIZE;
use crate::common::{Error, PageId, Result};
use crate::storage::page::{Page, PageType};

/// Manages disk I/O for a single database file.
///
/// # File Layout
/// Pages are laid out sequentially; page N lives at offset `N * PAGE_SIZE`.
///
/// # Free list
/// Deallocated pages are zeroed on disk with a [`PageType::Free`] tag and
/// remembered in an in-memory free list. `allocate_page` reuses those
/// before extending the file; `open` rebuilds the list by scanning the
/// type byte of every page. Pages are never returned to the filesystem.
///
/// # Thread Safety
/// `DiskManager` is single-threaded; the `BufferPoolManager` serializes
/// access to it.
///
/// # Durability
/// All writes are followed by `fsync()`. Conservative, to be revisited
/// if a WAL with group commit lands.
pub struct DiskManager {
    file: File,
    /// Number of pages in the file (including free ones).
    page_count: u32,
    /// Pages available for reuse.
    free_list: Vec<PageId>,
}

impl DiskManager {
    /// Create a new database file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Self {
            file,
            page_count: 0,
            free_list: Vec::new(),
        })
    }

    /// Open an existing database file, rebuilding the free list.
    ///
    /// # Errors
    /// Returns an error if the file doesn't exist or cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let metadata = file.metadata()?;
        let page_count = (metadata.len() / PAGE_SIZE as u64) as u32;

        let mut dm = Self {
            file,
            page_count,
            free_list: Vec::new(),
        };
        dm.rebuild_free_list()?;
        Ok(dm)
    }

    /// Open an existing database file, or create it if it doesn't exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Read a page from disk.
    ///
    /// # Errors
    /// Returns `Error::PageNotFound` if the page doesn't exist.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if page_id.0 >= self.page_count {
            return Err(Error::PageNotFound(page_id.0));
        }

        self.file
            .seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;

        let mut page = Page::new();
        self.file.read_exact(page.as_mut_slice())?;
        Ok(page)
    }

    /// Write a page to disk, followed by `fsync()`.
    ///
    /// # Errors
    /// Returns `Error::PageNotFound` if the page hasn't been allocated.
    pub fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        if page_id.0 >= self.page_count {
            return Err(Error::PageNotFound(page_id.0));
        }

        self.file
            .seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(page.as_slice())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Allocate a page, reusing a freed page when one is available and
    /// extending the file otherwise. The page starts zeroed.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        if let Some(page_id) = self.free_list.pop() {
            // Scrub the Free tag so a crash between here and first write
            // doesn't leave the page on the rebuilt free list.
            self.write_zeros(page_id)?;
            return Ok(page_id);
        }

        let page_id = PageId::new(self.page_count);
        self.page_count += 1;
        self.write_zeros(page_id)?;
        Ok(page_id)
    }

    /// Return a page to the free list. The page is zeroed on disk and
    /// tagged [`PageType::Free`].
    ///
    /// # Errors
    /// Returns `Error::PageNotFound` if the page was never allocated.
    pub fn deallocate_page(&mut self, page_id: PageId) -> Result<()> {
        if page_id.0 >= self.page_count {
            return Err(Error::PageNotFound(page_id.0));
        }

        let mut page = Page::new();
        page.as_mut_slice()[0] = PageType::Free as u8;
        self.write_page(page_id, &page)?;
        self.free_list.push(page_id);
        Ok(())
    }

    /// Get the number of pages in the file (allocated plus free).
    #[inline]
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Get the number of pages currently on the free list.
    #[inline]
    pub fn free_page_count(&self) -> usize {
        self.free_list.len()
    }

    /// Get the total size of the database file in bytes.
    #[inline]
    pub fn file_size(&self) -> u64 {
        (self.page_count as u64) * (PAGE_SIZE as u64)
    }

    fn write_zeros(&mut self, page_id: PageId) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;
        let zeros = [0u8; PAGE_SIZE];
        self.file.write_all(&zeros)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn rebuild_free_list(&mut self) -> Result<()> {
        let mut tag = [0u8; 1];
        for i in 0..self.page_count {
            self.file
                .seek(SeekFrom::Start(i as u64 * PAGE_SIZE as u64))?;
            self.file.read_exact(&mut tag)?;
            if PageType::from_u8(tag[0]) == PageType::Free {
                self.free_list.push(PageId::new(i));
            }
        }
        Ok(())
    }
}
