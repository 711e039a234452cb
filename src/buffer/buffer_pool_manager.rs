//! Buffer Pool Manager - the page caching layer.
//!
//! The [`BufferPoolManager`] sits between the index layer and the disk:
//! it caches pages in a fixed pool of frames, tracks pins by reference
//! count, writes dirty pages back on eviction, and (new relative to a
//! plain cache) deallocates pages back to the disk free list when the
//! tree frees them.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, RwLock};

use crate::buffer::replacer::FifoReplacer;
use crate::buffer::{BufferPoolStats, Frame, PageReadGuard, PageWriteGuard};
use crate::common::{Error, FrameId, PageId, Result};
use crate::storage::DiskManager;

/// Manages a pool of buffer frames for caching disk pages.
///
/// # Thread Safety
/// - `page_table`: `RwLock` — many readers, few writers
/// - `free_list`, `replacer`, `disk_manager`: `Mutex`
/// - `frames`: fixed size, each frame carries its own locks
/// - `stats`: atomic counters
///
/// # Usage
/// ```ignore
/// let dm = DiskManager::create("index.db")?;
/// let bpm = BufferPoolManager::new(64, dm);
///
/// let mut guard = bpm.new_page()?;          // allocate + pin
/// guard.as_mut_slice()[0] = 0xAB;
/// drop(guard);                              // unpin, marked dirty
///
/// let guard = bpm.fetch_page_read(PageId::new(0))?;
/// ```
pub struct BufferPoolManager {
    /// Fixed pool of frames allocated at startup.
    frames: Vec<Frame>,

    /// Maps page IDs to frame IDs.
    page_table: RwLock<HashMap<PageId, FrameId>>,

    /// Stack of free frame IDs (LIFO for cache locality).
    free_list: Mutex<Vec<FrameId>>,

    /// Eviction policy for selecting victim frames.
    replacer: Mutex<FifoReplacer>,

    /// Handles all disk I/O.
    disk_manager: Mutex<DiskManager>,

    /// Performance statistics.
    stats: BufferPoolStats,

    /// Number of frames in the pool (immutable after construction).
    pool_size: usize,
}

impl BufferPoolManager {
    /// Create a new buffer pool manager over `disk_manager` with
    /// `pool_size` frames.
    ///
    /// # Panics
    /// Panics if `pool_size` is 0.
    pub fn new(pool_size: usize, disk_manager: DiskManager) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");

        let frames: Vec<Frame> = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list: Vec<FrameId> = (0..pool_size).map(FrameId::new).collect();

        Self {
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            replacer: Mutex::new(FifoReplacer::new()),
            disk_manager: Mutex::new(disk_manager),
            stats: BufferPoolStats::new(),
            pool_size,
        }
    }

    /// Fetch a page for reading (shared access).
    ///
    /// # Errors
    /// - `Error::PageNotFound` if the page doesn't exist on disk
    /// - `Error::NoFreeFrames` if all frames are pinned
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame_id = self.fetch_page_internal(page_id)?;
        let lock = self.frames[frame_id.0].page();
        Ok(PageReadGuard::new(self, frame_id, page_id, lock))
    }

    /// Fetch a page for writing (exclusive access). The page is marked
    /// dirty when the guard drops.
    ///
    /// # Errors
    /// - `Error::PageNotFound` if the page doesn't exist on disk
    /// - `Error::NoFreeFrames` if all frames are pinned
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame_id = self.fetch_page_internal(page_id)?;
        let lock = self.frames[frame_id.0].page_mut();
        Ok(PageWriteGuard::new(self, frame_id, page_id, lock))
    }

    /// Allocate a new page on disk and load it into the pool, returning
    /// a write guard for it.
    ///
    /// # Errors
    /// - `Error::NoFreeFrames` if all frames are pinned
    /// - I/O errors from disk allocation
    pub fn new_page(&self) -> Result<PageWriteGuard<'_>> {
        let frame_id = self.get_free_frame()?;

        let page_id = {
            let mut dm = self.disk_manager.lock();
            dm.allocate_page()?
        };

        let frame = &self.frames[frame_id.0];
        frame.page_mut().reset();
        frame.set_page_id(Some(page_id));
        frame.pin();

        {
            let mut pt = self.page_table.write();
            pt.insert(page_id, frame_id);
        }
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        let lock = frame.page_mut();
        Ok(PageWriteGuard::new(self, frame_id, page_id, lock))
    }

    /// Drop a page from the buffer pool without touching disk state.
    /// The page must not be pinned.
    pub fn forget_page(&self, page_id: PageId) -> Result<()> {
        let mut pt = self.page_table.write();

        let frame_id = match pt.get(&page_id) {
            Some(&fid) => fid,
            None => return Ok(()), // Not resident, nothing to do
        };

        let frame = &self.frames[frame_id.0];
        if frame.is_pinned() {
            return Err(Error::PagePinned(page_id.0));
        }

        pt.remove(&page_id);
        drop(pt);

        frame.set_page_id(None);
        frame.clear_dirty();

        {
            let mut replacer = self.replacer.lock();
            replacer.remove(frame_id);
        }
        {
            let mut fl = self.free_list.lock();
            fl.push(frame_id);
        }

        Ok(())
    }

    /// Free a page: drop it from the pool and return it to the disk
    /// free list. The caller must have released every reference to it
    /// (guards dropped, no sibling/parent links remaining).
    ///
    /// # Errors
    /// - `Error::PagePinned` if the page is still pinned
    pub fn free_page(&self, page_id: PageId) -> Result<()> {
        self.forget_page(page_id)?;
        let mut dm = self.disk_manager.lock();
        dm.deallocate_page(page_id)
    }

    /// Flush a specific page to disk if it's dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let frame_id = {
            let pt = self.page_table.read();
            match pt.get(&page_id) {
                Some(&fid) => fid,
                None => return Ok(()), // Not resident
            }
        };

        self.flush_frame(frame_id, page_id)
    }

    /// Flush all dirty pages to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let pages: Vec<(PageId, FrameId)> = {
            let pt = self.page_table.read();
            pt.iter().map(|(&pid, &fid)| (pid, fid)).collect()
        };

        for (page_id, frame_id) in pages {
            self.flush_frame(frame_id, page_id)?;
        }
        Ok(())
    }

    /// Get buffer pool statistics.
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }

    /// Get the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Get the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Get the number of pages resident in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.read().len()
    }

    /// Get the number of pages on the disk free list.
    pub fn free_disk_page_count(&self) -> usize {
        self.disk_manager.lock().free_page_count()
    }

    /// Get the number of pages in the underlying file (allocated + free).
    pub fn disk_page_count(&self) -> u32 {
        self.disk_manager.lock().page_count()
    }

    /// Unpin a page. Called by the guards on drop.
    pub(crate) fn unpin_page_internal(&self, frame_id: FrameId, is_dirty: bool) {
        let frame = &self.frames[frame_id.0];

        if is_dirty {
            frame.mark_dirty();
        }

        let new_pin_count = frame.unpin();
        if new_pin_count == 0 {
            let mut replacer = self.replacer.lock();
            replacer.set_evictable(frame_id, true);
        }
    }

    /// Fetch a page into the pool, returning its frame ID.
    fn fetch_page_internal(&self, page_id: PageId) -> Result<FrameId> {
        // Fast path: already resident (read lock only).
        {
            let pt = self.page_table.read();
            if let Some(&frame_id) = pt.get(&page_id) {
                self.handle_cache_hit(frame_id);
                return Ok(frame_id);
            }
        }

        self.handle_cache_miss(page_id)
    }

    fn handle_cache_hit(&self, frame_id: FrameId) {
        let frame = &self.frames[frame_id.0];
        frame.pin();

        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_cache_miss(&self, page_id: PageId) -> Result<FrameId> {
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let frame_id = self.get_free_frame()?;

        let page_data = {
            let mut dm = self.disk_manager.lock();
            dm.read_page(page_id)?
        };
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);

        let frame = &self.frames[frame_id.0];
        {
            let mut page = frame.page_mut();
            page.as_mut_slice().copy_from_slice(page_data.as_slice());
        }
        frame.set_page_id(Some(page_id));
        frame.pin();

        {
            let mut pt = self.page_table.write();
            pt.insert(page_id, frame_id);
        }
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        Ok(frame_id)
    }

    /// Get a free frame, evicting if necessary.
    fn get_free_frame(&self) -> Result<FrameId> {
        {
            let mut fl = self.free_list.lock();
            if let Some(frame_id) = fl.pop() {
                return Ok(frame_id);
            }
        }

        self.evict_page()
    }

    /// Evict a page and return its frame.
    fn evict_page(&self) -> Result<FrameId> {
        let frame_id = {
            let mut replacer = self.replacer.lock();
            replacer.evict().ok_or(Error::NoFreeFrames)?
        };

        self.stats.evictions.fetch_add(1, Ordering::Relaxed);

        let frame = &self.frames[frame_id.0];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            if let Some(pid) = old_page_id {
                self.flush_frame(frame_id, pid)?;
            }
        }

        if let Some(pid) = old_page_id {
            let mut pt = self.page_table.write();
            pt.remove(&pid);
        }

        frame.clear_dirty();
        frame.set_page_id(None);

        Ok(frame_id)
    }

    /// Flush a frame to disk if dirty.
    fn flush_frame(&self, frame_id: FrameId, page_id: PageId) -> Result<()> {
        let frame = &self.frames[frame_id.0];

        if frame.is_dirty() {
            let page = frame.page();
            {
                let mut dm = self.disk_manager.lock();
                dm.write_page(page_id, &page)?;
            }
            drop(page);

            frame.clear_dirty();
            self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_bpm(pool_size: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        (BufferPoolManager::new(pool_size, dm), dir)
    }

    #[test]
    fn new_page_allocates_sequential_ids() {
        let (bpm, _dir) = create_test_bpm(10);

        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(0));
        drop(guard);

        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(1));
    }

    #[test]
    fn write_then_read_back() {
        let (bpm, _dir) = create_test_bpm(10);

        {
            let mut guard = bpm.new_page().unwrap();
            guard.as_mut_slice()[0] = 0xAB;
        }
        {
            let mut guard = bpm.fetch_page_write(PageId::new(0)).unwrap();
            assert_eq!(guard.as_slice()[0], 0xAB);
            guard.as_mut_slice()[1] = 0xCD;
        }
        {
            let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
            assert_eq!(guard.as_slice()[0], 0xAB);
            assert_eq!(guard.as_slice()[1], 0xCD);
        }
    }

    #[test]
    fn eviction_flushes_dirty_pages() {
        let (bpm, _dir) = create_test_bpm(1); // single frame

        {
            let mut guard = bpm.new_page().unwrap();
            guard.as_mut_slice()[0] = 0x42;
        }
        {
            let _guard = bpm.new_page().unwrap(); // evicts page 0
        }
        {
            let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
            assert_eq!(guard.as_slice()[0], 0x42);
        }

        assert!(bpm.stats().snapshot().evictions >= 1);
    }

    #[test]
    fn free_page_recycles_on_disk() {
        let (bpm, _dir) = create_test_bpm(10);

        let pid = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };
        {
            let _guard = bpm.new_page().unwrap();
        }

        bpm.free_page(pid).unwrap();
        assert_eq!(bpm.free_disk_page_count(), 1);

        // The next allocation reuses the freed page id.
        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), pid);
        assert_eq!(guard.as_slice()[0], 0);
    }

    #[test]
    fn free_pinned_page_fails() {
        let (bpm, _dir) = create_test_bpm(10);

        let guard = bpm.new_page().unwrap();
        let pid = guard.page_id();

        assert!(matches!(bpm.free_page(pid), Err(Error::PagePinned(_))));
        drop(guard);
        bpm.free_page(pid).unwrap();
    }

    #[test]
    fn no_free_frames_when_all_pinned() {
        let (bpm, _dir) = create_test_bpm(2);

        let _g1 = bpm.new_page().unwrap();
        let _g2 = bpm.new_page().unwrap();

        assert!(bpm.new_page().is_err());
    }

    #[test]
    fn multiple_read_guards_allowed() {
        let (bpm, _dir) = create_test_bpm(10);

        {
            let _guard = bpm.new_page().unwrap();
        }

        let g1 = bpm.fetch_page_read(PageId::new(0)).unwrap();
        let g2 = bpm.fetch_page_read(PageId::new(0)).unwrap();
        assert_eq!(g1.page_id(), g2.page_id());
    }

    #[test]
    fn fetch_missing_page_fails() {
        let (bpm, _dir) = create_test_bpm(10);
        assert!(bpm.fetch_page_read(PageId::new(999)).is_err());
    }

    #[test]
    fn flush_all_pages_writes_dirty() {
        let (bpm, _dir) = create_test_bpm(10);

        for i in 0..5u8 {
            let mut guard = bpm.new_page().unwrap();
            guard.as_mut_slice()[0] = i;
        }

        bpm.flush_all_pages().unwrap();
        assert!(bpm.stats().snapshot().pages_written >= 5);
    }

    #[test]
    fn concurrent_readers() {
        use std::sync::Arc;
        use std::thread;

        let (bpm, _dir) = create_test_bpm(10);
        let bpm = Arc::new(bpm);

        {
            let mut guard = bpm.new_page().unwrap();
            guard.as_mut_slice()[0] = 0x42;
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bpm = Arc::clone(&bpm);
                thread::spawn(move || {
                    let guard = bpm.fetch_page_read(PageId::new(0)).unwrap();
                    assert_eq!(guard.as_slice()[0], 0x42);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
