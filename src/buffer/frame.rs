//! Frame - a slot in the buffer pool.
//!
//! A [`Frame`] holds a [`Page`] plus the metadata buffer management
//! needs: which page is loaded, a pin count, and a dirty flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::PageId;
use crate::storage::page::Page;

/// A frame in the buffer pool.
///
/// The pool has a fixed number of frames allocated at startup; each can
/// hold one page. All fields use interior mutability so frames can be
/// shared across threads without an outer lock:
/// - `page`: `RwLock` for read/write synchronization
/// - `page_id`: `Mutex` for safe updates
/// - `pin_count`, `is_dirty`: lock-free atomics
pub struct Frame {
    page: RwLock<Page>,
    page_id: Mutex<Option<PageId>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    /// Create a new empty frame.
    pub fn new() -> Self {
        Self {
            page: RwLock::new(Page::new()),
            page_id: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Acquire read lock on the page.
    #[inline]
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Acquire write lock on the page.
    #[inline]
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Get the page ID of the loaded page.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        *self.page_id.lock()
    }

    /// Set the page ID.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        *self.page_id.lock() = page_id;
    }

    /// Increment the pin count. Returns the new pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if the pin count is already 0.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    /// Get the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    /// Check if the frame is currently pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Mark the frame as dirty (modified).
    #[inline]
    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Relaxed);
    }

    /// Clear the dirty flag.
    #[inline]
    pub fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Relaxed);
    }

    /// Check if the frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Relaxed)
    }

    /// Check if the frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id().is_none()
    }

    /// Check if the frame can be evicted.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        self.page_id().is_some() && !self.is_pinned()
    }

    /// Reset the frame to its empty state, ready for reuse.
    pub fn reset(&self) {
        self.page_mut().reset();
        self.set_page_id(None);
        self.pin_count.store(0, Ordering::Relaxed);
        self.is_dirty.store(false, Ordering::Relaxed);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_is_empty() {
        let frame = Frame::new();
        assert!(frame.is_empty());
        assert!(!frame.is_pinned());
        assert!(!frame.is_dirty());
        assert_eq!(frame.page_id(), None);
    }

    #[test]
    fn pin_unpin() {
        let frame = Frame::new();

        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin(), 2);
        assert_eq!(frame.unpin(), 1);
        assert!(frame.is_pinned());
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());
    }

    #[test]
    #[should_panic(expected = "pin count underflow")]
    fn unpin_underflow_panics() {
        Frame::new().unpin();
    }

    #[test]
    fn dirty_flag() {
        let frame = Frame::new();
        frame.mark_dirty();
        assert!(frame.is_dirty());
        frame.clear_dirty();
        assert!(!frame.is_dirty());
    }

    #[test]
    fn evictability() {
        let frame = Frame::new();
        assert!(!frame.is_evictable());

        frame.set_page_id(Some(PageId::new(1)));
        assert!(frame.is_evictable());

        frame.pin();
        assert!(!frame.is_evictable());

        frame.unpin();
        assert!(frame.is_evictable());
    }

    #[test]
    fn reset_clears_everything() {
        let frame = Frame::new();
        frame.set_page_id(Some(PageId::new(99)));
        frame.pin();
        frame.mark_dirty();
        frame.page_mut().as_mut_slice()[100] = 0xFF;

        frame.reset();

        assert!(frame.is_empty());
        assert!(!frame.is_pinned());
        assert!(!frame.is_dirty());
        assert_eq!(frame.page().as_slice()[100], 0);
    }

    #[test]
    fn concurrent_pins() {
        use std::sync::Arc;
        use std::thread;

        let frame = Arc::new(Frame::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let frame = Arc::clone(&frame);
                thread::spawn(move || {
                    for _ in 0..100 {
                        frame.pin();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(frame.pin_count(), 800);
    }
}
