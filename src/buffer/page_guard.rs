//! RAII guards for page access.
//!
//! All page access in the crate goes through these guards:
//! - [`PageReadGuard`] - shared read access (multiple allowed)
//! - [`PageWriteGuard`] - exclusive write access, auto-marks dirty
//!
//! Both unpin the page when dropped, so a page can never leak a pin on
//! an early return or error path.

use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageId};
use crate::storage::page::Page;

use super::buffer_pool_manager::BufferPoolManager;

/// Guard for read-only page access.
///
/// Multiple read guards may exist for the same page simultaneously.
pub struct PageReadGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    lock: RwLockReadGuard<'a, Page>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        lock: RwLockReadGuard<'a, Page>,
    ) -> Self {
        Self {
            bpm,
            frame_id,
            page_id,
            lock,
        }
    }

    /// Get the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Get the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        // Read access: not dirty
        self.bpm.unpin_page_internal(self.frame_id, false);
    }
}

/// Guard for exclusive write access to a page.
///
/// The page is marked dirty and unpinned when the guard drops; callers
/// never track dirtiness by hand.
pub struct PageWriteGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    lock: RwLockWriteGuard<'a, Page>,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        lock: RwLockWriteGuard<'a, Page>,
    ) -> Self {
        Self {
            bpm,
            frame_id,
            page_id,
            lock,
        }
    }

    /// Get the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Get the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.lock
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        // Write access: always dirty
        self.bpm.unpin_page_internal(self.frame_id, true);
    }
}
