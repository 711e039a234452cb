//! FIFO (First-In-First-Out) replacement policy.
//!
//! The simplest policy that works: evict pages in the order they
//! entered the pool, skipping pinned ones.

use std::collections::{HashSet, VecDeque};

use crate::common::FrameId;

/// A FIFO eviction policy.
pub struct FifoReplacer {
    /// Frame IDs in insertion order (front = oldest).
    queue: VecDeque<FrameId>,
    /// O(1) membership check for the queue.
    in_queue: HashSet<FrameId>,
    /// Frames whose pin count is currently 0.
    evictable: HashSet<FrameId>,
}

impl FifoReplacer {
    /// Create a new FIFO replacer.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            in_queue: HashSet::new(),
            evictable: HashSet::new(),
        }
    }

    /// Record that a frame was accessed. For FIFO this only enqueues
    /// frames not already present.
    pub fn record_access(&mut self, frame_id: FrameId) {
        if self.in_queue.insert(frame_id) {
            self.queue.push_back(frame_id);
        }
    }

    /// Mark a frame as evictable or not.
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if evictable {
            self.evictable.insert(frame_id);
        } else {
            self.evictable.remove(&frame_id);
        }
    }

    /// Select a victim: the oldest evictable frame, or None when every
    /// frame is pinned.
    pub fn evict(&mut self) -> Option<FrameId> {
        while let Some(frame_id) = self.queue.pop_front() {
            self.in_queue.remove(&frame_id);
            if self.evictable.remove(&frame_id) {
                return Some(frame_id);
            }
            // Pinned or removed frame, keep looking.
        }
        None
    }

    /// Remove a frame from the replacer entirely (page deleted).
    ///
    /// The queue entry is left behind; `evict` skips it cheaply rather
    /// than paying O(n) here.
    pub fn remove(&mut self, frame_id: FrameId) {
        self.in_queue.remove(&frame_id);
        self.evictable.remove(&frame_id);
    }

    /// Number of evictable frames.
    pub fn size(&self) -> usize {
        self.evictable.len()
    }
}

impl Default for FifoReplacer {
    fn default() -> Self {
        Self::new()
    }
}
