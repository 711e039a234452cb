//! Bounded forward scan over a tree's leaf chain.

use crate::buffer::{BufferPoolManager, PageReadGuard};
use crate::common::{PageId, RecordId, Result};

use super::key::{Key, KeyType};
use super::node::NodeRef;

/// A forward cursor over the entries of a tree, in key order.
///
/// Produced by [`BTree::scan`](super::BTree::scan). The cursor pins one
/// leaf page at a time; advancing past the last entry of a leaf releases
/// it and pins the next one in the sibling chain. Dropping the scan (or
/// calling [`close`](TreeScan::close)) releases the current leaf, so a
/// scan never outlives its pin.
///
/// Entries inserted or deleted behind the cursor are not revisited;
/// entries ahead of it are seen or skipped depending on timing, as with
/// any cursor over live data.
pub struct TreeScan<'a> {
    bpm: &'a BufferPoolManager,
    key_type: KeyType,
    hi: Option<Key>,
    leaf: Option<PageReadGuard<'a>>,
    slot: usize,
}

impl<'a> TreeScan<'a> {
    pub(super) fn new(
        bpm: &'a BufferPoolManager,
        key_type: KeyType,
        hi: Option<Key>,
        start: Option<(PageId, usize)>,
    ) -> Result<Self> {
        let (leaf, slot) = match start {
            Some((page_id, slot)) => (Some(bpm.fetch_page_read(page_id)?), slot),
            None => (None, 0),
        };
        Ok(Self {
            bpm,
            key_type,
            hi,
            leaf,
            slot,
        })
    }

    /// Advance to the next entry, or `None` when the scan is exhausted
    /// or the upper bound is passed.
    pub fn next(&mut self) -> Result<Option<(Key, RecordId)>> {
        loop {
            let guard = match &self.leaf {
                Some(guard) => guard,
                None => return Ok(None),
            };

            enum Step {
                Yield(Key, RecordId),
                Advance(PageId),
                End,
            }

            let step = {
                let node = NodeRef::new(guard.page_id(), guard)?;
                if self.slot >= node.slot_count() {
                    let next = node.next();
                    if next.is_valid() {
                        Step::Advance(next)
                    } else {
                        Step::End
                    }
                } else {
                    let key = node.key_at(self.slot, self.key_type)?;
                    match &self.hi {
                        Some(hi) if key > *hi => Step::End,
                        _ => Step::Yield(key, node.rid_at(self.slot)),
                    }
                }
            };

            match step {
                Step::Yield(key, rid) => {
                    self.slot += 1;
                    return Ok(Some((key, rid)));
                }
                Step::Advance(next) => {
                    self.leaf = None; // release before pinning the next leaf
                    self.leaf = Some(self.bpm.fetch_page_read(next)?);
                    self.slot = 0;
                }
                Step::End => {
                    self.leaf = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Release the current leaf and end the scan early.
    pub fn close(&mut self) {
        self.leaf = None;
    }
}
