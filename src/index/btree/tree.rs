//! The B+Tree index file.
//!
//! A [`BTree`] is a named, disk-backed index mapping keys to
//! [`RecordId`] locators. Keys live in sorted leaf pages linked into a
//! chain; internal pages route by separator keys. All page access goes
//! through the buffer pool with short-lived guards: a guard is acquired
//! for one step of a descent or one maintenance action and released
//! before the next page is touched, so the tree never holds more than a
//! handful of pins at once.
//!
//! # Concurrency
//! Reads may run concurrently. Mutating operations (`insert`, `delete`,
//! `destroy`) assume a single writer; callers serialize them.
//!
//! # Trace stream
//! An optional line-oriented trace sink records structural events for
//! debugging and grading harnesses: `INSERT p s k`, `DELETE p s k`,
//! `DO`, `SEARCH`, `VISIT node N`, `PUTIN node N`,
//! `SPLIT node A IN nodes A B`, `ROOTSPLIT IN nodes A B`, `NEWROOT N`,
//! `MERGE nodes A B`, `TAKEFROM node N`, `DONE`. Trace writes are
//! best-effort; a failing sink never fails the operation.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageWriteGuard};
use crate::common::{Error, PageId, RecordId, Result};
use crate::storage::Catalog;

use super::header::{DeletePolicy, TreeHeader};
use super::key::{Key, KeyType};
use super::node::{below_min_occupancy, entry_cost, NodeKind, NodeMut, NodeRef, NODE_CAPACITY, SLOT_SIZE};
use super::scan::TreeScan;

/// Largest `max_key_size` a tree can be created with. An entry with a
/// maximum-size key must fit into half a node, or splits and
/// redistribution could not restore balance.
pub const MAX_KEY_SIZE: usize = NODE_CAPACITY / 2 - SLOT_SIZE;

/// A disk-backed B+Tree index.
pub struct BTree {
    bpm: Arc<BufferPoolManager>,
    name: String,
    header_page: PageId,
    key_type: KeyType,
    delete_policy: DeletePolicy,
    max_key_size: u16,
    // Interior mutability so trace lines can be written while page
    // guards borrow the tree.
    trace: RefCell<Option<Box<dyn Write + Send>>>,
}

impl BTree {
    /// Create a new, empty tree and register it in the file's catalog.
    ///
    /// # Errors
    /// - `Error::FileExists` if the name is already registered
    /// - `Error::KeyTooLong` if `max_key_size` exceeds [`MAX_KEY_SIZE`]
    pub fn create(
        bpm: Arc<BufferPoolManager>,
        name: &str,
        key_type: KeyType,
        max_key_size: u16,
        delete_policy: DeletePolicy,
    ) -> Result<Self> {
        if max_key_size as usize > MAX_KEY_SIZE {
            return Err(Error::KeyTooLong {
                len: max_key_size as usize,
                max: MAX_KEY_SIZE,
            });
        }

        let catalog = Catalog::open(Arc::clone(&bpm))?;
        if catalog.lookup(name)?.is_some() {
            return Err(Error::FileExists(name.to_string()));
        }

        let header_page = {
            let mut guard = bpm.new_page()?;
            TreeHeader::new(key_type, delete_policy, max_key_size).write_to(&mut guard);
            guard.page_id()
        };
        catalog.register(name, header_page)?;

        Ok(Self {
            bpm,
            name: name.to_string(),
            header_page,
            key_type,
            delete_policy,
            max_key_size,
            trace: RefCell::new(None),
        })
    }

    /// Open an existing tree by name.
    ///
    /// # Errors
    /// - `Error::FileNotFound` if the name is not in the catalog
    /// - `Error::Corrupted` if the registered page is not a tree header
    pub fn open(bpm: Arc<BufferPoolManager>, name: &str) -> Result<Self> {
        let catalog = Catalog::open(Arc::clone(&bpm))?;
        let header_page = catalog
            .lookup(name)?
            .ok_or_else(|| Error::FileNotFound(name.to_string()))?;

        let header = {
            let guard = bpm.fetch_page_read(header_page)?;
            TreeHeader::from_page(header_page, &guard)?
        };

        Ok(Self {
            bpm,
            name: name.to_string(),
            header_page,
            key_type: header.key_type,
            delete_policy: header.delete_policy,
            max_key_size: header.max_key_size,
            trace: RefCell::new(None),
        })
    }

    /// Close the tree, flushing its header page. Node pages reach disk
    /// through the buffer pool's normal flushing; dropping the handle
    /// without closing loses nothing but the guaranteed header write.
    pub fn close(self) -> Result<()> {
        self.bpm.flush_page(self.header_page)
    }

    /// Delete the tree: free every node, the header page, and the
    /// catalog entry.
    pub fn destroy(self) -> Result<()> {
        let root = self.root()?;
        if root.is_valid() {
            self.free_subtree(root)?;
        }
        self.bpm.free_page(self.header_page)?;
        Catalog::open(Arc::clone(&self.bpm))?.unregister(&self.name)?;
        Ok(())
    }

    /// The tree's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key type fixed at creation.
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// The delete policy fixed at creation.
    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    /// Whether the tree has no entries at all.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(!self.root()?.is_valid())
    }

    /// Number of levels, counting the root and the leaves. Zero for an
    /// empty tree.
    pub fn height(&self) -> Result<usize> {
        let mut height = 0;
        let mut page_id = self.root()?;
        while page_id.is_valid() {
            height += 1;
            let guard = self.bpm.fetch_page_read(page_id)?;
            let node = NodeRef::new(page_id, &guard)?;
            page_id = match node.kind() {
                NodeKind::Leaf => PageId::INVALID,
                NodeKind::Internal => node.prev(),
            };
        }
        Ok(height)
    }

    /// Attach a trace sink. See the module docs for the line protocol.
    pub fn set_trace(&mut self, sink: Box<dyn Write + Send>) {
        *self.trace.get_mut() = Some(sink);
    }

    /// Detach and return the trace sink, if any.
    pub fn clear_trace(&mut self) -> Option<Box<dyn Write + Send>> {
        self.trace.get_mut().take()
    }

    // ------------------------------------------------------------------
    // Insert

    /// Insert a `(key, rid)` entry. Duplicate keys are allowed; the pair
    /// itself may also be inserted more than once.
    ///
    /// # Errors
    /// - `Error::KeyTypeMismatch` if the key's type is wrong
    /// - `Error::KeyTooLong` if the encoded key exceeds the tree maximum
    pub fn insert(&self, key: &Key, rid: RecordId) -> Result<()> {
        self.validate_key(key)?;
        self.trace_line(format_args!("INSERT {} {} {key}", rid.page_no, rid.slot_no));
        self.trace_line(format_args!("DO"));

        let root = self.root()?;
        if !root.is_valid() {
            // First entry: the root is a single leaf.
            let root_id = {
                let mut guard = self.bpm.new_page()?;
                let page_id = guard.page_id();
                self.trace_line(format_args!("NEWROOT {}", page_id.0));
                let mut node = NodeMut::init(page_id, &mut guard, NodeKind::Leaf);
                node.insert_leaf_entry(key, self.key_type, rid)?;
                self.trace_line(format_args!("PUTIN node {}", page_id.0));
                page_id
            };
            self.set_root(root_id)?;
        } else {
            self.trace_line(format_args!("SEARCH"));
            if let Some((sep, right_id)) = self.insert_rec(root, key, rid)? {
                // The old root split; grow the tree by one level.
                let new_root = {
                    let mut guard = self.bpm.new_page()?;
                    let page_id = guard.page_id();
                    self.trace_line(format_args!("NEWROOT {}", page_id.0));
                    let mut node = NodeMut::init(page_id, &mut guard, NodeKind::Internal);
                    node.set_prev(root);
                    node.insert_index_entry(&sep, self.key_type, right_id)?;
                    page_id
                };
                self.set_root(new_root)?;
            }
        }

        self.trace_line(format_args!("DONE"));
        Ok(())
    }

    /// Recursive insert. Returns the `(separator, new right page)` pair
    /// when this level split, for the caller to post into the parent.
    fn insert_rec(&self, page_id: PageId, key: &Key, rid: RecordId) -> Result<Option<(Key, PageId)>> {
        self.trace_line(format_args!("VISIT node {}", page_id.0));

        // Probe the node read-only; the guard is released before any
        // write fetch or descent.
        let (kind, child) = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            let node = NodeRef::new(page_id, &guard)?;
            match node.kind() {
                NodeKind::Leaf => (NodeKind::Leaf, PageId::INVALID),
                NodeKind::Internal => (NodeKind::Internal, node.route(key, self.key_type)?),
            }
        };

        match kind {
            NodeKind::Leaf => {
                let mut guard = self.bpm.fetch_page_write(page_id)?;
                let fits = NodeRef::new(page_id, &guard)?.fits(key.encoded_len());
                if fits {
                    let mut node = NodeMut::new(page_id, &mut guard)?;
                    node.insert_leaf_entry(key, self.key_type, rid)?;
                    self.trace_line(format_args!("PUTIN node {}", page_id.0));
                    Ok(None)
                } else {
                    Ok(Some(self.split_leaf(page_id, &mut guard, key, rid)?))
                }
            }
            NodeKind::Internal => {
                let split = self.insert_rec(child, key, rid)?;
                let Some((sep, new_child)) = split else {
                    return Ok(None);
                };

                let mut guard = self.bpm.fetch_page_write(page_id)?;
                let fits = NodeRef::new(page_id, &guard)?.fits(sep.encoded_len());
                if fits {
                    let mut node = NodeMut::new(page_id, &mut guard)?;
                    node.insert_index_entry(&sep, self.key_type, new_child)?;
                    self.trace_line(format_args!("PUTIN node {}", page_id.0));
                    Ok(None)
                } else {
                    Ok(Some(self.split_internal(page_id, &mut guard, &sep, new_child)?))
                }
            }
        }
    }

    /// Split a full leaf while inserting `(key, rid)`. Returns the
    /// separator (a copy of the right page's first key) and the new
    /// right page.
    fn split_leaf(
        &self,
        cur_id: PageId,
        cur_guard: &mut PageWriteGuard<'_>,
        key: &Key,
        rid: RecordId,
    ) -> Result<(Key, PageId)> {
        let kt = self.key_type;
        let mut right_guard = self.bpm.new_page()?;
        let right_id = right_guard.page_id();
        self.trace_split(cur_id, right_id)?;

        let (sep, old_next) = {
            let mut cur = NodeMut::new(cur_id, cur_guard)?;
            let mut right = NodeMut::init(right_id, &mut right_guard, NodeKind::Leaf);

            self.distribute(&mut cur, &mut right, key)?;

            // Splice the new page into the sibling chain. The old right
            // neighbour's back-link is fixed after the guards drop.
            let old_next = cur.next();
            right.set_next(old_next);
            right.set_prev(cur_id);
            cur.set_next(right_id);

            // The new entry goes to whichever half owns its key range.
            if *key < right.key_at(0, kt)? {
                cur.insert_leaf_entry(key, kt, rid)?;
                self.trace_line(format_args!("PUTIN node {}", cur_id.0));
            } else {
                right.insert_leaf_entry(key, kt, rid)?;
                self.trace_line(format_args!("PUTIN node {}", right_id.0));
            }

            (right.key_at(0, kt)?, old_next)
        };

        drop(right_guard);
        if old_next.is_valid() {
            let mut guard = self.bpm.fetch_page_write(old_next)?;
            NodeMut::new(old_next, &mut guard)?.set_prev(right_id);
        }

        Ok((sep, right_id))
    }

    /// Split a full internal node while posting `(sep, new_child)`.
    /// The right page's first entry is pushed up: its key becomes the
    /// returned separator and its child becomes the right page's
    /// leftmost link.
    fn split_internal(
        &self,
        cur_id: PageId,
        cur_guard: &mut PageWriteGuard<'_>,
        sep: &Key,
        new_child: PageId,
    ) -> Result<(Key, PageId)> {
        let kt = self.key_type;
        let mut right_guard = self.bpm.new_page()?;
        let right_id = right_guard.page_id();
        self.trace_split(cur_id, right_id)?;

        let pushed = {
            let mut cur = NodeMut::new(cur_id, cur_guard)?;
            let mut right = NodeMut::init(right_id, &mut right_guard, NodeKind::Internal);

            self.distribute(&mut cur, &mut right, sep)?;

            if *sep < right.key_at(0, kt)? {
                cur.insert_index_entry(sep, kt, new_child)?;
            } else {
                right.insert_index_entry(sep, kt, new_child)?;
            }

            // Push up instead of copy up: the right page's first entry
            // moves into the parent, its child becoming the leftmost
            // link of the right page.
            let pushed = right.key_at(0, kt)?;
            let leftmost = right.child_at(0);
            right.set_prev(leftmost);
            right.delete_at(0);
            pushed
        };

        Ok((pushed, right_id))
    }

    /// Rebalance the contents of a full node across itself and a fresh
    /// right sibling: move everything right, then move entries back
    /// until the halves are even, nudging the boundary so the pending
    /// `key` lands on the emptier side.
    fn distribute(&self, cur: &mut NodeMut<'_>, right: &mut NodeMut<'_>, key: &Key) -> Result<()> {
        let kt = self.key_type;

        while cur.slot_count() > 0 {
            let key_bytes = cur.key_bytes_at(0).to_vec();
            let payload = cur.payload_at(0);
            right.insert_at(right.slot_count(), &key_bytes, &payload)?;
            cur.delete_at(0);
        }

        while cur.available_space() > right.available_space() {
            let key_bytes = right.key_bytes_at(0).to_vec();
            let payload = right.payload_at(0);
            cur.insert_at(cur.slot_count(), &key_bytes, &payload)?;
            right.delete_at(0);
        }

        // The loop may overshoot by one entry; undo the last move when
        // the pending key belongs on the left anyway.
        if cur.available_space() < right.available_space() {
            let last = cur.slot_count() - 1;
            if *key < cur.key_at(last, kt)? {
                let key_bytes = cur.key_bytes_at(last).to_vec();
                let payload = cur.payload_at(last);
                right.insert_at(0, &key_bytes, &payload)?;
                cur.delete_at(last);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search and scan

    /// Look up the first entry with exactly this key (the start of its
    /// duplicate run). Returns `None` if the key is absent.
    pub fn search(&self, key: &Key) -> Result<Option<RecordId>> {
        self.validate_key(key)?;
        self.trace_line(format_args!("SEARCH"));

        let Some((page_id, slot)) = self.find_run_start(Some(key))? else {
            return Ok(None);
        };

        let guard = self.bpm.fetch_page_read(page_id)?;
        let node = NodeRef::new(page_id, &guard)?;
        if node.key_at(slot, self.key_type)? == *key {
            Ok(Some(node.rid_at(slot)))
        } else {
            Ok(None)
        }
    }

    /// Open a forward scan over `[lo, hi]` (both bounds inclusive and
    /// optional; `None` means unbounded on that side).
    pub fn scan(&self, lo: Option<&Key>, hi: Option<&Key>) -> Result<TreeScan<'_>> {
        if let Some(lo) = lo {
            self.validate_key(lo)?;
        }
        if let Some(hi) = hi {
            self.validate_key(hi)?;
        }
        self.trace_line(format_args!("SEARCH"));

        let start = self.find_run_start(lo)?;
        TreeScan::new(&self.bpm, self.key_type, hi.cloned(), start)
    }

    /// Descend to the first leaf entry with key `>= key` (or the first
    /// entry of the tree when `key` is `None`), skipping empty leaves.
    /// Returns `None` when no such entry exists.
    ///
    /// The descent routes left of every separator equal to `key`, so it
    /// lands at or before the start of a duplicate run; the forward walk
    /// then advances past smaller keys and over any leaves that naive
    /// deletes have emptied.
    fn find_run_start(&self, key: Option<&Key>) -> Result<Option<(PageId, usize)>> {
        let mut page_id = self.root()?;
        if !page_id.is_valid() {
            return Ok(None);
        }

        // Descend to the leaf level.
        loop {
            self.trace_line(format_args!("VISIT node {}", page_id.0));
            let next = {
                let guard = self.bpm.fetch_page_read(page_id)?;
                let node = NodeRef::new(page_id, &guard)?;
                match node.kind() {
                    NodeKind::Leaf => break,
                    NodeKind::Internal => match key {
                        Some(key) => node.route_leftmost(key, self.key_type)?,
                        None => node.prev(),
                    },
                }
            };
            page_id = next;
        }

        // Walk right past empty leaves, past-the-end positions, and
        // keys still below the bound.
        let slot;
        loop {
            let (lb, count, next) = {
                let guard = self.bpm.fetch_page_read(page_id)?;
                let node = NodeRef::new(page_id, &guard)?;
                let lb = match key {
                    Some(key) => node.lower_bound(key, self.key_type)?,
                    None => 0,
                };
                (lb, node.slot_count(), node.next())
            };
            if lb < count {
                slot = lb;
                break;
            }
            if !next.is_valid() {
                return Ok(None);
            }
            page_id = next;
        }

        Ok(Some((page_id, slot)))
    }

    // ------------------------------------------------------------------
    // Delete

    /// Delete the `(key, rid)` entry. Returns whether it was found.
    ///
    /// Under [`DeletePolicy::Naive`] the entry is removed and nothing
    /// else happens. Under [`DeletePolicy::Full`] pages that fall below
    /// half occupancy are refilled from a sibling or merged, and empty
    /// roots collapse the tree.
    pub fn delete(&self, key: &Key, rid: RecordId) -> Result<bool> {
        self.validate_key(key)?;
        self.trace_line(format_args!("DELETE {} {} {key}", rid.page_no, rid.slot_no));
        self.trace_line(format_args!("DO"));
        self.trace_line(format_args!("SEARCH"));

        let deleted = match self.delete_policy {
            DeletePolicy::Naive => self.naive_delete(key, rid)?,
            DeletePolicy::Full => self.full_delete(key, rid)?,
        };

        if deleted {
            self.trace_line(format_args!("DONE"));
        }
        Ok(deleted)
    }

    /// Remove the entry without restoring occupancy. The duplicate run
    /// may span several leaves; each is probed in turn.
    fn naive_delete(&self, key: &Key, rid: RecordId) -> Result<bool> {
        let kt = self.key_type;
        let Some((mut page_id, mut slot)) = self.find_run_start(Some(key))? else {
            return Ok(false);
        };

        loop {
            let (found, next) = {
                let guard = self.bpm.fetch_page_read(page_id)?;
                let node = NodeRef::new(page_id, &guard)?;
                let mut found = None;
                let mut i = slot;
                while i < node.slot_count() {
                    let k = node.key_at(i, kt)?;
                    if k > *key {
                        // Walked past the run without a match.
                        return Ok(false);
                    }
                    if k == *key && node.rid_at(i) == rid {
                        found = Some(i);
                        break;
                    }
                    i += 1;
                }
                (found, node.next())
            };

            if let Some(i) = found {
                // Single writer: the probed slot is still in place.
                let mut guard = self.bpm.fetch_page_write(page_id)?;
                let mut node = NodeMut::new(page_id, &mut guard)?;
                node.delete_at(i);
                self.trace_line(format_args!("TAKEFROM node {}", page_id.0));
                return Ok(true);
            }
            if !next.is_valid() {
                return Ok(false);
            }
            page_id = next;
            slot = 0;
        }
    }

    /// Remove the entry and restore the minimum-occupancy invariant,
    /// propagating merges toward the root.
    fn full_delete(&self, key: &Key, rid: RecordId) -> Result<bool> {
        let root = self.root()?;
        if !root.is_valid() {
            return Ok(false);
        }
        match self.delete_rec(root, key, rid, None) {
            Ok(_) => Ok(true),
            // The descent path did not contain the pair.
            Err(Error::EntryVanished) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Recursive full delete. When this level merged two of its
    /// children, returns the merge key the parent must remove along
    /// with the freed child page that disambiguates equal separators.
    fn delete_rec(
        &self,
        page_id: PageId,
        key: &Key,
        rid: RecordId,
        parent: Option<PageId>,
    ) -> Result<Option<(Key, PageId)>> {
        self.trace_line(format_args!("VISIT node {}", page_id.0));

        let (kind, child) = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            let node = NodeRef::new(page_id, &guard)?;
            match node.kind() {
                NodeKind::Leaf => (NodeKind::Leaf, PageId::INVALID),
                NodeKind::Internal => (NodeKind::Internal, node.route(key, self.key_type)?),
            }
        };

        match kind {
            NodeKind::Leaf => self.delete_from_leaf(page_id, key, rid, parent),
            NodeKind::Internal => {
                let merged = self.delete_rec(child, key, rid, Some(page_id))?;
                let Some((merge_key, freed_child)) = merged else {
                    return Ok(None);
                };

                // Two children merged below; remove their separator.
                // The separator may be a stale promoted copy, so match
                // the largest entry at or below the merge key. Among
                // equal keys, prefer the one that pointed at the page
                // the merge freed.
                let underfull = {
                    let mut guard = self.bpm.fetch_page_write(page_id)?;
                    let mut node = NodeMut::new(page_id, &mut guard)?;
                    let ub = node.upper_bound(&merge_key, self.key_type)?;
                    if ub == 0 {
                        return Err(Error::corrupted(page_id, "separator for merged child missing"));
                    }
                    let mut idx = ub - 1;
                    let mut i = ub;
                    while i > 0 {
                        i -= 1;
                        if node.key_at(i, self.key_type)? != merge_key {
                            break;
                        }
                        if node.child_at(i) == freed_child {
                            idx = i;
                            break;
                        }
                    }
                    node.delete_at(idx);
                    node.is_underfull()
                };

                match parent {
                    None => {
                        self.collapse_root_if_empty(page_id)?;
                        Ok(None)
                    }
                    Some(parent_id) if underfull => self.rebalance(page_id, parent_id, key),
                    Some(_) => Ok(None),
                }
            }
        }
    }

    /// Delete `(key, rid)` from a leaf and restore occupancy.
    fn delete_from_leaf(
        &self,
        page_id: PageId,
        key: &Key,
        rid: RecordId,
        parent: Option<PageId>,
    ) -> Result<Option<(Key, PageId)>> {
        let kt = self.key_type;

        let (empty, underfull) = {
            let mut guard = self.bpm.fetch_page_write(page_id)?;
            let mut node = NodeMut::new(page_id, &mut guard)?;

            let mut i = node.lower_bound(key, kt)?;
            let mut found = false;
            while i < node.slot_count() {
                if node.key_at(i, kt)? > *key {
                    break;
                }
                if node.rid_at(i) == rid {
                    node.delete_at(i);
                    found = true;
                    break;
                }
                i += 1;
            }
            if !found {
                return Err(Error::EntryVanished);
            }
            self.trace_line(format_args!("TAKEFROM node {}", page_id.0));
            (node.is_empty(), node.is_underfull())
        };

        match parent {
            None => {
                // A root leaf tolerates any occupancy; an empty one
                // shrinks the tree to nothing.
                if empty {
                    self.bpm.free_page(page_id)?;
                    self.set_root(PageId::INVALID)?;
                }
                Ok(None)
            }
            Some(parent_id) if underfull => self.rebalance(page_id, parent_id, key),
            Some(_) => Ok(None),
        }
    }

    /// An empty internal root hands the tree to its only child.
    fn collapse_root_if_empty(&self, root_id: PageId) -> Result<()> {
        let remaining = {
            let guard = self.bpm.fetch_page_read(root_id)?;
            let node = NodeRef::new(root_id, &guard)?;
            if node.is_empty() {
                Some(node.prev())
            } else {
                None
            }
        };
        if let Some(new_root) = remaining {
            self.bpm.free_page(root_id)?;
            self.set_root(new_root)?;
        }
        Ok(())
    }

    /// Refill an underfull node from a sibling, or merge the two when
    /// their combined contents fit in one page. Prefers the left
    /// sibling. Returns the merge key the parent must delete, if any.
    fn rebalance(
        &self,
        page_id: PageId,
        parent_id: PageId,
        key: &Key,
    ) -> Result<Option<(Key, PageId)>> {
        let kt = self.key_type;

        // Locate the node's position among the parent's children.
        let (sibling_id, sep_idx, cur_is_right) = {
            let guard = self.bpm.fetch_page_read(parent_id)?;
            let parent = NodeRef::new(parent_id, &guard)?;
            let pos = parent.upper_bound(key, kt)?;
            if pos >= 1 {
                let sibling = if pos == 1 {
                    parent.prev()
                } else {
                    parent.child_at(pos - 2)
                };
                (sibling, pos - 1, true)
            } else if parent.slot_count() > 0 {
                (parent.child_at(0), 0, false)
            } else {
                // Only child; the underflow is tolerated until the
                // parent itself collapses.
                return Ok(None);
            }
        };

        if self.try_redistribute(page_id, sibling_id, parent_id, sep_idx, cur_is_right)? {
            self.trace_line(format_args!("TAKEFROM node {}", sibling_id.0));
            return Ok(None);
        }

        let (left_id, right_id) = if cur_is_right {
            (sibling_id, page_id)
        } else {
            (page_id, sibling_id)
        };

        if !self.merge_fits(left_id, right_id, parent_id, sep_idx)? {
            // Neither redistribution nor merge possible; leave the node
            // underfull.
            return Ok(None);
        }
        self.merge(left_id, right_id, parent_id, sep_idx).map(Some)
    }

    /// Whether `left` and `right` (plus the pulled-down separator, for
    /// internal nodes) fit into a single page.
    fn merge_fits(
        &self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        sep_idx: usize,
    ) -> Result<bool> {
        let left_guard = self.bpm.fetch_page_read(left_id)?;
        let left = NodeRef::new(left_id, &left_guard)?;
        let right_guard = self.bpm.fetch_page_read(right_id)?;
        let right = NodeRef::new(right_id, &right_guard)?;

        let mut needed = left.used_space() + right.used_space();
        if left.kind() == NodeKind::Internal {
            let parent_guard = self.bpm.fetch_page_read(parent_id)?;
            let parent = NodeRef::new(parent_id, &parent_guard)?;
            needed += entry_cost(parent.key_bytes_at(sep_idx).len());
        }
        Ok(needed <= NODE_CAPACITY)
    }

    /// Move everything from `right` into `left` and free `right`.
    /// Returns the separator key the parent must delete, paired with
    /// the freed page. For internal nodes the parent separator is
    /// first pulled down onto the right page's leftmost link.
    fn merge(
        &self,
        left_id: PageId,
        right_id: PageId,
        parent_id: PageId,
        sep_idx: usize,
    ) -> Result<(Key, PageId)> {
        let kt = self.key_type;

        let sep_key = {
            let guard = self.bpm.fetch_page_read(parent_id)?;
            NodeRef::new(parent_id, &guard)?.key_at(sep_idx, kt)?
        };

        let old_next = {
            let mut left_guard = self.bpm.fetch_page_write(left_id)?;
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            let mut left = NodeMut::new(left_id, &mut left_guard)?;
            let mut right = NodeMut::new(right_id, &mut right_guard)?;

            if left.kind() == NodeKind::Internal {
                left.insert_index_entry(&sep_key, kt, right.prev())?;
            }
            while right.slot_count() > 0 {
                let key_bytes = right.key_bytes_at(0).to_vec();
                let payload = right.payload_at(0);
                left.insert_at(left.slot_count(), &key_bytes, &payload)?;
                right.delete_at(0);
            }

            if left.kind() == NodeKind::Leaf {
                let old_next = right.next();
                left.set_next(old_next);
                old_next
            } else {
                PageId::INVALID
            }
        };

        if old_next.is_valid() {
            let mut guard = self.bpm.fetch_page_write(old_next)?;
            NodeMut::new(old_next, &mut guard)?.set_prev(left_id);
        }

        self.bpm.free_page(right_id)?;
        self.trace_line(format_args!("MERGE nodes {} {}", left_id.0, right_id.0));

        Ok((sep_key, right_id))
    }

    /// Move entries from the sibling into the underfull node until it
    /// is back above half occupancy, keeping the parent separator in
    /// step. Returns false (leaving any partial progress, which is
    /// still consistent) if the sibling cannot spare enough.
    fn try_redistribute(
        &self,
        cur_id: PageId,
        sibling_id: PageId,
        parent_id: PageId,
        sep_idx: usize,
        cur_is_right: bool,
    ) -> Result<bool> {
        let kt = self.key_type;

        let mut parent_guard = self.bpm.fetch_page_write(parent_id)?;
        let mut cur_guard = self.bpm.fetch_page_write(cur_id)?;
        let mut sibling_guard = self.bpm.fetch_page_write(sibling_id)?;
        let mut parent = NodeMut::new(parent_id, &mut parent_guard)?;
        let mut cur = NodeMut::new(cur_id, &mut cur_guard)?;
        let mut sibling = NodeMut::new(sibling_id, &mut sibling_guard)?;

        // Replacing the separator must never overflow the parent, no
        // matter which key ends up there.
        let sep_cost = entry_cost(parent.key_bytes_at(sep_idx).len());
        if parent.available_space() + sep_cost < entry_cost(self.max_key_size as usize) {
            return Ok(false);
        }

        let is_leaf = cur.kind() == NodeKind::Leaf;
        let mut sep_idx = sep_idx;
        let mut moved = false;

        while cur.is_underfull() && sibling.slot_count() > 0 {
            // The sibling must stay at or above half occupancy itself.
            let edge = if cur_is_right { sibling.slot_count() - 1 } else { 0 };
            let cost = entry_cost(sibling.key_bytes_at(edge).len());
            if below_min_occupancy(sibling.used_space() - cost) {
                break;
            }

            if is_leaf {
                let key_bytes = sibling.key_bytes_at(edge).to_vec();
                let payload = sibling.payload_at(edge);
                if cur_is_right {
                    cur.insert_at(0, &key_bytes, &payload)?;
                } else {
                    cur.insert_at(cur.slot_count(), &key_bytes, &payload)?;
                }
                sibling.delete_at(edge);
            } else if cur_is_right {
                // Rotate through the parent: the separator comes down in
                // front of the node's leftmost link, the sibling's last
                // child becomes the new leftmost link, and the sibling's
                // last key goes up as the new separator.
                let sep_key = parent.key_at(sep_idx, kt)?;
                let up_key = sibling.key_at(edge, kt)?;
                let up_child = sibling.child_at(edge);
                let old_leftmost = cur.prev();

                cur.insert_index_entry(&sep_key, kt, old_leftmost)?;
                cur.set_prev(up_child);
                sibling.delete_at(edge);

                parent.delete_at(sep_idx);
                parent.insert_index_entry(&up_key, kt, cur_id)?;
                // Sorted insert may not land at the old position when
                // the parent holds equal keys.
                sep_idx = parent.lower_bound(&up_key, kt)?;
            } else {
                // Mirror image: the separator comes down behind the
                // node's entries with the sibling's leftmost link, and
                // the sibling's first key goes up.
                let sep_key = parent.key_at(sep_idx, kt)?;
                let up_key = sibling.key_at(0, kt)?;
                let up_leftmost = sibling.child_at(0);
                let sibling_leftmost = sibling.prev();

                cur.insert_index_entry(&sep_key, kt, sibling_leftmost)?;
                sibling.set_prev(up_leftmost);
                sibling.delete_at(0);

                parent.delete_at(sep_idx);
                parent.insert_index_entry(&up_key, kt, sibling_id)?;
                sep_idx = parent.lower_bound(&up_key, kt)?;
            }
            moved = true;
        }

        if !moved {
            return Ok(false);
        }

        // Leaf moves bypass the parent, so its separator is refreshed
        // once at the end.
        if is_leaf {
            let (new_sep, right_child) = if cur_is_right {
                (cur.key_at(0, kt)?, cur_id)
            } else {
                (sibling.key_at(0, kt)?, sibling_id)
            };
            parent.delete_at(sep_idx);
            parent.insert_index_entry(&new_sep, kt, right_child)?;
        }

        Ok(!cur.is_underfull())
    }

    // ------------------------------------------------------------------
    // Header plumbing

    fn root(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page)?;
        Ok(TreeHeader::from_page(self.header_page, &guard)?.root)
    }

    fn set_root(&self, root: PageId) -> Result<()> {
        let mut guard = self.bpm.fetch_page_write(self.header_page)?;
        let header = TreeHeader {
            root,
            key_type: self.key_type,
            delete_policy: self.delete_policy,
            max_key_size: self.max_key_size,
        };
        header.write_to(&mut guard);
        Ok(())
    }

    fn free_subtree(&self, page_id: PageId) -> Result<()> {
        let children = {
            let guard = self.bpm.fetch_page_read(page_id)?;
            let node = NodeRef::new(page_id, &guard)?;
            match node.kind() {
                NodeKind::Leaf => Vec::new(),
                NodeKind::Internal => {
                    let mut children = vec![node.prev()];
                    for i in 0..node.slot_count() {
                        children.push(node.child_at(i));
                    }
                    children
                }
            }
        };
        for child in children {
            self.free_subtree(child)?;
        }
        self.bpm.free_page(page_id)
    }

    fn validate_key(&self, key: &Key) -> Result<()> {
        if key.key_type() != self.key_type {
            return Err(Error::KeyTypeMismatch);
        }
        let len = key.encoded_len();
        if len > self.max_key_size as usize {
            return Err(Error::KeyTooLong {
                len,
                max: self.max_key_size as usize,
            });
        }
        Ok(())
    }

    fn trace_line(&self, args: fmt::Arguments<'_>) {
        if let Some(sink) = self.trace.borrow_mut().as_mut() {
            let _ = sink.write_fmt(args);
            let _ = sink.write_all(b"\n");
        }
    }

    /// A root split announces itself differently in the trace stream.
    fn trace_split(&self, cur_id: PageId, right_id: PageId) -> Result<()> {
        if self.trace.borrow().is_none() {
            return Ok(());
        }
        if self.root()? == cur_id {
            self.trace_line(format_args!("ROOTSPLIT IN nodes {} {}", cur_id.0, right_id.0));
        } else {
            self.trace_line(format_args!(
                "SPLIT node {0} IN nodes {0} {1}",
                cur_id.0, right_id.0
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    fn create_tree(policy: DeletePolicy) -> (BTree, Arc<BufferPoolManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(64, dm));
        let tree = BTree::create(Arc::clone(&bpm), "t", KeyType::Int, 16, policy).unwrap();
        (tree, bpm, dir)
    }

    fn rid(n: u32) -> RecordId {
        RecordId::new(n, 0)
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let (_tree, bpm, _dir) = create_tree(DeletePolicy::Naive);
        assert!(matches!(
            BTree::create(bpm, "t", KeyType::Int, 16, DeletePolicy::Naive),
            Err(Error::FileExists(_))
        ));
    }

    #[test]
    fn create_rejects_oversized_max_key() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(10, dm));
        assert!(matches!(
            BTree::create(bpm, "t", KeyType::Str, u16::MAX, DeletePolicy::Naive),
            Err(Error::KeyTooLong { .. })
        ));
    }

    #[test]
    fn open_missing_name_fails() {
        let (_tree, bpm, _dir) = create_tree(DeletePolicy::Naive);
        assert!(matches!(
            BTree::open(bpm, "nope"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn key_validation() {
        let (tree, _bpm, _dir) = create_tree(DeletePolicy::Naive);

        assert!(matches!(
            tree.insert(&Key::from("wrong type"), rid(1)),
            Err(Error::KeyTypeMismatch)
        ));
        assert!(matches!(
            tree.search(&Key::from("wrong type")),
            Err(Error::KeyTypeMismatch)
        ));
    }

    #[test]
    fn oversized_key_rejected() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::create(dir.path().join("test.db")).unwrap();
        let bpm = Arc::new(BufferPoolManager::new(10, dm));
        let tree = BTree::create(bpm, "t", KeyType::Str, 8, DeletePolicy::Naive).unwrap();

        assert!(matches!(
            tree.insert(&Key::from("far too long a key"), rid(1)),
            Err(Error::KeyTooLong { .. })
        ));
    }

    #[test]
    fn empty_tree_behaviour() {
        let (tree, _bpm, _dir) = create_tree(DeletePolicy::Full);

        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.height().unwrap(), 0);
        assert_eq!(tree.search(&Key::Int(1)).unwrap(), None);
        assert!(!tree.delete(&Key::Int(1), rid(1)).unwrap());

        let mut scan = tree.scan(None, None).unwrap();
        assert_eq!(scan.next().unwrap(), None);
    }

    #[test]
    fn insert_then_search() {
        let (tree, _bpm, _dir) = create_tree(DeletePolicy::Naive);

        tree.insert(&Key::Int(5), rid(50)).unwrap();
        tree.insert(&Key::Int(3), rid(30)).unwrap();
        tree.insert(&Key::Int(7), rid(70)).unwrap();

        assert_eq!(tree.search(&Key::Int(3)).unwrap(), Some(rid(30)));
        assert_eq!(tree.search(&Key::Int(5)).unwrap(), Some(rid(50)));
        assert_eq!(tree.search(&Key::Int(4)).unwrap(), None);
        assert_eq!(tree.height().unwrap(), 1);
    }

    #[test]
    fn trace_emits_line_protocol() {
        use std::sync::Mutex;

        // A sink that shares its buffer with the test.
        #[derive(Clone)]
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (mut tree, _bpm, _dir) = create_tree(DeletePolicy::Naive);
        let buffer = Arc::new(Mutex::new(Vec::new()));
        tree.set_trace(Box::new(Sink(Arc::clone(&buffer))));

        tree.insert(&Key::Int(1), rid(9)).unwrap();
        tree.delete(&Key::Int(1), rid(9)).unwrap();

        let out = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "INSERT 9 0 1");
        assert_eq!(lines[1], "DO");
        // Page 0 is the catalog and page 1 the tree header, so the
        // first leaf lands on page 2.
        assert_eq!(lines[2], "NEWROOT 2");
        assert_eq!(lines[3], "PUTIN node 2");
        assert_eq!(lines[4], "DONE");
        assert!(lines.contains(&"DELETE 9 0 1"));
        assert!(lines.contains(&"TAKEFROM node 2"));
        assert_eq!(lines.last(), Some(&"DONE"));
    }

    /// A root split is announced as ROOTSPLIT, later splits as SPLIT.
    #[test]
    fn trace_distinguishes_root_splits() {
        use std::sync::Mutex;

        #[derive(Clone)]
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (mut tree, _bpm, _dir) = create_tree(DeletePolicy::Naive);
        let buffer = Arc::new(Mutex::new(Vec::new()));
        tree.set_trace(Box::new(Sink(Arc::clone(&buffer))));

        // Enough int entries to split the root leaf at least twice over.
        for v in 0..600 {
            tree.insert(&Key::Int(v), rid(v as u32)).unwrap();
        }

        let out = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let rootsplits = out.lines().filter(|l| l.starts_with("ROOTSPLIT IN nodes")).count();
        let splits = out.lines().filter(|l| l.starts_with("SPLIT node")).count();
        assert!(rootsplits >= 1);
        assert!(splits >= 1);
    }

    /// Record ids of each leaf in the chain holding `key`'s run,
    /// starting from the run-start leaf.
    fn rids_by_leaf(tree: &BTree, bpm: &BufferPoolManager, key: &Key) -> Vec<Vec<RecordId>> {
        let mut leaves = Vec::new();
        let Some((mut page_id, _)) = tree.find_run_start(Some(key)).unwrap() else {
            return leaves;
        };
        while page_id.is_valid() {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            let node = NodeRef::new(page_id, &guard).unwrap();
            leaves.push((0..node.slot_count()).map(|s| node.rid_at(s)).collect());
            page_id = node.next();
        }
        leaves
    }

    /// Emptying an interior leaf of a duplicate run must not strand the
    /// duplicates to its left: lookups, scans, and deletes still reach
    /// them through the run start.
    #[test]
    fn run_start_survives_emptied_interior_leaf() {
        let (tree, bpm, _dir) = create_tree(DeletePolicy::Naive);
        let key = Key::Int(25);
        let total = 600u32;
        for i in 0..total {
            tree.insert(&key, rid(i)).unwrap();
        }

        let leaves = rids_by_leaf(&tree, &bpm, &key);
        assert!(leaves.len() >= 3, "run should span several leaves");
        assert!(!leaves[0].is_empty());

        // Empty exactly the second leaf of the run.
        for &r in &leaves[1] {
            assert!(tree.delete(&key, r).unwrap());
        }
        let survivors = total as usize - leaves[1].len();

        // The first leaf's entries are still the start of the run.
        assert_eq!(tree.search(&key).unwrap(), Some(leaves[0][0]));

        let mut scan = tree.scan(Some(&key), Some(&key)).unwrap();
        let mut seen = 0;
        while scan.next().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, survivors);

        // Pairs left of the emptied leaf can still be deleted.
        assert!(tree.delete(&key, leaves[0][0]).unwrap());
        assert!(!tree.delete(&key, leaves[0][0]).unwrap());
    }

    /// Every tree page reachable from the root, except the root itself.
    fn non_root_pages(tree: &BTree, bpm: &BufferPoolManager) -> Vec<PageId> {
        let root = tree.root().unwrap();
        if !root.is_valid() {
            return Vec::new();
        }
        let mut pages = Vec::new();
        let mut stack = vec![root];
        while let Some(page_id) = stack.pop() {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            let node = NodeRef::new(page_id, &guard).unwrap();
            if page_id != root {
                pages.push(page_id);
            }
            if node.kind() == NodeKind::Internal {
                stack.push(node.prev());
                for i in 0..node.slot_count() {
                    stack.push(node.child_at(i));
                }
            }
        }
        pages
    }

    /// Full deletes must leave every non-root page at or above half
    /// occupancy, at every intermediate point of the workload.
    #[test]
    fn full_delete_maintains_min_occupancy() {
        let (tree, bpm, _dir) = create_tree(DeletePolicy::Full);
        for v in 0..800 {
            tree.insert(&Key::Int(v), rid(v as u32)).unwrap();
        }
        assert!(tree.height().unwrap() >= 2);

        for v in 0..700 {
            assert!(tree.delete(&Key::Int(v), rid(v as u32)).unwrap());
            if v % 100 == 99 {
                for page_id in non_root_pages(&tree, &bpm) {
                    let guard = bpm.fetch_page_read(page_id).unwrap();
                    let node = NodeRef::new(page_id, &guard).unwrap();
                    assert!(
                        !node.is_underfull(),
                        "page {page_id} underfull after deleting 0..={v}"
                    );
                }
            }
        }
    }
}
