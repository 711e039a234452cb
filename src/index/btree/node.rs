//! Tree node pages: a sorted slotted layout shared by leaves and
//! internal nodes.
//!
//! # Layout
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       13    common PageHeader (type distinguishes leaf/internal)
//! 13      2     slot_count
//! 15      2     free_ptr (start of the key heap)
//! 17      4     prev (leaf: left sibling; internal: leftmost child)
//! 21      4     next (leaf: right sibling)
//! 25      ...   slot array, growing up
//! ...     ...   key heap, growing down from the end of the page
//! ```
//!
//! Each slot is 12 bytes: key offset (u16), key length (u16), and an
//! 8-byte payload. Leaf payloads are [`RecordId`]s; internal payloads
//! hold a child [`PageId`] in their first 4 bytes. Slots stay sorted by
//! key; the key heap is unordered and compacted on delete.

use crate::common::config::{MIN_OCCUPANCY_PERCENT, PAGE_SIZE};
use crate::common::{Error, PageId, RecordId, Result};
use crate::storage::page::{Page, PageHeader, PageType};

use super::key::{Key, KeyType};

/// Byte offsets of the node fields following the common page header.
const OFFSET_SLOT_COUNT: usize = PageHeader::SIZE;
const OFFSET_FREE_PTR: usize = OFFSET_SLOT_COUNT + 2;
const OFFSET_PREV: usize = OFFSET_FREE_PTR + 2;
const OFFSET_NEXT: usize = OFFSET_PREV + 4;

/// First byte past the node header; the slot array starts here.
pub const NODE_HEADER_END: usize = OFFSET_NEXT + 4;

/// Bytes of one slot: key offset + key length + payload.
pub const SLOT_SIZE: usize = 4 + RecordId::SIZE;

/// Usable bytes per node (slot array plus key heap).
pub const NODE_CAPACITY: usize = PAGE_SIZE - NODE_HEADER_END;

/// Whether a node is a leaf or an internal (index) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Internal,
}

impl NodeKind {
    fn page_type(self) -> PageType {
        match self {
            NodeKind::Leaf => PageType::BTreeLeaf,
            NodeKind::Internal => PageType::BTreeInternal,
        }
    }

    fn from_page_type(page_type: PageType) -> Option<Self> {
        match page_type {
            PageType::BTreeLeaf => Some(NodeKind::Leaf),
            PageType::BTreeInternal => Some(NodeKind::Internal),
            _ => None,
        }
    }
}

/// Space an entry with a key of `key_len` bytes occupies in a node.
pub fn entry_cost(key_len: usize) -> usize {
    SLOT_SIZE + key_len
}

/// Whether a node holding `used` bytes of entries is below the minimum
/// occupancy the full delete policy maintains.
pub fn below_min_occupancy(used: usize) -> bool {
    used * 100 < NODE_CAPACITY * MIN_OCCUPANCY_PERCENT
}

/// Read-only view of a node page.
pub struct NodeRef<'a> {
    page_id: PageId,
    kind: NodeKind,
    data: &'a [u8],
}

/// Mutable view of a node page.
pub struct NodeMut<'a> {
    page_id: PageId,
    kind: NodeKind,
    data: &'a mut [u8],
}

// Raw field access shared by both views.

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn slot_offset(index: usize) -> usize {
    NODE_HEADER_END + index * SLOT_SIZE
}

macro_rules! node_read_impl {
    ($view:ident) => {
        impl<'a> $view<'a> {
            /// The page this view is over.
            #[inline]
            pub fn page_id(&self) -> PageId {
                self.page_id
            }

            /// Whether this node is a leaf or an internal node.
            #[inline]
            pub fn kind(&self) -> NodeKind {
                self.kind
            }

            /// Number of entries in the node.
            #[inline]
            pub fn slot_count(&self) -> usize {
                read_u16(self.data, OFFSET_SLOT_COUNT) as usize
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.slot_count() == 0
            }

            /// Left sibling for leaves; leftmost child for internal nodes.
            #[inline]
            pub fn prev(&self) -> PageId {
                PageId::new(read_u32(self.data, OFFSET_PREV))
            }

            /// Right sibling for leaves.
            #[inline]
            pub fn next(&self) -> PageId {
                PageId::new(read_u32(self.data, OFFSET_NEXT))
            }

            fn free_ptr(&self) -> usize {
                read_u16(self.data, OFFSET_FREE_PTR) as usize
            }

            /// Bytes occupied by entries (slots plus key bytes).
            pub fn used_space(&self) -> usize {
                self.slot_count() * SLOT_SIZE + (PAGE_SIZE - self.free_ptr())
            }

            /// Bytes still available for new entries.
            pub fn available_space(&self) -> usize {
                NODE_CAPACITY - self.used_space()
            }

            /// Whether the node is below the minimum occupancy threshold.
            pub fn is_underfull(&self) -> bool {
                below_min_occupancy(self.used_space())
            }

            /// Whether an entry with a key of `key_len` bytes fits.
            pub fn fits(&self, key_len: usize) -> bool {
                self.available_space() >= entry_cost(key_len)
            }

            /// Raw key bytes of the entry at `index`.
            ///
            /// # Panics
            /// Panics if `index` is out of bounds.
            pub fn key_bytes_at(&self, index: usize) -> &[u8] {
                assert!(index < self.slot_count(), "slot index out of bounds");
                let slot = slot_offset(index);
                let key_off = read_u16(self.data, slot) as usize;
                let key_len = read_u16(self.data, slot + 2) as usize;
                &self.data[key_off..key_off + key_len]
            }

            /// Decoded key of the entry at `index`.
            pub fn key_at(&self, index: usize, key_type: KeyType) -> Result<Key> {
                Key::decode(key_type, self.key_bytes_at(index)).map_err(|_| {
                    Error::corrupted(self.page_id, "undecodable key bytes in node")
                })
            }

            /// Raw 8-byte payload of the entry at `index`.
            pub fn payload_at(&self, index: usize) -> [u8; RecordId::SIZE] {
                assert!(index < self.slot_count(), "slot index out of bounds");
                let slot = slot_offset(index);
                let mut out = [0u8; RecordId::SIZE];
                out.copy_from_slice(&self.data[slot + 4..slot + 4 + RecordId::SIZE]);
                out
            }

            /// Record locator of the leaf entry at `index`.
            pub fn rid_at(&self, index: usize) -> RecordId {
                RecordId::from_bytes(&self.payload_at(index))
            }

            /// Child page of the internal entry at `index`.
            pub fn child_at(&self, index: usize) -> PageId {
                PageId::new(read_u32(self.data, slot_offset(index) + 4))
            }

            /// First index whose key is `>= key` (the run start for
            /// duplicates), or `slot_count()` when every key is smaller.
            pub fn lower_bound(&self, key: &Key, key_type: KeyType) -> Result<usize> {
                let mut lo = 0;
                let mut hi = self.slot_count();
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    if self.key_at(mid, key_type)? < *key {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                Ok(lo)
            }

            /// First index whose key is `> key`, or `slot_count()`.
            pub fn upper_bound(&self, key: &Key, key_type: KeyType) -> Result<usize> {
                let mut lo = 0;
                let mut hi = self.slot_count();
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    if self.key_at(mid, key_type)? <= *key {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                Ok(lo)
            }

            /// Child an internal node routes `key` to: the child of the
            /// largest separator `<= key`, or the leftmost child when
            /// every separator is larger.
            pub fn route(&self, key: &Key, key_type: KeyType) -> Result<PageId> {
                let ub = self.upper_bound(key, key_type)?;
                if ub == 0 {
                    Ok(self.prev())
                } else {
                    Ok(self.child_at(ub - 1))
                }
            }

            /// Child to descend into when seeking the leftmost
            /// occurrence of `key`: the child under the last entry whose
            /// key is strictly less than `key`, or the leftmost link
            /// when no entry is. Unlike [`route`](Self::route) this
            /// lands left of every separator equal to `key`, so a
            /// duplicate run straddling separators is entered at its
            /// start.
            pub fn route_leftmost(&self, key: &Key, key_type: KeyType) -> Result<PageId> {
                let lb = self.lower_bound(key, key_type)?;
                if lb == 0 {
                    Ok(self.prev())
                } else {
                    Ok(self.child_at(lb - 1))
                }
            }
        }
    };
}

node_read_impl!(NodeRef);
node_read_impl!(NodeMut);

impl<'a> NodeRef<'a> {
    /// View a page as a node, validating its page type.
    pub fn new(page_id: PageId, page: &'a Page) -> Result<Self> {
        let data = page.as_slice();
        let kind = NodeKind::from_page_type(PageType::from_u8(data[0]))
            .ok_or_else(|| Error::corrupted(page_id, "expected a tree node page"))?;
        Ok(Self {
            page_id,
            kind,
            data,
        })
    }
}

impl<'a> NodeMut<'a> {
    /// View a page mutably as a node, validating its page type.
    pub fn new(page_id: PageId, page: &'a mut Page) -> Result<Self> {
        let kind = NodeKind::from_page_type(PageType::from_u8(page.as_slice()[0]))
            .ok_or_else(|| Error::corrupted(page_id, "expected a tree node page"))?;
        Ok(Self {
            page_id,
            kind,
            data: page.as_mut_slice(),
        })
    }

    /// Initialize a freshly allocated page as an empty node.
    pub fn init(page_id: PageId, page: &'a mut Page, kind: NodeKind) -> Self {
        page.reset();
        page.set_header(&PageHeader::new(kind.page_type()));

        let data = page.as_mut_slice();
        write_u16(data, OFFSET_SLOT_COUNT, 0);
        write_u16(data, OFFSET_FREE_PTR, PAGE_SIZE as u16);
        write_u32(data, OFFSET_PREV, PageId::INVALID.0);
        write_u32(data, OFFSET_NEXT, PageId::INVALID.0);

        Self {
            page_id,
            kind,
            data,
        }
    }

    /// Set the prev link (leaf left sibling / internal leftmost child).
    pub fn set_prev(&mut self, page_id: PageId) {
        write_u32(self.data, OFFSET_PREV, page_id.0);
    }

    /// Set the next link (leaf right sibling).
    pub fn set_next(&mut self, page_id: PageId) {
        write_u32(self.data, OFFSET_NEXT, page_id.0);
    }

    /// Insert an entry at `index`, shifting later slots right.
    ///
    /// # Errors
    /// Returns `Error::Corrupted` if the entry does not fit; callers
    /// check [`fits`](NodeRef::fits) and split beforehand, so running
    /// out of space here means the maintenance logic miscounted.
    pub fn insert_at(
        &mut self,
        index: usize,
        key_bytes: &[u8],
        payload: &[u8; RecordId::SIZE],
    ) -> Result<()> {
        let count = self.slot_count();
        assert!(index <= count, "slot index out of bounds");

        if !self.fits(key_bytes.len()) {
            return Err(Error::corrupted(self.page_id, "node overflow"));
        }

        // Claim key space at the bottom of the heap.
        let new_free_ptr = self.free_ptr() - key_bytes.len();
        self.data[new_free_ptr..new_free_ptr + key_bytes.len()].copy_from_slice(key_bytes);
        write_u16(self.data, OFFSET_FREE_PTR, new_free_ptr as u16);

        // Open a gap in the slot array.
        let src = slot_offset(index);
        let end = slot_offset(count);
        self.data.copy_within(src..end, src + SLOT_SIZE);

        write_u16(self.data, src, new_free_ptr as u16);
        write_u16(self.data, src + 2, key_bytes.len() as u16);
        self.data[src + 4..src + 4 + RecordId::SIZE].copy_from_slice(payload);

        write_u16(self.data, OFFSET_SLOT_COUNT, (count + 1) as u16);
        Ok(())
    }

    /// Insert `(key, payload)` at its sorted position. Among equal keys
    /// the new entry lands at the front of the run.
    pub fn insert_sorted(
        &mut self,
        key: &Key,
        key_type: KeyType,
        payload: &[u8; RecordId::SIZE],
    ) -> Result<()> {
        let index = self.lower_bound(key, key_type)?;
        self.insert_at(index, &key.encode(), payload)
    }

    /// Insert a leaf entry at its sorted position.
    pub fn insert_leaf_entry(&mut self, key: &Key, key_type: KeyType, rid: RecordId) -> Result<()> {
        self.insert_sorted(key, key_type, &rid.to_bytes())
    }

    /// Insert an internal entry (separator key, child pointer) at its
    /// sorted position.
    pub fn insert_index_entry(
        &mut self,
        key: &Key,
        key_type: KeyType,
        child: PageId,
    ) -> Result<()> {
        let mut payload = [0u8; RecordId::SIZE];
        payload[0..4].copy_from_slice(&child.0.to_le_bytes());
        self.insert_sorted(key, key_type, &payload)
    }

    /// Delete the entry at `index`, compacting the key heap.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn delete_at(&mut self, index: usize) {
        let count = self.slot_count();
        assert!(index < count, "slot index out of bounds");

        let slot = slot_offset(index);
        let key_off = read_u16(self.data, slot) as usize;
        let key_len = read_u16(self.data, slot + 2) as usize;

        // Close the hole in the key heap by sliding everything below
        // the removed key up, then fix the offsets that moved.
        let free_ptr = self.free_ptr();
        self.data.copy_within(free_ptr..key_off, free_ptr + key_len);
        write_u16(self.data, OFFSET_FREE_PTR, (free_ptr + key_len) as u16);

        // Close the gap in the slot array.
        let end = slot_offset(count);
        self.data.copy_within(slot + SLOT_SIZE..end, slot);
        write_u16(self.data, OFFSET_SLOT_COUNT, (count - 1) as u16);

        for i in 0..count - 1 {
            let s = slot_offset(i);
            let off = read_u16(self.data, s) as usize;
            if off < key_off {
                write_u16(self.data, s, (off + key_len) as u16);
            }
        }
    }
}
