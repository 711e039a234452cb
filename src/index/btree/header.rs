//! Tree header page.
//!
//! Every tree owns one header page holding its root pointer and the
//! configuration fixed at creation time. The header page id is what the
//! catalog stores under the tree's name, so opening a tree is: look up
//! the name, read the header, go.

use crate::common::{Error, PageId, Result};
use crate::storage::page::{Page, PageHeader, PageType};

use super::key::KeyType;

/// Distinguishes a tree header page from arbitrary bytes.
pub const TREE_MAGIC: u32 = 1989;

/// How `delete` treats pages that drop below half occupancy.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Remove the entry and stop. Pages may become arbitrarily empty;
    /// only a fully empty leaf chain shrinks the tree.
    Naive = 0,
    /// Restore minimum occupancy by redistributing with a sibling or
    /// merging, propagating deletes up the tree.
    Full = 1,
}

impl DeletePolicy {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeletePolicy::Naive),
            1 => Some(DeletePolicy::Full),
            _ => None,
        }
    }
}

/// In-memory view of a tree header page.
///
/// `key_type`, `delete_policy` and `max_key_size` never change after
/// creation; `root` is rewritten on every root split or collapse.
///
/// # Layout (after the common [`PageHeader`])
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 13      4     magic (1989, little-endian)
/// 17      4     root page id
/// 21      1     key_type
/// 22      1     delete_policy
/// 23      2     max_key_size
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    /// Root node of the tree; [`PageId::INVALID`] while the tree is empty.
    pub root: PageId,
    /// Declared key type; all keys must match it.
    pub key_type: KeyType,
    /// Delete policy fixed at creation.
    pub delete_policy: DeletePolicy,
    /// Maximum encoded key size accepted by this tree.
    pub max_key_size: u16,
}

const OFFSET_MAGIC: usize = PageHeader::SIZE;
const OFFSET_ROOT: usize = OFFSET_MAGIC + 4;
const OFFSET_KEY_TYPE: usize = OFFSET_ROOT + 4;
const OFFSET_DELETE_POLICY: usize = OFFSET_KEY_TYPE + 1;
const OFFSET_MAX_KEY_SIZE: usize = OFFSET_DELETE_POLICY + 1;

impl TreeHeader {
    /// Create a header for a new, empty tree.
    pub fn new(key_type: KeyType, delete_policy: DeletePolicy, max_key_size: u16) -> Self {
        Self {
            root: PageId::INVALID,
            key_type,
            delete_policy,
            max_key_size,
        }
    }

    /// Parse a header from a page, validating page type and magic.
    ///
    /// # Errors
    /// Returns `Error::Corrupted` if the page is not a valid tree header.
    pub fn from_page(page_id: PageId, page: &Page) -> Result<Self> {
        let data = page.as_slice();

        if page.header().page_type != PageType::BTreeHeader {
            return Err(Error::corrupted(page_id, "not a tree header page"));
        }

        let magic = read_u32(data, OFFSET_MAGIC);
        if magic != TREE_MAGIC {
            return Err(Error::corrupted(page_id, "bad tree header magic"));
        }

        let key_type = KeyType::from_u8(data[OFFSET_KEY_TYPE])
            .ok_or_else(|| Error::corrupted(page_id, "unknown key type"))?;
        let delete_policy = DeletePolicy::from_u8(data[OFFSET_DELETE_POLICY])
            .ok_or_else(|| Error::corrupted(page_id, "unknown delete policy"))?;

        Ok(Self {
            root: PageId::new(read_u32(data, OFFSET_ROOT)),
            key_type,
            delete_policy,
            max_key_size: u16::from_le_bytes([data[OFFSET_MAX_KEY_SIZE], data[OFFSET_MAX_KEY_SIZE + 1]]),
        })
    }

    /// Write this header into a page, tagging it [`PageType::BTreeHeader`].
    pub fn write_to(&self, page: &mut Page) {
        page.set_header(&PageHeader::new(PageType::BTreeHeader));

        let data = page.as_mut_slice();
        data[OFFSET_MAGIC..OFFSET_MAGIC + 4].copy_from_slice(&TREE_MAGIC.to_le_bytes());
        data[OFFSET_ROOT..OFFSET_ROOT + 4].copy_from_slice(&self.root.0.to_le_bytes());
        data[OFFSET_KEY_TYPE] = self.key_type as u8;
        data[OFFSET_DELETE_POLICY] = self.delete_policy as u8;
        data[OFFSET_MAX_KEY_SIZE..OFFSET_MAX_KEY_SIZE + 2]
            .copy_from_slice(&self.max_key_size.to_le_bytes());

        page.update_checksum();
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
