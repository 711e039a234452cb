//! Error types for stratadb.
//!
//! One crate-wide enum keeps error handling uniform across layers. The
//! variants fall into four groups:
//! - input validation ([`Error::KeyTooLong`], [`Error::KeyTypeMismatch`]):
//!   caller error, reported before any mutation;
//! - collaborator failures (I/O, buffer pool, catalog): propagated with the
//!   offending page id or name embedded;
//! - structural violations ([`Error::EntryVanished`], [`Error::Corrupted`]):
//!   the tree's own invariants no longer hold, unrecoverable for the
//!   current operation;
//! - not-found outcomes are *not* errors; they are ordinary `Ok(false)` /
//!   `Ok(None)` return values.

use thiserror::Error;

/// Convenient Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in stratadb.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from disk operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page does not exist on disk.
    #[error("page {0} not found")]
    PageNotFound(u32),

    /// Buffer pool has no free frames and cannot evict any pages.
    /// This happens when all frames are pinned.
    #[error("no free frames available in buffer pool")]
    NoFreeFrames,

    /// The provided page ID is invalid (e.g., the INVALID sentinel).
    #[error("invalid page id: {0}")]
    InvalidPageId(u32),

    /// Attempted to unpin a page that wasn't pinned. Indicates a bug:
    /// unpinning should match pinning.
    #[error("page {0} is not pinned")]
    PageNotPinned(u32),

    /// Attempted to free or evict a page that is still pinned.
    #[error("page {0} is still pinned")]
    PagePinned(u32),

    /// The key's encoded size exceeds the tree's configured maximum.
    #[error("key length {len} exceeds the maximum key size {max}")]
    KeyTooLong { len: usize, max: usize },

    /// The key's runtime type disagrees with the tree's declared key type.
    #[error("key type does not match the tree's declared key type")]
    KeyTypeMismatch,

    /// A tree with this name is already registered in the catalog.
    #[error("index file {0:?} already exists")]
    FileExists(String),

    /// No tree with this name is registered in the catalog.
    #[error("index file {0:?} not found")]
    FileNotFound(String),

    /// File names in the catalog are limited to [`crate::storage::catalog::MAX_NAME_LEN`] bytes.
    #[error("file name too long: {0} bytes")]
    FileNameTooLong(usize),

    /// The catalog page cannot hold another entry.
    #[error("catalog page is full")]
    CatalogFull,

    /// Full delete descended the unique path implied by a key but the
    /// (key, locator) pair was not on the leaf. The tree's ordering
    /// invariant has been violated, or the caller deleted a pair that was
    /// never inserted.
    #[error("entry was not found on its descent path")]
    EntryVanished,

    /// The tree's on-page structure is inconsistent (bad node kind, bad
    /// magic, structurally required sibling missing, page overflow during
    /// a maintenance step).
    #[error("tree corrupted on page {page}: {reason}")]
    Corrupted { page: u32, reason: &'static str },
}

impl Error {
    /// Shorthand for a [`Error::Corrupted`] value.
    pub(crate) fn corrupted(page: crate::common::PageId, reason: &'static str) -> Self {
        Error::Corrupted {
            page: page.0,
            reason,
        }
    }
}
