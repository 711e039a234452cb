//! Page identifier type.

use std::fmt;

/// Identifies a page on disk.
///
/// A `u32` allows 4 billion pages; at 4KB per page that is a 16TB
/// maximum database size. `u32::MAX` is reserved as the INVALID
/// sentinel, used wherever a "no page" value is needed (empty tree
/// root, end of a sibling chain, missing leftmost link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid/sentinel page ID, representing "no page".
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Create a new PageId.
    #[inline]
    pub fn new(id: u32) -> Self {
        PageId(id)
    }

    /// Check if this page ID is valid (not the sentinel value).
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Page(INVALID)")
        } else {
            write!(f, "Page({})", self.0)
        }
    }
}
