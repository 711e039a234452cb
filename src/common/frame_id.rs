//! Frame identifier type.

use std::fmt;

/// Identifies a frame in the buffer pool.
///
/// `usize` so it can index straight into the frame vector without
/// casting: `frames[frame_id.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Create a new FrameId.
    #[inline]
    pub fn new(id: usize) -> Self {
        FrameId(id)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_and_display() {
        assert_eq!(FrameId::new(5), FrameId::new(5));
        assert_ne!(FrameId::new(5), FrameId::new(6));
        assert_eq!(format!("{}", FrameId::new(42)), "Frame(42)");
    }
}
