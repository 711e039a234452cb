//! Disk-backed B+Tree index.
//!
//! Layers, bottom up:
//! - [`key`] - key types and their on-page encoding
//! - [`node`](self) - the sorted slotted page layout for leaves and
//!   internal nodes (crate-internal)
//! - [`header`](self) - the per-tree header page
//! - [`BTree`] - the index file: insert, search, delete, scan
//! - [`TreeScan`] - bounded forward cursor

pub mod key;

mod header;
mod node;
mod scan;
mod tree;

pub use header::DeletePolicy;
pub use key::{Key, KeyType};
pub use scan::TreeScan;
pub use tree::{BTree, MAX_KEY_SIZE};
