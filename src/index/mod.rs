//! Index structures.

pub mod btree;

pub use btree::{BTree, DeletePolicy, Key, KeyType, TreeScan};
