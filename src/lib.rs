//! stratadb - A disk-backed B+Tree index with swappable delete policies.
//!
//! # Architecture
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        stratadb                           │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────┐   │
//! │  │              Index Layer (index/)                  │   │
//! │  │   BTree: insert / search / delete / scan           │   │
//! │  │   Delete policies: Naive ←─OR─→ Full               │   │
//! │  └───────────────────────────────────────────────────┘   │
//! │                           ↓                               │
//! │  ┌───────────────────────────────────────────────────┐   │
//! │  │            Buffer Pool (buffer/)                   │   │
//! │  │   BufferPoolManager + Frame + RAII page guards     │   │
//! │  │   FIFO eviction + Statistics                       │   │
//! │  └───────────────────────────────────────────────────┘   │
//! │                           ↓                               │
//! │  ┌───────────────────────────────────────────────────┐   │
//! │  │           Storage Layer (storage/)                 │   │
//! │  │   DiskManager + page free list + Catalog           │   │
//! │  └───────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Shared primitives (PageId, RecordId, Error, config)
//! - [`storage`] - Disk I/O, page formats, the file catalog
//! - [`buffer`] - Buffer pool management and page guards
//! - [`index`] - The B+Tree index
//!
//! # Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use stratadb::buffer::BufferPoolManager;
//! use stratadb::common::RecordId;
//! use stratadb::index::{BTree, DeletePolicy, Key, KeyType};
//! use stratadb::storage::DiskManager;
//!
//! let dm = DiskManager::create("orders.db").unwrap();
//! let bpm = Arc::new(BufferPoolManager::new(64, dm));
//!
//! let tree = BTree::create(bpm, "orders_pk", KeyType::Int, 16, DeletePolicy::Full).unwrap();
//! tree.insert(&Key::Int(42), RecordId::new(3, 7)).unwrap();
//! assert_eq!(tree.search(&Key::Int(42)).unwrap(), Some(RecordId::new(3, 7)));
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

pub use buffer::BufferPoolManager;
pub use common::{Error, PageId, RecordId, Result};
pub use index::{BTree, DeletePolicy, Key, KeyType, TreeScan};
pub use storage::DiskManager;
