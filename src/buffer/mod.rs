//! Buffer pool management.
//!
//! The buffer pool is the in-memory cache between the index layer and
//! disk. It manages a fixed pool of frames, each holding one page.
//!
//! # Components
//! - [`BufferPoolManager`] - the page cache, plus page free/recycle
//! - [`Frame`] - a slot holding a page + bookkeeping
//! - [`PageReadGuard`] / [`PageWriteGuard`] - RAII pin/unpin
//! - [`BufferPoolStats`] - performance counters
//! - [`replacer`] - eviction policies

mod buffer_pool_manager;
mod frame;
mod page_guard;
pub mod replacer;
mod stats;

pub use buffer_pool_manager::BufferPoolManager;
pub use frame::Frame;
pub use page_guard::{PageReadGuard, PageWriteGuard};
pub use stats::{BufferPoolStats, StatsSnapshot};
