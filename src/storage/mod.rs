//! Storage layer - disk I/O, page formats, and the file-entry catalog.
//!
//! - [`DiskManager`] - Low-level file I/O with page recycling
//! - [`page`] - Page types and layouts
//! - [`catalog`] - Name → header-page directory (page 0)

pub mod catalog;
mod disk_manager;
pub mod page;

pub use catalog::Catalog;
pub use disk_manager::DiskManager;
