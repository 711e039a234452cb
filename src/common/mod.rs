//! Common types and utilities shared across stratadb.
//!
//! Fundamental primitives used throughout the codebase:
//! - Configuration constants
//! - The crate-wide error type
//! - Identifiers (PageId, FrameId, RecordId)

pub mod config;
pub mod error;
mod frame_id;
mod page_id;
mod record_id;

pub use error::{Error, Result};
pub use frame_id::FrameId;
pub use page_id::PageId;
pub use record_id::RecordId;
