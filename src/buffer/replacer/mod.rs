//! Eviction policy implementations (replacers).
//!
//! Currently implements:
//! - [`FifoReplacer`] - straightforward FIFO

mod fifo;

pub use fifo::FifoReplacer;
