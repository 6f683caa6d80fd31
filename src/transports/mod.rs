//! Implementations of [`crate::transport::Transport`]

pub mod memory;
pub use memory::MemoryTransport;
