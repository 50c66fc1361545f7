//! Allocation-free buffer primitives.
//!
//! Both types allocate their storage once at construction and never again,
//! so they can be used from interrupt context after setup.

pub mod block_pool;
pub mod double_buffer;

pub use block_pool::{Block, BlockIndex, BlockPool, PoolError};
pub use double_buffer::{BufferError, DoubleBuffer, Slot, SlotId};
