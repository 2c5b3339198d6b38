//! Pooled, sector-aligned transfer buffers.

mod block;
mod pool;

pub use block::{Block, SECTOR_SIZE};
pub use pool::BufferPool;
