//! Fixed-size memory blocks and the bounded block pool.
//!
//! The block pool is the only source of tuple memory for the sorted
//! aggregator: blocks are drawn on demand by partitions and returned when a
//! partition's contents have been spilled or disposed. When the pool is
//! empty, ingestion reports exhaustion and the caller must spill.

mod block;
mod pool;

pub use block::{ChainingRule, MemoryBlock};
pub use pool::BlockPool;
