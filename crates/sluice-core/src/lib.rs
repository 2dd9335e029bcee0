//! # Sluice Core
//!
//! Core operators for the sluice dataflow engine. The engine drives a DAG of
//! single-threaded cooperative operators; this crate implements the two
//! stateful ones that carry the hard design work:
//!
//! - **Session windows** ([`operator::session_window`]): per-key grouping of
//!   events into variable-length sessions on event time, with an ordered
//!   deadline index and gap-driven merging.
//! - **Sorted aggregation** ([`sorted`]): a partitioned binary tuple store
//!   that spills sorted runs to disk when its block pool is exhausted and
//!   serves a globally ordered, optionally accumulating cursor.
//!
//! ## Design Principles
//!
//! 1. **Cooperative scheduling** - every long operation is sliced into
//!    explicit `next_chunk()`-style steps; no internal threads or locks
//! 2. **Bounded memory** - tuple storage comes only from a fixed block pool;
//!    session state is bounded by live sessions
//! 3. **Explicit back-pressure** - `accept` reports exhaustion through its
//!    return value, never by blocking
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice_core::sorted::{SortedAggregator, SortedAggregatorConfig};
//!
//! let mut agg = SortedAggregator::new(config, comparator, None)?;
//! while !agg.accept(key, value)? {
//!     let mut pass = agg.start_spilling()?;
//!     while !pass.next_chunk()? {}
//!     pass.finish()?;
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Allow unsafe in alloc module for native memory blocks
#![allow(unsafe_code)]

pub mod alloc;
pub mod operator;
pub mod sorted;
pub mod time;
pub mod tuple;

/// Result type for sluice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sluice-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Sorted-aggregator errors
    #[error("Aggregator error: {0}")]
    Aggregator(#[from] sorted::AggregatorError),
}
