//! # Operator Module
//!
//! Stateful streaming operators and their shared types.
//!
//! Operators are single-threaded cooperative components: an external
//! scheduler owns the thread, delivers items and watermarks, and drains
//! each call's outputs before delivering the next input.

use smallvec::SmallVec;

pub mod session_window;

/// A closed session emitted by the session-window operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<K, R> {
    /// Grouping key of the session.
    pub key: K,
    /// Session start timestamp (inclusive).
    pub start: i64,
    /// Session end timestamp (exclusive).
    pub end: i64,
    /// Finished aggregation result.
    pub result: R,
}

/// Collection type for emitted sessions.
///
/// Uses `SmallVec` to avoid heap allocation for common cases: most
/// watermarks close zero sessions, and a bursty watermark typically closes
/// only a handful.
pub type SessionVec<K, R> = SmallVec<[Session<K, R>; 4]>;

/// Errors that can occur in operators
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// Configuration error (e.g., non-positive session timeout)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
