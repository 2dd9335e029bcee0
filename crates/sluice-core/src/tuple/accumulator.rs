//! Value accumulators.

use super::ByteOrder;

/// Combines two serialized values into one, in place on the first argument.
///
/// Accumulators operate on fixed-width values: `target` and `source` must
/// both be the accumulator's value width. Associative accumulators permit
/// partial combines while spilled runs are merged; non-associative ones are
/// only applied in arrival order, at ingestion within a partition and at
/// the final cursor pass across sources.
pub trait Accumulator: Send {
    /// Whether combines may be reordered and applied in stages.
    fn is_associative(&self) -> bool {
        true
    }

    /// Folds `source` into `target`.
    fn combine(&self, order: ByteOrder, target: &mut [u8], source: &[u8]);
}

/// Sums 4-byte signed integer values with wrapping arithmetic.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntSumAccumulator;

impl IntSumAccumulator {
    /// Creates an integer sum accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Accumulator for IntSumAccumulator {
    fn combine(&self, order: ByteOrder, target: &mut [u8], source: &[u8]) {
        debug_assert_eq!(target.len(), 4, "IntSumAccumulator expects i32 values");
        debug_assert_eq!(source.len(), 4, "IntSumAccumulator expects i32 values");
        let sum = order.read_i32(target).wrapping_add(order.read_i32(source));
        order.write_i32(target, sum);
    }
}

/// Sums 8-byte signed integer values with wrapping arithmetic.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongSumAccumulator;

impl LongSumAccumulator {
    /// Creates a long sum accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Accumulator for LongSumAccumulator {
    fn combine(&self, order: ByteOrder, target: &mut [u8], source: &[u8]) {
        debug_assert_eq!(target.len(), 8, "LongSumAccumulator expects i64 values");
        debug_assert_eq!(source.len(), 8, "LongSumAccumulator expects i64 values");
        let sum = order.read_i64(target).wrapping_add(order.read_i64(source));
        order.write_i64(target, sum);
    }
}
