//! # Sorted Aggregator
//!
//! An external-memory operator that ingests `(key, value)` byte tuples into
//! a partitioned block store, transparently spills partitions to sorted
//! on-disk runs when the block pool is exhausted, and serves a globally
//! sorted, optionally accumulating cursor.
//!
//! ## Cooperative operation
//!
//! Every long operation is sliced so an external scheduler can interleave
//! work and apply back-pressure:
//!
//! - [`SortedAggregator::accept`] never blocks; `Ok(false)` means the pool
//!   is empty and the caller must run a spill pass, then retry
//! - a spill pass is driven chunk by chunk through a [`SpillPass`] handle
//! - [`SortedAggregator::sort`] sorts one partition per call
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_core::sorted::{SortedAggregator, SortedAggregatorConfig};
//! use sluice_core::tuple::BytewiseComparator;
//!
//! # fn demo() -> Result<(), sluice_core::sorted::AggregatorError> {
//! let config = SortedAggregatorConfig::new("/tmp/sluice-spill");
//! let mut agg = SortedAggregator::new(config, Box::new(BytewiseComparator::new()), None)?;
//!
//! if !agg.accept(b"key", b"value")? {
//!     let mut pass = agg.start_spilling()?;
//!     while !pass.next_chunk()? {}
//!     pass.finish()?;
//!     agg.accept(b"key", b"value")?;
//! }
//!
//! agg.prepare_to_sort()?;
//! while !agg.sort()? {}
//! let mut cursor = agg.cursor()?;
//! while cursor.advance()? {
//!     let tuple = cursor.tuple();
//!     // consume tuple.key / tuple.value
//! }
//! # Ok(())
//! # }
//! ```

mod cursor;
mod partition;
mod spill;

pub use cursor::{Cursor, Tuple};
pub use spill::SpillPass;

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::alloc::{BlockPool, ChainingRule};
use crate::tuple::{self, Accumulator, ByteOrder, Comparator, LENGTH_FIELD};
use partition::Partition;
use spill::SpillProgress;

/// Direction of the global tuple order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending comparator order.
    Asc,
    /// Descending: the comparator is reversed uniformly.
    Desc,
}

/// Errors that can occur in the sorted aggregator
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// Configuration error at construction (non-positive sizes or counts)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Method called in a state that does not permit it
    #[error("operation `{op}` not permitted in state `{state}`")]
    InvalidState {
        /// The rejected operation
        op: &'static str,
        /// The state it was attempted in
        state: &'static str,
    },

    /// A tuple that cannot fit in a single memory block
    #[error("tuple of {len} bytes cannot fit a {block_size}-byte block")]
    TupleTooLarge {
        /// Encoded record size
        len: usize,
        /// Configured block size
        block_size: usize,
    },

    /// The aggregator was broken by an earlier I/O failure
    #[error("aggregator is broken by a prior I/O failure")]
    Broken,

    /// Spill I/O failure; the aggregator enters the broken state
    #[error("spill I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Constructor configuration for a [`SortedAggregator`].
#[derive(Debug, Clone)]
pub struct SortedAggregatorConfig {
    /// Number of hash partitions; the unit of independent sort and spill.
    pub partition_count: usize,
    /// Size in bytes of each pool block.
    pub block_size: usize,
    /// Number of blocks in the pool; total tuple memory is
    /// `block_size * pool_capacity`.
    pub pool_capacity: usize,
    /// Buffer capacity for run-file reads and writes.
    pub spilling_buffer_size: usize,
    /// Maximum bytes written per `SpillPass::next_chunk` call.
    pub spilling_chunk_size: usize,
    /// Directory for run files; must be writable and unique per instance.
    pub spill_dir: PathBuf,
    /// Direction of the global order.
    pub sort_order: SortOrder,
    /// Byte order of record framing and numeric values.
    pub byte_order: ByteOrder,
    /// Backing storage for pool blocks.
    pub chaining_rule: ChainingRule,
}

impl SortedAggregatorConfig {
    /// Creates a configuration with defaults for everything but the spill
    /// directory: 2 partitions, 128 KiB blocks, 32-block pool, 64 KiB I/O
    /// buffers and spill chunks, ascending little-endian order, heap blocks.
    pub fn new(spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            partition_count: 2,
            block_size: 128 * 1024,
            pool_capacity: 32,
            spilling_buffer_size: 64 * 1024,
            spilling_chunk_size: 64 * 1024,
            spill_dir: spill_dir.into(),
            sort_order: SortOrder::Asc,
            byte_order: ByteOrder::Little,
            chaining_rule: ChainingRule::Heap,
        }
    }
}

/// Operator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Ingesting tuples.
    Accepting,
    /// A spill pass is active; only the pass handle may drive work.
    Spilling,
    /// Incremental sort in progress; `next` is the partition to sort.
    Sorting {
        /// Next partition to sort.
        next: usize,
    },
    /// Every partition sorted; cursors may be opened.
    Sorted,
    /// Terminal state after an I/O failure; only `dispose` is permitted.
    Broken,
    /// Terminal state after `dispose`.
    Disposed,
}

/// Spill-to-disk sorted aggregator.
///
/// Tuples are hash-routed to partitions and appended to pool blocks; the
/// pool is the only memory source, so ingestion reports exhaustion instead
/// of growing. A spill pass turns each partition's contents into a single
/// sorted run on disk (merging with the previous run), after which
/// ingestion resumes. Sorting and cursor creation merge whatever remains in
/// memory with all spilled runs.
///
/// When an accumulator is configured, values of duplicate keys are folded
/// together: eagerly within a partition's in-memory contents, during spill
/// merges if the accumulator is associative, and finally at the cursor.
///
/// # Lifecycle
///
/// `Accepting` → (spill passes) → `Accepting` → `Sorting` → `Sorted` →
/// cursors → `dispose`. An I/O failure moves the operator to a terminal
/// broken state that rejects everything except `dispose`.
pub struct SortedAggregator {
    config: SortedAggregatorConfig,
    comparator: Box<dyn Comparator>,
    accumulator: Option<Box<dyn Accumulator>>,
    pool: BlockPool,
    partitions: Vec<Partition>,
    state: State,
    /// Progress of the active spill pass, if any.
    spill: Option<SpillProgress>,
    next_run_id: u64,
}

impl SortedAggregator {
    /// Creates a new aggregator and its spill directory layout.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::ConfigError` for non-positive sizes or
    /// counts, and `AggregatorError::Io` if the spill directories cannot be
    /// created.
    pub fn new(
        config: SortedAggregatorConfig,
        comparator: Box<dyn Comparator>,
        accumulator: Option<Box<dyn Accumulator>>,
    ) -> Result<Self, AggregatorError> {
        if config.partition_count == 0 {
            return Err(AggregatorError::ConfigError(
                "partition count must be positive".to_string(),
            ));
        }
        if config.block_size <= 2 * LENGTH_FIELD {
            return Err(AggregatorError::ConfigError(format!(
                "block size must exceed record framing ({} bytes)",
                2 * LENGTH_FIELD
            )));
        }
        if config.pool_capacity == 0 {
            return Err(AggregatorError::ConfigError(
                "pool capacity must be positive".to_string(),
            ));
        }
        if config.spilling_buffer_size == 0 {
            return Err(AggregatorError::ConfigError(
                "spilling buffer size must be positive".to_string(),
            ));
        }
        if config.spilling_chunk_size == 0 {
            return Err(AggregatorError::ConfigError(
                "spilling chunk size must be positive".to_string(),
            ));
        }

        for i in 0..config.partition_count {
            std::fs::create_dir_all(config.spill_dir.join(format!("partition-{i}")))?;
        }

        let pool = BlockPool::new(config.block_size, config.pool_capacity, config.chaining_rule);
        let partitions = (0..config.partition_count).map(|_| Partition::new()).collect();
        debug!(
            partitions = config.partition_count,
            block_size = config.block_size,
            pool_blocks = config.pool_capacity,
            spill_dir = %config.spill_dir.display(),
            "sorted aggregator created"
        );
        Ok(Self {
            config,
            comparator,
            accumulator,
            pool,
            partitions,
            state: State::Accepting,
            spill: None,
            next_run_id: 0,
        })
    }

    /// Ingests one tuple.
    ///
    /// Returns `Ok(false)` when no block is available: the caller must run
    /// a spill pass and retry the same tuple. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidState` outside the accepting state,
    /// `AggregatorError::Broken` after an I/O failure, and
    /// `AggregatorError::TupleTooLarge` for a record that cannot fit one
    /// block.
    pub fn accept(&mut self, key: &[u8], value: &[u8]) -> Result<bool, AggregatorError> {
        self.require_accepting("accept")?;
        let need = tuple::record_len(key, value);
        if need > self.config.block_size {
            return Err(AggregatorError::TupleTooLarge {
                len: need,
                block_size: self.config.block_size,
            });
        }
        let p = self.partition_of(key);
        if self.accumulator.is_some() {
            if let Some(loc) = self.partitions[p].lookup(key) {
                let order = self.config.byte_order;
                if let Some(acc) = self.accumulator.as_deref() {
                    self.partitions[p].combine_value(loc, value, acc, order);
                }
                return Ok(true);
            }
        }
        let build_index = self.accumulator.is_some();
        Ok(self.partitions[p].append(&mut self.pool, self.config.byte_order, key, value, build_index))
    }

    /// Begins a spill pass, returning the handle that drives it.
    ///
    /// While the handle lives the aggregator is mutably borrowed, so no
    /// other operation can be interleaved with the pass.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidState` outside the accepting state
    /// and `AggregatorError::Broken` after an I/O failure.
    pub fn start_spilling(&mut self) -> Result<SpillPass<'_>, AggregatorError> {
        self.require_accepting("start_spilling")?;
        self.state = State::Spilling;
        self.spill = Some(SpillProgress::new());
        debug!(
            memory_tuples = self.memory_tuple_count(),
            blocks_in_use = self.pool.in_use(),
            "spill pass started"
        );
        Ok(SpillPass { agg: self })
    }

    /// Moves from ingestion to the incremental sort phase.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidState` outside the accepting state.
    pub fn prepare_to_sort(&mut self) -> Result<(), AggregatorError> {
        self.require_accepting("prepare_to_sort")?;
        self.state = State::Sorting { next: 0 };
        Ok(())
    }

    /// Sorts one partition. Returns `true` once every partition is sorted.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidState` unless `prepare_to_sort` ran
    /// first.
    pub fn sort(&mut self) -> Result<bool, AggregatorError> {
        match self.state {
            State::Sorting { next } => {
                self.sort_partition(next);
                let next = next + 1;
                if next >= self.partitions.len() {
                    self.state = State::Sorted;
                    Ok(true)
                } else {
                    self.state = State::Sorting { next };
                    Ok(false)
                }
            }
            State::Sorted => Ok(true),
            _ => Err(AggregatorError::InvalidState {
                op: "sort",
                state: self.state_name(),
            }),
        }
    }

    /// Opens a cursor over the globally sorted stream: all partitions, in
    /// memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidState` unless sorting completed, or
    /// `AggregatorError::Io` if a run cannot be opened.
    pub fn cursor(&mut self) -> Result<Cursor<'_>, AggregatorError> {
        self.require_sorted("cursor")?;
        let partitions = 0..self.partitions.len();
        Cursor::new(self, partitions)
    }

    /// Opens a cursor over a single partition's sorted stream.
    ///
    /// # Errors
    ///
    /// As [`cursor`](Self::cursor), plus `AggregatorError::ConfigError` for
    /// an out-of-range partition index.
    pub fn partition_cursor(&mut self, partition: usize) -> Result<Cursor<'_>, AggregatorError> {
        self.require_sorted("partition_cursor")?;
        if partition >= self.partitions.len() {
            return Err(AggregatorError::ConfigError(format!(
                "partition index {partition} out of range ({} partitions)",
                self.partitions.len()
            )));
        }
        Cursor::new(self, partition..partition + 1)
    }

    /// Releases every block to the pool and deletes all spill files,
    /// including a half-written pass. Idempotent; also runs on drop.
    pub fn dispose(&mut self) {
        if self.state == State::Disposed {
            return;
        }
        // Dropping pass progress closes any open run files first.
        self.spill = None;
        for partition in &mut self.partitions {
            partition.release_blocks(&mut self.pool);
            partition.run = None;
        }
        for i in 0..self.partitions.len() {
            let dir = self.partition_dir(i);
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %e, "failed to remove spill directory");
            }
        }
        self.state = State::Disposed;
        debug!("aggregator disposed");
    }

    /// Number of tuples currently held in memory across all partitions.
    #[must_use]
    pub fn memory_tuple_count(&self) -> usize {
        self.partitions.iter().map(Partition::tuple_count).sum()
    }

    /// Number of partitions with a spilled run on disk.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.partitions.iter().filter(|p| p.run.is_some()).count()
    }

    /// Number of pool blocks available for ingestion.
    #[must_use]
    pub fn available_blocks(&self) -> usize {
        self.pool.available()
    }

    /// Compares keys under the configured comparator and direction.
    pub(crate) fn key_cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        let ord = self.comparator.compare(a, b);
        match self.config.sort_order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    /// Sorts one partition's in-memory records.
    pub(crate) fn sort_partition(&mut self, partition: usize) {
        let order = self.config.byte_order;
        let sort_order = self.config.sort_order;
        let comparator = &self.comparator;
        self.partitions[partition].sort_with(order, &|a, b| {
            let ord = comparator.compare(a, b);
            match sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }

    pub(crate) fn partition_dir(&self, partition: usize) -> PathBuf {
        self.config.spill_dir.join(format!("partition-{partition}"))
    }

    pub(crate) fn state_name(&self) -> &'static str {
        match self.state {
            State::Accepting => "accepting",
            State::Spilling => "spilling",
            State::Sorting { .. } => "sorting",
            State::Sorted => "sorted",
            State::Broken => "broken",
            State::Disposed => "disposed",
        }
    }

    #[allow(clippy::cast_possible_truncation)] // partition index fits usize by construction
    fn partition_of(&self, key: &[u8]) -> usize {
        let mut hasher = fxhash::FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    fn require_accepting(&self, op: &'static str) -> Result<(), AggregatorError> {
        match self.state {
            State::Accepting => Ok(()),
            State::Broken => Err(AggregatorError::Broken),
            _ => Err(AggregatorError::InvalidState {
                op,
                state: self.state_name(),
            }),
        }
    }

    fn require_sorted(&self, op: &'static str) -> Result<(), AggregatorError> {
        match self.state {
            State::Sorted => Ok(()),
            State::Broken => Err(AggregatorError::Broken),
            _ => Err(AggregatorError::InvalidState {
                op,
                state: self.state_name(),
            }),
        }
    }
}

impl Drop for SortedAggregator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{BytewiseComparator, IntSumAccumulator};
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> SortedAggregatorConfig {
        let mut config = SortedAggregatorConfig::new(dir.path());
        config.partition_count = 2;
        config.block_size = 256;
        config.pool_capacity = 4;
        config.spilling_buffer_size = 1024;
        config.spilling_chunk_size = 512;
        config
    }

    fn aggregator(
        config: SortedAggregatorConfig,
        accumulator: Option<Box<dyn Accumulator>>,
    ) -> SortedAggregator {
        SortedAggregator::new(config, Box::new(BytewiseComparator::new()), accumulator).unwrap()
    }

    fn spill_fully(agg: &mut SortedAggregator) {
        let mut pass = agg.start_spilling().unwrap();
        while !pass.next_chunk().unwrap() {}
        pass.finish().unwrap();
    }

    fn sort_fully(agg: &mut SortedAggregator) {
        agg.prepare_to_sort().unwrap();
        while !agg.sort().unwrap() {}
    }

    fn drain(agg: &mut SortedAggregator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut cursor = agg.cursor().unwrap();
        let mut out = Vec::new();
        while cursor.advance().unwrap() {
            let tuple = cursor.tuple();
            out.push((tuple.key.to_vec(), tuple.value.to_vec()));
        }
        out
    }

    #[test]
    fn test_rejects_bad_config() {
        let dir = TempDir::new().unwrap();
        let breakages: [fn(&mut SortedAggregatorConfig); 5] = [
            |c| c.partition_count = 0,
            |c| c.block_size = 8,
            |c| c.pool_capacity = 0,
            |c| c.spilling_buffer_size = 0,
            |c| c.spilling_chunk_size = 0,
        ];
        for breakage in breakages {
            let mut config = small_config(&dir);
            breakage(&mut config);
            let result =
                SortedAggregator::new(config, Box::new(BytewiseComparator::new()), None);
            assert!(matches!(result, Err(AggregatorError::ConfigError(_))));
        }
    }

    #[test]
    fn test_in_memory_sort_ascending() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);

        for key in [&b"pear"[..], b"apple", b"quince", b"fig"] {
            assert!(agg.accept(key, b"v").unwrap());
        }
        sort_fully(&mut agg);

        let keys: Vec<Vec<u8>> = drain(&mut agg).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"fig".to_vec(), b"pear".to_vec(), b"quince".to_vec()]);
    }

    #[test]
    fn test_descending_reverses_uniformly() {
        let dir = TempDir::new().unwrap();
        let mut config = small_config(&dir);
        config.sort_order = SortOrder::Desc;
        let mut agg = aggregator(config, None);

        for key in [&b"b"[..], b"c", b"a"] {
            agg.accept(key, b"v").unwrap();
        }
        sort_fully(&mut agg);

        let keys: Vec<Vec<u8>> = drain(&mut agg).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_pool_exhaustion_then_spill_and_retry() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);

        let value = [7u8; 64];
        let mut accepted = 0u32;
        let mut spills = 0;
        for i in 0..64u32 {
            let key = i.to_be_bytes();
            if !agg.accept(&key, &value).unwrap() {
                spill_fully(&mut agg);
                spills += 1;
                assert!(agg.accept(&key, &value).unwrap(), "accept after spill");
            }
            accepted += 1;
        }
        assert!(spills > 0, "pool should have been exhausted");
        assert!(agg.run_count() > 0);

        sort_fully(&mut agg);
        let tuples = drain(&mut agg);
        assert_eq!(tuples.len(), accepted as usize);
        for window in tuples.windows(2) {
            assert!(window[0].0 <= window[1].0);
        }
    }

    #[test]
    fn test_spill_releases_blocks() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);

        let value = [1u8; 64];
        while agg.accept(b"some-key", &value).unwrap() {}
        assert_eq!(agg.available_blocks(), 0);

        spill_fully(&mut agg);
        assert_eq!(agg.available_blocks(), 4);
        assert_eq!(agg.memory_tuple_count(), 0);
    }

    #[test]
    fn test_accumulator_combines_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), Some(Box::new(IntSumAccumulator::new())));

        let mut one = [0u8; 4];
        ByteOrder::Little.write_i32(&mut one, 1);
        for _ in 0..5 {
            assert!(agg.accept(b"counter", &one).unwrap());
        }
        assert_eq!(agg.memory_tuple_count(), 1);

        sort_fully(&mut agg);
        let tuples = drain(&mut agg);
        assert_eq!(tuples.len(), 1);
        assert_eq!(ByteOrder::Little.read_i32(&tuples[0].1), 5);
    }

    #[test]
    fn test_duplicate_keys_keep_arrival_order_without_accumulator() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);

        agg.accept(b"dup", b"first").unwrap();
        agg.accept(b"aaa", b"x").unwrap();
        agg.accept(b"dup", b"second").unwrap();
        sort_fully(&mut agg);

        let tuples = drain(&mut agg);
        let dups: Vec<Vec<u8>> = tuples
            .iter()
            .filter(|(k, _)| k == b"dup")
            .map(|(_, v)| v.clone())
            .collect();
        assert_eq!(dups, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_wrong_state_transitions_rejected() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);
        agg.accept(b"k", b"v").unwrap();

        // Cursor before sorting
        assert!(matches!(
            agg.cursor(),
            Err(AggregatorError::InvalidState { op: "cursor", .. })
        ));

        sort_fully(&mut agg);

        // Ingestion after sorting
        assert!(matches!(
            agg.accept(b"k2", b"v"),
            Err(AggregatorError::InvalidState { op: "accept", .. })
        ));
        // Repeated sort in the sorted state stays done
        assert!(agg.sort().unwrap());
    }

    #[test]
    fn test_finish_before_chunks_complete_rejected() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);
        let value = [2u8; 64];
        while agg.accept(b"key", &value).unwrap() {}

        let pass = agg.start_spilling().unwrap();
        // No chunks driven yet; the pass has not visited any partition.
        assert!(matches!(
            pass.finish(),
            Err(AggregatorError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_tuple_too_large() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);
        let oversized = vec![0u8; 512];
        assert!(matches!(
            agg.accept(&oversized, b"v"),
            Err(AggregatorError::TupleTooLarge { .. })
        ));
    }

    #[test]
    fn test_partition_cursor_covers_subset() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);
        for i in 0..32u32 {
            agg.accept(&i.to_be_bytes(), b"v").unwrap();
        }
        sort_fully(&mut agg);

        let mut per_partition = 0;
        for p in 0..2 {
            let mut cursor = agg.partition_cursor(p).unwrap();
            let mut previous: Option<Vec<u8>> = None;
            while cursor.advance().unwrap() {
                let key = cursor.tuple().key.to_vec();
                if let Some(prev) = &previous {
                    assert!(prev <= &key);
                }
                previous = Some(key);
                per_partition += 1;
            }
        }
        assert_eq!(per_partition, 32);
        assert!(matches!(
            agg.partition_cursor(2),
            Err(AggregatorError::ConfigError(_))
        ));
    }

    #[test]
    fn test_dispose_is_idempotent_and_cleans_disk() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);
        let value = [3u8; 64];
        while agg.accept(b"key", &value).unwrap() {}
        spill_fully(&mut agg);
        assert!(agg.run_count() > 0);

        agg.dispose();
        agg.dispose();

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        assert!(matches!(agg.accept(b"k", b"v"), Err(AggregatorError::InvalidState { .. })));
    }

    #[test]
    fn test_dispose_mid_spill_cleans_partial_run() {
        let dir = TempDir::new().unwrap();
        let mut config = small_config(&dir);
        config.spilling_chunk_size = 32; // force multiple chunks
        let mut agg = aggregator(config, None);
        let value = [4u8; 64];
        while agg.accept(b"key", &value).unwrap() {}

        let mut pass = agg.start_spilling().unwrap();
        assert!(!pass.next_chunk().unwrap());
        drop(pass);

        // Mid-pass the aggregator only permits dispose.
        assert!(matches!(
            agg.start_spilling(),
            Err(AggregatorError::InvalidState { .. })
        ));
        agg.dispose();
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_io_failure_breaks_aggregator() {
        let dir = TempDir::new().unwrap();
        let mut agg = aggregator(small_config(&dir), None);
        let value = [5u8; 64];
        while agg.accept(b"key", &value).unwrap() {}

        // Sabotage the spill directories behind the aggregator's back.
        std::fs::remove_dir_all(dir.path()).unwrap();

        let mut pass = agg.start_spilling().unwrap();
        assert!(matches!(pass.next_chunk(), Err(AggregatorError::Io(_))));
        drop(pass);

        assert!(matches!(agg.accept(b"k", b"v"), Err(AggregatorError::Broken)));
        agg.dispose();
    }
}
