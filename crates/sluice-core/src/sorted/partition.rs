//! Per-partition tuple storage: a chain of memory blocks plus an optional
//! duplicate-key index.

use fxhash::FxHashMap;

use super::spill::RunFile;
use crate::alloc::{BlockPool, MemoryBlock};
use crate::tuple::{self, Accumulator, ByteOrder};

/// Location of an encoded tuple record inside a partition's block chain.
///
/// Records never move once written, so a location stays valid until the
/// partition's blocks are released.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TupleLoc {
    /// Index into the partition's block chain.
    pub block: u32,
    /// Byte offset of the record within the block.
    pub offset: u32,
}

/// One hash partition of the sorted aggregator.
///
/// Holds appended tuples in an ordered chain of pool blocks, an index from
/// serialized key to record location (maintained only when an accumulator
/// is configured), the sorted record references produced by the sort phase,
/// and the partition's at-most-one spilled run.
pub(crate) struct Partition {
    blocks: Vec<MemoryBlock>,
    index: FxHashMap<Box<[u8]>, TupleLoc>,
    sorted: Vec<TupleLoc>,
    tuple_count: usize,
    /// The partition's spilled run, if a spill pass has produced one.
    pub(crate) run: Option<RunFile>,
}

impl Partition {
    pub(crate) fn new() -> Self {
        Self {
            blocks: Vec::new(),
            index: FxHashMap::default(),
            sorted: Vec::new(),
            tuple_count: 0,
            run: None,
        }
    }

    /// Number of tuples currently held in memory.
    pub(crate) fn tuple_count(&self) -> usize {
        self.tuple_count
    }

    /// Looks up the in-memory record location for a serialized key.
    pub(crate) fn lookup(&self, key: &[u8]) -> Option<TupleLoc> {
        self.index.get(key).copied()
    }

    /// Appends an encoded record, rotating to a fresh pool block when the
    /// active one is full. Returns `false` when the pool is exhausted; the
    /// caller must spill and retry.
    ///
    /// The aggregator guarantees the record fits a single block.
    #[allow(clippy::cast_possible_truncation)] // block count and offsets are bounded by pool geometry
    pub(crate) fn append(
        &mut self,
        pool: &mut BlockPool,
        order: ByteOrder,
        key: &[u8],
        value: &[u8],
        build_index: bool,
    ) -> bool {
        let need = tuple::record_len(key, value);
        let has_room = self.blocks.last().is_some_and(|b| b.remaining() >= need);
        if !has_room {
            match pool.acquire() {
                Some(block) => self.blocks.push(block),
                None => return false,
            }
        }
        let block_idx = self.blocks.len() - 1;
        let Some((offset, dst)) = self.blocks[block_idx].try_reserve(need) else {
            // A fresh block always fits a validated record.
            return false;
        };
        tuple::encode_record(order, dst, key, value);
        if build_index {
            self.index.insert(
                key.into(),
                TupleLoc {
                    block: block_idx as u32,
                    offset: offset as u32,
                },
            );
        }
        self.tuple_count += 1;
        true
    }

    /// Folds `incoming` into the stored value of the record at `loc`.
    pub(crate) fn combine_value(
        &mut self,
        loc: TupleLoc,
        incoming: &[u8],
        accumulator: &dyn Accumulator,
        order: ByteOrder,
    ) {
        let block = &mut self.blocks[loc.block as usize];
        let range = tuple::value_range(order, block.bytes(), loc.offset as usize);
        let (start, len) = (range.start, range.len());
        accumulator.combine(order, block.slice_mut(start, len), incoming);
    }

    /// Key bytes of the record at `loc`.
    pub(crate) fn key_at(&self, loc: TupleLoc, order: ByteOrder) -> &[u8] {
        self.record_at(loc, order).0
    }

    /// Value bytes of the record at `loc`.
    pub(crate) fn value_at(&self, loc: TupleLoc, order: ByteOrder) -> &[u8] {
        self.record_at(loc, order).1
    }

    /// Key and value of the record at `loc`.
    pub(crate) fn record_at(&self, loc: TupleLoc, order: ByteOrder) -> (&[u8], &[u8]) {
        let block = &self.blocks[loc.block as usize];
        let (key, value, _) = tuple::decode_record(order, &block.bytes()[loc.offset as usize..]);
        (key, value)
    }

    /// Walks the block chain and collects record locations in arrival order.
    #[allow(clippy::cast_possible_truncation)] // block count and offsets are bounded by pool geometry
    fn scan_locs(&self, order: ByteOrder) -> Vec<TupleLoc> {
        let mut locs = Vec::with_capacity(self.tuple_count);
        for (block_idx, block) in self.blocks.iter().enumerate() {
            let bytes = block.bytes();
            let mut offset = 0;
            while offset < bytes.len() {
                let (_, _, consumed) = tuple::decode_record(order, &bytes[offset..]);
                locs.push(TupleLoc {
                    block: block_idx as u32,
                    offset: offset as u32,
                });
                offset += consumed;
            }
        }
        locs
    }

    /// Sorts the partition's records by key without moving the tuples.
    ///
    /// The sort is stable, so equal keys keep their arrival order.
    pub(crate) fn sort_with(
        &mut self,
        order: ByteOrder,
        cmp: &dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering,
    ) {
        let mut locs = self.scan_locs(order);
        locs.sort_by(|a, b| cmp(self.key_at(*a, order), self.key_at(*b, order)));
        self.sorted = locs;
    }

    /// Number of sorted record references.
    pub(crate) fn sorted_len(&self) -> usize {
        self.sorted.len()
    }

    /// The `i`-th sorted record location.
    pub(crate) fn sorted_loc(&self, i: usize) -> TupleLoc {
        self.sorted[i]
    }

    /// Returns every block to the pool and clears all in-memory state.
    /// The spilled run, if any, is untouched.
    pub(crate) fn release_blocks(&mut self, pool: &mut BlockPool) {
        for block in self.blocks.drain(..) {
            pool.release(block);
        }
        self.index.clear();
        self.sorted.clear();
        self.tuple_count = 0;
    }
}
