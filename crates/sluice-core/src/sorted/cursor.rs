//! Merging cursor over sorted partitions and spilled runs.

use std::cmp::Ordering;
use std::ops::Range;

use super::spill::RunReader;
use super::{AggregatorError, SortedAggregator, State};

/// One tuple yielded by a [`Cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple<'a> {
    /// Serialized key bytes.
    pub key: &'a [u8],
    /// Serialized value bytes.
    pub value: &'a [u8],
}

/// One input of the k-way merge.
///
/// Source order is fixed at cursor creation: for each partition, its
/// spilled run (older data) precedes its in-memory sequence (newer data).
/// Heap ties between equal keys break by source index, which makes the
/// global order deterministic and drains duplicates oldest-first.
enum Source {
    /// Sorted in-memory sequence of one partition.
    Mem { partition: usize, pos: usize },
    /// Spilled run, positioned on its current record.
    Run(RunReader),
}

/// Forward-only cursor over the globally sorted tuple stream.
///
/// Merges every live source through a bounded-fanout min-heap. When an
/// accumulator is configured, equal keys from different sources are folded
/// (in source order) into a single tuple before it is yielded.
///
/// Call [`advance`](Self::advance) before the first [`tuple`](Self::tuple);
/// the cursor mutably borrows the aggregator, so the store cannot change
/// under it.
pub struct Cursor<'a> {
    agg: &'a mut SortedAggregator,
    sources: Vec<Source>,
    /// Min-heap of indices into `sources`, ordered by current key.
    heap: Vec<usize>,
    cur_key: Vec<u8>,
    cur_value: Vec<u8>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        agg: &'a mut SortedAggregator,
        partitions: Range<usize>,
    ) -> Result<Self, AggregatorError> {
        let order = agg.config.byte_order;
        let buffer_size = agg.config.spilling_buffer_size;

        let mut sources = Vec::new();
        for p in partitions {
            let run_path = agg.partitions[p].run.as_ref().map(|r| r.path.clone());
            if let Some(path) = run_path {
                // Position the run on its first record; an empty run
                // contributes no source.
                let primed = (|| -> std::io::Result<Option<RunReader>> {
                    let mut reader = RunReader::open(&path, buffer_size)?;
                    if reader.advance(order)? {
                        Ok(Some(reader))
                    } else {
                        Ok(None)
                    }
                })();
                match primed {
                    Ok(Some(reader)) => sources.push(Source::Run(reader)),
                    Ok(None) => {}
                    Err(e) => {
                        agg.state = State::Broken;
                        return Err(e.into());
                    }
                }
            }
            if agg.partitions[p].sorted_len() > 0 {
                sources.push(Source::Mem { partition: p, pos: 0 });
            }
        }

        let mut cursor = Self {
            agg,
            sources,
            heap: Vec::new(),
            cur_key: Vec::new(),
            cur_value: Vec::new(),
        };
        cursor.heap = (0..cursor.sources.len()).collect();
        for i in (0..cursor.heap.len() / 2).rev() {
            cursor.sift_down(i);
        }
        Ok(cursor)
    }

    /// Moves to the next tuple. Returns `false` once the stream is drained.
    ///
    /// # Errors
    ///
    /// An I/O failure while reading a run moves the aggregator to the
    /// terminal broken state and is returned as `AggregatorError::Io`.
    pub fn advance(&mut self) -> Result<bool, AggregatorError> {
        if self.heap.is_empty() {
            return Ok(false);
        }
        let least = self.heap[0];

        // Copy the least record out before its source moves on.
        let mut key_buf = std::mem::take(&mut self.cur_key);
        let mut value_buf = std::mem::take(&mut self.cur_value);
        key_buf.clear();
        value_buf.clear();
        key_buf.extend_from_slice(self.source_key(least));
        value_buf.extend_from_slice(self.source_value(least));

        self.step_root(least)?;

        // Fold equal keys from the remaining sources, in source order.
        if self.agg.accumulator.is_some() {
            loop {
                let Some(&top) = self.heap.first() else { break };
                if self.agg.comparator.compare(self.source_key(top), &key_buf)
                    != Ordering::Equal
                {
                    break;
                }
                if let Some(acc) = &self.agg.accumulator {
                    acc.combine(self.agg.config.byte_order, &mut value_buf, self.source_value(top));
                }
                self.step_root(top)?;
            }
        }

        self.cur_key = key_buf;
        self.cur_value = value_buf;
        Ok(true)
    }

    /// The current tuple. Valid after `advance` has returned `true`.
    #[must_use]
    pub fn tuple(&self) -> Tuple<'_> {
        Tuple {
            key: &self.cur_key,
            value: &self.cur_value,
        }
    }

    /// Advances the heap root's source, restoring heap order or removing
    /// the source once drained.
    fn step_root(&mut self, source: usize) -> Result<(), AggregatorError> {
        if self.advance_source(source)? {
            self.sift_down(0);
        } else if let Some(last) = self.heap.pop() {
            if !self.heap.is_empty() {
                self.heap[0] = last;
                self.sift_down(0);
            }
        }
        Ok(())
    }

    fn advance_source(&mut self, source: usize) -> Result<bool, AggregatorError> {
        let order = self.agg.config.byte_order;
        match &mut self.sources[source] {
            Source::Mem { partition, pos } => {
                *pos += 1;
                Ok(*pos < self.agg.partitions[*partition].sorted_len())
            }
            Source::Run(reader) => match reader.advance(order) {
                Ok(alive) => Ok(alive),
                Err(e) => {
                    self.agg.state = State::Broken;
                    Err(e.into())
                }
            },
        }
    }

    fn source_key(&self, source: usize) -> &[u8] {
        match &self.sources[source] {
            Source::Mem { partition, pos } => {
                let p = &self.agg.partitions[*partition];
                p.key_at(p.sorted_loc(*pos), self.agg.config.byte_order)
            }
            Source::Run(reader) => reader.key(),
        }
    }

    fn source_value(&self, source: usize) -> &[u8] {
        match &self.sources[source] {
            Source::Mem { partition, pos } => {
                let p = &self.agg.partitions[*partition];
                p.value_at(p.sorted_loc(*pos), self.agg.config.byte_order)
            }
            Source::Run(reader) => reader.value(),
        }
    }

    /// True if source `a` yields before source `b`: key order under the
    /// configured comparator and direction, ties by source index.
    fn source_less(&self, a: usize, b: usize) -> bool {
        match self.agg.key_cmp(self.source_key(a), self.source_key(b)) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a < b,
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        loop {
            let left = 2 * at + 1;
            let right = left + 1;
            let mut smallest = at;
            if left < self.heap.len() && self.source_less(self.heap[left], self.heap[smallest]) {
                smallest = left;
            }
            if right < self.heap.len() && self.source_less(self.heap[right], self.heap[smallest]) {
                smallest = right;
            }
            if smallest == at {
                return;
            }
            self.heap.swap(at, smallest);
            at = smallest;
        }
    }
}
