//! Incremental spill passes and the on-disk run format.
//!
//! A spill pass walks the partitions round-robin. For each partition with
//! in-memory tuples it sorts them, merges them with the partition's
//! existing run (if any) into a fresh run file, and returns the partition's
//! blocks to the pool. Work is sliced: each [`SpillPass::next_chunk`] call
//! writes at most `spilling_chunk_size` bytes, so the caller keeps strict
//! back-pressure control.
//!
//! Run files carry no header or checksum; they are transient, consumed
//! only by the same process: a sequence of
//! `u32 key_len, key, u32 value_len, value` records in the configured byte
//! order, sorted under the configured comparator and direction. Fresh runs
//! are written to `run-<id>.tmp` and renamed to `run-<id>` when the pass
//! completes.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{AggregatorError, SortedAggregator, State};
use crate::tuple::{self, ByteOrder, LENGTH_FIELD};

/// A partition's spilled run on disk.
#[derive(Debug)]
pub(crate) struct RunFile {
    pub(crate) path: PathBuf,
}

/// Buffered sequential writer for one run file.
pub(crate) struct RunWriter {
    out: BufWriter<File>,
}

impl RunWriter {
    pub(crate) fn create(path: &Path, buffer_size: usize) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::with_capacity(buffer_size, file),
        })
    }

    /// Writes one record and returns its encoded size.
    #[allow(clippy::cast_possible_truncation)] // record lengths are validated at ingestion
    pub(crate) fn write_record(
        &mut self,
        order: ByteOrder,
        key: &[u8],
        value: &[u8],
    ) -> io::Result<usize> {
        let mut len = [0u8; LENGTH_FIELD];
        order.write_u32(&mut len, key.len() as u32);
        self.out.write_all(&len)?;
        self.out.write_all(key)?;
        order.write_u32(&mut len, value.len() as u32);
        self.out.write_all(&len)?;
        self.out.write_all(value)?;
        Ok(tuple::record_len(key, value))
    }

    pub(crate) fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Buffered sequential reader over one run file.
///
/// Holds the current record in owned buffers; `advance` loads the next
/// record and reports `false` at a clean end of file.
pub(crate) struct RunReader {
    input: BufReader<File>,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl RunReader {
    pub(crate) fn open(path: &Path, buffer_size: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            input: BufReader::with_capacity(buffer_size, file),
            key: Vec::new(),
            value: Vec::new(),
        })
    }

    /// Loads the next record. Returns `false` at end of file; a truncated
    /// record surfaces as an I/O error.
    pub(crate) fn advance(&mut self, order: ByteOrder) -> io::Result<bool> {
        if self.input.fill_buf()?.is_empty() {
            return Ok(false);
        }
        let mut len = [0u8; LENGTH_FIELD];
        self.input.read_exact(&mut len)?;
        let key_len = order.read_u32(&len) as usize;
        self.key.resize(key_len, 0);
        self.input.read_exact(&mut self.key)?;

        self.input.read_exact(&mut len)?;
        let value_len = order.read_u32(&len) as usize;
        self.value.resize(value_len, 0);
        self.input.read_exact(&mut self.value)?;
        Ok(true)
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }
}

/// A fresh run waiting for its atomic rename at pass completion.
struct PendingRun {
    partition: usize,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

/// Merge state for the partition currently being spilled.
struct PartitionMerge {
    partition: usize,
    /// Position in the partition's sorted in-memory sequence.
    mem_pos: usize,
    /// Reader over the partition's previous run, holding its current
    /// record; `None` once exhausted (or when no previous run exists).
    disk: Option<RunReader>,
    writer: RunWriter,
    tmp_path: PathBuf,
    final_path: PathBuf,
    /// Scratch space for associative combines during the merge.
    combine_buf: Vec<u8>,
}

/// Progress of one spill pass, owned by the aggregator while the pass runs.
pub(crate) struct SpillProgress {
    next_partition: usize,
    current: Option<PartitionMerge>,
    pending: Vec<PendingRun>,
    /// Set once every partition has been written out; gates `finish`.
    done: bool,
}

impl SpillProgress {
    pub(crate) fn new() -> Self {
        Self {
            next_partition: 0,
            current: None,
            pending: Vec::new(),
            done: false,
        }
    }
}

/// Which source provides the next record of the merge.
enum MergeStep {
    Mem,
    Disk,
    Combined,
}

/// Handle over an active spill pass.
///
/// The handle mutably borrows the aggregator, so no other operation can be
/// interleaved with the pass: ingestion during spilling is rejected at
/// compile time. Drive the pass with [`next_chunk`](Self::next_chunk) until
/// it returns `true`, then call [`finish`](Self::finish). Dropping the
/// handle without finishing leaves the aggregator mid-pass; only `dispose`
/// recovers from that.
pub struct SpillPass<'a> {
    pub(crate) agg: &'a mut SortedAggregator,
}

impl SpillPass<'_> {
    /// Advances the pass by at most one chunk of `spilling_chunk_size`
    /// bytes. Returns `true` once every partition has been spilled.
    ///
    /// # Errors
    ///
    /// An I/O failure moves the aggregator to the terminal broken state and
    /// is returned as `AggregatorError::Io`.
    pub fn next_chunk(&mut self) -> Result<bool, AggregatorError> {
        self.agg.spill_next_chunk()
    }

    /// Completes the pass: deletes each merged partition's previous run and
    /// atomically renames the fresh runs into place.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidState` if chunks remain, or
    /// `AggregatorError::Io` (entering the broken state) if a rename fails.
    pub fn finish(self) -> Result<(), AggregatorError> {
        self.agg.finish_spilling()
    }
}

impl SortedAggregator {
    pub(crate) fn spill_next_chunk(&mut self) -> Result<bool, AggregatorError> {
        let Some(mut progress) = self.spill.take() else {
            return Err(AggregatorError::InvalidState {
                op: "next_chunk",
                state: self.state_name(),
            });
        };
        let result = self.drive_spill(&mut progress);
        if matches!(result, Ok(true)) {
            progress.done = true;
        }
        self.spill = Some(progress);
        match result {
            Ok(done) => Ok(done),
            Err(e) => {
                self.state = State::Broken;
                Err(e)
            }
        }
    }

    fn drive_spill(&mut self, progress: &mut SpillProgress) -> Result<bool, AggregatorError> {
        let mut written = 0usize;
        loop {
            if progress.current.is_none() {
                while progress.next_partition < self.partitions.len()
                    && self.partitions[progress.next_partition].tuple_count() == 0
                {
                    progress.next_partition += 1;
                }
                if progress.next_partition >= self.partitions.len() {
                    return Ok(true);
                }
                if written >= self.config.spilling_chunk_size {
                    // Budget exhausted; the next call opens this partition.
                    return Ok(false);
                }
                let partition = progress.next_partition;
                progress.next_partition += 1;
                progress.current = Some(self.open_partition_merge(partition)?);
            }

            let partition_done = match progress.current.as_mut() {
                Some(merge) => self.step_merge(merge, &mut written)?,
                None => true,
            };
            if !partition_done {
                return Ok(false);
            }
            if let Some(merge) = progress.current.take() {
                let partition = merge.partition;
                merge.writer.finish()?;
                progress.pending.push(PendingRun {
                    partition,
                    tmp_path: merge.tmp_path,
                    final_path: merge.final_path,
                });
                self.partitions[partition].release_blocks(&mut self.pool);
                trace!(partition, "partition spill complete, blocks released");
            }
        }
    }

    fn open_partition_merge(&mut self, partition: usize) -> Result<PartitionMerge, AggregatorError> {
        self.sort_partition(partition);
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        let dir = self.partition_dir(partition);
        let tmp_path = dir.join(format!("run-{run_id}.tmp"));
        let final_path = dir.join(format!("run-{run_id}"));
        let writer = RunWriter::create(&tmp_path, self.config.spilling_buffer_size)?;
        let disk = match &self.partitions[partition].run {
            Some(run) => {
                let mut reader = RunReader::open(&run.path, self.config.spilling_buffer_size)?;
                if reader.advance(self.config.byte_order)? {
                    Some(reader)
                } else {
                    None
                }
            }
            None => None,
        };
        debug!(
            partition,
            run = run_id,
            tuples = self.partitions[partition].tuple_count(),
            merging_previous_run = disk.is_some(),
            "starting partition spill"
        );
        Ok(PartitionMerge {
            partition,
            mem_pos: 0,
            disk,
            writer,
            tmp_path,
            final_path,
            combine_buf: Vec::new(),
        })
    }

    /// Runs the two-way merge until the chunk budget is exhausted or the
    /// partition is fully written. Returns `true` when the partition is
    /// done, `false` when the budget ran out first.
    fn step_merge(
        &self,
        merge: &mut PartitionMerge,
        written: &mut usize,
    ) -> Result<bool, AggregatorError> {
        let order = self.config.byte_order;
        let chunk = self.config.spilling_chunk_size;
        let partition = &self.partitions[merge.partition];

        loop {
            if *written >= chunk {
                return Ok(false);
            }
            let mem_has = merge.mem_pos < partition.sorted_len();
            let step = match (&merge.disk, mem_has) {
                (None, false) => return Ok(true),
                (None, true) => MergeStep::Mem,
                (Some(_), false) => MergeStep::Disk,
                (Some(reader), true) => {
                    let mem_key = partition.key_at(partition.sorted_loc(merge.mem_pos), order);
                    match self.key_cmp(reader.key(), mem_key) {
                        Ordering::Less => MergeStep::Disk,
                        Ordering::Greater => MergeStep::Mem,
                        Ordering::Equal => {
                            // Equal keys across the two sources: combine now
                            // only if the accumulator tolerates staged
                            // combines; otherwise keep both records, disk
                            // (older) first.
                            if self
                                .accumulator
                                .as_ref()
                                .is_some_and(|a| a.is_associative())
                            {
                                MergeStep::Combined
                            } else {
                                MergeStep::Disk
                            }
                        }
                    }
                }
            };

            match step {
                MergeStep::Mem => {
                    let loc = partition.sorted_loc(merge.mem_pos);
                    let (key, value) = partition.record_at(loc, order);
                    *written += merge.writer.write_record(order, key, value)?;
                    merge.mem_pos += 1;
                }
                MergeStep::Disk => {
                    if let Some(reader) = merge.disk.as_mut() {
                        *written += merge.writer.write_record(order, reader.key(), reader.value())?;
                        if !reader.advance(order)? {
                            merge.disk = None;
                        }
                    }
                }
                MergeStep::Combined => {
                    if let Some(reader) = merge.disk.as_mut() {
                        let loc = partition.sorted_loc(merge.mem_pos);
                        merge.combine_buf.clear();
                        merge.combine_buf.extend_from_slice(reader.value());
                        if let Some(acc) = &self.accumulator {
                            acc.combine(order, &mut merge.combine_buf, partition.value_at(loc, order));
                        }
                        *written +=
                            merge.writer.write_record(order, reader.key(), &merge.combine_buf)?;
                        merge.mem_pos += 1;
                        if !reader.advance(order)? {
                            merge.disk = None;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn finish_spilling(&mut self) -> Result<(), AggregatorError> {
        let Some(progress) = self.spill.take() else {
            return Err(AggregatorError::InvalidState {
                op: "finish",
                state: self.state_name(),
            });
        };
        if !progress.done {
            self.spill = Some(progress);
            return Err(AggregatorError::InvalidState {
                op: "finish",
                state: "spill pass incomplete",
            });
        }
        match self.commit_runs(progress.pending) {
            Ok(()) => {
                self.state = State::Accepting;
                debug!("spill pass finished");
                Ok(())
            }
            Err(e) => {
                self.state = State::Broken;
                Err(e)
            }
        }
    }

    fn commit_runs(&mut self, pending: Vec<PendingRun>) -> Result<(), AggregatorError> {
        for run in pending {
            if let Some(old) = self.partitions[run.partition].run.take() {
                std::fs::remove_file(&old.path)?;
                trace!(partition = run.partition, path = %old.path.display(), "removed merged run");
            }
            std::fs::rename(&run.tmp_path, &run.final_path)?;
            debug!(partition = run.partition, path = %run.final_path.display(), "run committed");
            self.partitions[run.partition].run = Some(RunFile {
                path: run.final_path,
            });
        }
        Ok(())
    }
}
