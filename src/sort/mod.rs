// External sorting of opaque byte records.
//
// Records are buffered in memory until the buffer reaches its size budget, then
// sorted and spilled as one chunk into the next of `fan_in` output files,
// round robin. Once every record has been put, merge passes combine one chunk
// from each file (a "layer") into a single longer chunk, ping-ponging between
// two sets of files, until every file holds at most one chunk. A final k-way
// merge over those chunks yields the fully sorted sequence.
//
// Memory use is bounded by the buffer budget plus one head record per file,
// regardless of how many records go through.
//
// Records comparing equal come out in an unspecified relative order. Callers
// that need a deterministic order must make the comparator total over the
// fields they care about.

use std::{cmp::Ordering, path::Path};

use tracing::debug;

use crate::{
    config::SortConfig,
    fs::WorkDir,
    recfile::{Frame, RecordFile},
    Cancellation, Error, Result,
};

use self::heap::MergeHeap;

pub mod heap;

pub type ByteOrder = fn(&[u8], &[u8]) -> Ordering;

pub fn byte_order(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

// Accounts for the bookkeeping of each buffered record, so that a flood of
// empty records still spills.
const RECORD_OVERHEAD: usize = std::mem::size_of::<Vec<u8>>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filling,
    Sorted,
    Closed,
}

pub struct ExternalSorter<C = ByteOrder> {
    buffer_size: usize,
    fan_in: usize,
    dir: WorkDir,
    buffer: Vec<Vec<u8>>,
    buffered: usize,
    inputs: Vec<RecordFile>,
    outputs: Vec<RecordFile>,
    // Chunks written into `outputs` since they were last truncated.
    chunks: usize,
    spilled: usize,
    passes: usize,
    records: u64,
    heap: MergeHeap<C>,
    phase: Phase,
    cancel: Cancellation,
}

impl ExternalSorter<ByteOrder> {
    pub fn bytewise(config: &SortConfig, parent: Option<&Path>) -> Result<Self> {
        Self::with_comparator(config, parent, byte_order as ByteOrder)
    }
}

impl<C> ExternalSorter<C>
where
    C: Fn(&[u8], &[u8]) -> Ordering,
{
    pub fn with_comparator(config: &SortConfig, parent: Option<&Path>, cmp: C) -> Result<Self> {
        config.validate()?;
        let dir = WorkDir::new(parent, "aard-sort-")?;

        let mut inputs = Vec::with_capacity(config.fan_in);
        let mut outputs = Vec::with_capacity(config.fan_in);
        for i in 0..config.fan_in * 2 {
            let name = format!("sort-{:06}", i);
            let file = RecordFile::new(dir.create(&name)?, dir.join(&name));
            if i < config.fan_in {
                inputs.push(file);
            } else {
                outputs.push(file);
            }
        }

        Ok(ExternalSorter {
            buffer_size: config.buffer_size,
            fan_in: config.fan_in,
            dir,
            buffer: Vec::new(),
            buffered: 0,
            inputs,
            outputs,
            chunks: 0,
            spilled: 0,
            passes: 0,
            records: 0,
            heap: MergeHeap::with_capacity(config.fan_in, cmp),
            phase: Phase::Filling,
            cancel: Cancellation::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn records_put(&self) -> u64 {
        self.records
    }

    pub fn chunks_spilled(&self) -> usize {
        self.spilled
    }

    pub fn merge_passes(&self) -> usize {
        self.passes
    }

    pub fn put(&mut self, record: Vec<u8>) -> Result<()> {
        assert!(
            self.phase == Phase::Filling,
            "records can only be put before sorting"
        );
        self.buffered += record.len() + RECORD_OVERHEAD;
        self.buffer.push(record);
        self.records += 1;

        if self.buffered >= self.buffer_size {
            self.spill()?;
        }
        Ok(())
    }

    fn next_output(&mut self) -> usize {
        let idx = self.chunks % self.fan_in;
        self.chunks += 1;
        idx
    }

    fn spill(&mut self) -> Result<()> {
        self.cancel.check()?;

        let heap = &self.heap;
        self.buffer.sort_unstable_by(|a, b| heap.compare(a, b));

        let idx = self.next_output();
        let out = &mut self.outputs[idx];
        for record in self.buffer.drain(..) {
            out.write_record(&record)?;
        }
        out.mark_end_of_chunk()?;

        debug!(chunk = self.spilled, file = idx, bytes = self.buffered, "spilled chunk");
        self.spilled += 1;
        self.buffered = 0;
        Ok(())
    }

    /// Spills whatever is still buffered and merges until a single k-way
    /// merge over the chunk files yields everything in order.
    pub fn sort(&mut self) -> Result<()> {
        assert!(self.phase == Phase::Filling, "sort may only run once");

        if !self.buffer.is_empty() {
            self.spill()?;
        }

        while self.chunks > self.fan_in {
            self.merge_pass()?;
        }

        self.swap_roles()?;
        self.seed_heap()?;
        self.phase = Phase::Sorted;
        debug!(
            records = self.records,
            chunks = self.spilled,
            passes = self.passes,
            "sort complete"
        );
        Ok(())
    }

    fn swap_roles(&mut self) -> Result<()> {
        std::mem::swap(&mut self.inputs, &mut self.outputs);
        for f in self.inputs.iter_mut() {
            f.rewind()?;
        }
        Ok(())
    }

    fn merge_pass(&mut self) -> Result<()> {
        let layers = self.chunks;
        self.swap_roles()?;
        for f in self.outputs.iter_mut() {
            f.truncate()?;
        }
        self.chunks = 0;

        loop {
            self.cancel.check()?;
            self.seed_heap()?;
            if self.heap.is_empty() {
                break;
            }
            let idx = self.next_output();
            while let Some(record) = self.next_merged()? {
                self.outputs[idx].write_record(&record)?;
            }
            self.outputs[idx].mark_end_of_chunk()?;
        }

        self.passes += 1;
        debug!(pass = self.passes, from = layers, to = self.chunks, "merge pass");
        Ok(())
    }

    // Loads the first record of the next chunk of every input file.
    fn seed_heap(&mut self) -> Result<()> {
        self.heap.clear();
        for (source, f) in self.inputs.iter_mut().enumerate() {
            if let Frame::Record(record) = f.read_record()? {
                self.heap.push(record, source);
            }
        }
        Ok(())
    }

    fn next_merged(&mut self) -> Result<Option<Vec<u8>>> {
        self.cancel.check()?;
        let source = match self.heap.peek() {
            Some(head) => head.source,
            None => return Ok(None),
        };
        let record = match self.inputs[source].read_record()? {
            Frame::Record(next) => self.heap.replace_top(next),
            Frame::EndOfChunk | Frame::EndOfStream => self.heap.pop().map(|h| h.record),
        };
        Ok(record)
    }

    /// Returns the next record in sorted order. Only valid after `sort`.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        match self.phase {
            Phase::Filling => panic!("next_record called before sort"),
            Phase::Sorted => self.next_merged(),
            Phase::Closed => Err(Error::Config("sorter was already cleaned up".into())),
        }
    }

    pub fn records(&mut self) -> Records<'_, C> {
        Records { sorter: self }
    }

    /// Closes and removes every chunk file and the work dir. Safe to call at
    /// any point, including after a failed or cancelled run, and more than
    /// once.
    pub fn cleanup(&mut self) -> Result<()> {
        self.phase = Phase::Closed;
        self.buffer = Vec::new();
        self.buffered = 0;
        self.heap.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.dir.cleanup()
    }
}

impl<C> Drop for ExternalSorter<C> {
    fn drop(&mut self) {
        // Close the chunk files before their directory goes away.
        self.inputs.clear();
        self.outputs.clear();
        if let Err(e) = self.dir.cleanup() {
            debug!(error = %e, "failed to remove sort work dir");
        }
    }
}

pub struct Records<'a, C> {
    sorter: &'a mut ExternalSorter<C>,
}

impl<'a, C> Iterator for Records<'a, C>
where
    C: Fn(&[u8], &[u8]) -> Ordering,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.sorter.next_record().transpose()
    }
}
