//! Merge primitives over wrapped-record streams.
//!
//! [`WrappedMerge`] combines any number of individually sorted
//! [`Wrapped`] streams into one globally sorted stream.
//! [`TombstoneCancel`] filters a sorted stream, dropping tagged-deleted
//! records and cancelling live-record/tombstone pairs. Every
//! shard-producing operation (buffer flush, multi-way shard merge,
//! snapshot) is built from these two pieces.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::record::{Record, Wrapped};

// ------------------------------------------------------------------------------------------------
// WrappedMerge — heap-based k-way merge
// ------------------------------------------------------------------------------------------------

/// A heap-based merge iterator yielding [`Wrapped`] records from multiple
/// sorted sources in envelope order (record ASC, tombstone flag ASC).
///
/// The lifetime `'a` bounds any borrowed state inside the source
/// iterators; pass `'static` when the sources own their data.
pub struct WrappedMerge<'a, R: Record> {
    iters: Vec<Box<dyn Iterator<Item = Wrapped<R>> + 'a>>,
    heap: BinaryHeap<MergeHeapEntry<R>>,
}

struct MergeHeapEntry<R: Record> {
    record: Wrapped<R>,
    source_idx: usize,
}

impl<R: Record> Ord for MergeHeapEntry<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so the smallest envelope pops first.
        self.record.cmp(&other.record).reverse()
    }
}

impl<R: Record> PartialOrd for MergeHeapEntry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Record> PartialEq for MergeHeapEntry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record
    }
}

impl<R: Record> Eq for MergeHeapEntry<R> {}

impl<'a, R: Record> WrappedMerge<'a, R> {
    pub fn new(mut iters: Vec<Box<dyn Iterator<Item = Wrapped<R>> + 'a>>) -> Self {
        let mut heap = BinaryHeap::new();

        for (idx, iter) in iters.iter_mut().enumerate() {
            if let Some(record) = iter.next() {
                heap.push(MergeHeapEntry {
                    record,
                    source_idx: idx,
                });
            }
        }

        Self { iters, heap }
    }
}

impl<R: Record> Iterator for WrappedMerge<'_, R> {
    type Item = Wrapped<R>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        let result = entry.record;
        let idx = entry.source_idx;

        if let Some(next_record) = self.iters[idx].next() {
            self.heap.push(MergeHeapEntry {
                record: next_record,
                source_idx: idx,
            });
        }

        Some(result)
    }
}

// ------------------------------------------------------------------------------------------------
// TombstoneCancel — cancellation filter over a sorted stream
// ------------------------------------------------------------------------------------------------

/// Filters a sorted envelope stream, applying deletion semantics:
///
/// - Tagged-deleted records are dropped outright.
/// - A tombstone cancels against one preceding live record with the
///   identical inner record; both are dropped.
/// - Tombstones with no matching live record pass through unchanged —
///   their victim may live in a partition outside this merge. When the
///   merge provably covers every partition the victim could inhabit
///   (the bottom of the hierarchy), the caller disables retention and
///   unmatched tombstones are dropped as spent.
///
/// The input **must** be sorted in envelope order (the order produced by
/// [`WrappedMerge`]): all live copies of a record value directly precede
/// its tombstones, so cancellation is a bounded local scan.
pub struct TombstoneCancel<R, I>
where
    R: Record,
    I: Iterator<Item = Wrapped<R>>,
{
    input: I,
    retain_tombstones: bool,
    /// Pending live records, all carrying the same inner record value,
    /// not yet emitted because a following tombstone may cancel them.
    run: Vec<Wrapped<R>>,
    /// Records ready to emit, in order.
    ready: std::collections::VecDeque<Wrapped<R>>,
    exhausted: bool,
}

impl<R, I> TombstoneCancel<R, I>
where
    R: Record,
    I: Iterator<Item = Wrapped<R>>,
{
    pub fn new(input: I) -> Self {
        Self::with_retention(input, true)
    }

    /// As [`TombstoneCancel::new`], with explicit control over whether
    /// unmatched tombstones survive the pass.
    pub fn with_retention(input: I, retain_tombstones: bool) -> Self {
        Self {
            input,
            retain_tombstones,
            run: Vec::new(),
            ready: std::collections::VecDeque::new(),
            exhausted: false,
        }
    }

    fn flush_run(&mut self) {
        self.ready.extend(self.run.drain(..));
    }
}

impl<R, I> Iterator for TombstoneCancel<R, I>
where
    R: Record,
    I: Iterator<Item = Wrapped<R>>,
{
    type Item = Wrapped<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(out) = self.ready.pop_front() {
                return Some(out);
            }
            if self.exhausted {
                return self.run.pop();
            }

            match self.input.next() {
                None => {
                    self.exhausted = true;
                    self.flush_run();
                }

                Some(w) if w.is_deleted() => {}

                Some(w) if w.is_tombstone() => {
                    // The run holds live records sorting no later than this
                    // tombstone; same inner record means cancellation.
                    if self.run.last().is_some_and(|live| w.cancels(live)) {
                        self.run.pop();
                    } else {
                        self.flush_run();
                        if self.retain_tombstones {
                            self.ready.push_back(w);
                        }
                    }
                }

                Some(w) => {
                    if self
                        .run
                        .last()
                        .is_some_and(|prev| prev.rec() != w.rec())
                    {
                        self.flush_run();
                    }
                    self.run.push(w);
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Convenience entry points
// ------------------------------------------------------------------------------------------------

/// Merges multiple sorted envelope streams and applies tombstone
/// cancellation in one pass.
pub fn merge_and_cancel<'a, R: Record>(
    iters: Vec<Box<dyn Iterator<Item = Wrapped<R>> + 'a>>,
    retain_tombstones: bool,
) -> TombstoneCancel<R, WrappedMerge<'a, R>> {
    TombstoneCancel::with_retention(WrappedMerge::new(iters), retain_tombstones)
}

/// Sorts an unordered batch of envelopes (e.g. a buffer view's insertion
/// order) and applies tombstone cancellation.
pub fn sort_and_cancel<R: Record>(
    mut records: Vec<Wrapped<R>>,
    retain_tombstones: bool,
) -> Vec<Wrapped<R>> {
    records.sort();
    TombstoneCancel::with_retention(records.into_iter(), retain_tombstones).collect()
}
