//! # Mutable Buffer Module
//!
//! The write front-end of the framework: a fixed-capacity append-only
//! ring of wrapped records, doubling as the smallest queryable partition.
//!
//! ## Design Invariants
//!
//! - `head` and `tail` are monotonic logical positions; slot index is
//!   `position % (2 * hwm)`.
//! - `tail - head ≤ hwm` at every observable state; appends beyond the
//!   high watermark are rejected, never blocked.
//! - Records at `[head, tail)` are live. Reconstruction advances `head`
//!   past absorbed records only once no view pins an older generation.
//! - A published record is immutable except for its atomic header
//!   (tagged deletes).
//! - At most **two** head generations are outstanding at once. Slot
//!   capacity is twice the high watermark, so the region a stale view
//!   may still read is never overwritten before the view drops.
//!
//! ## Append Protocol
//!
//! A writer reserves a logical position with a CAS on the reservation
//! counter, writes the slot, then publishes by advancing the visible
//! tail — in position order, so a view's `[head, tail)` range never
//! contains an unwritten slot. Views are wait-free: one pin increment
//! on the active head generation plus one acquire load of the tail.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::record::{Record, Wrapped};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`MutableBuffer`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer is at its high watermark; the caller retries once a
    /// reconstruction has drained it.
    #[error("Buffer is at its high watermark")]
    Saturated,

    /// Head advancement would overtake records still pinned by a view.
    #[error("Buffer head is pinned by an outstanding view")]
    Pinned,
}

// ------------------------------------------------------------------------------------------------
// Head generations
// ------------------------------------------------------------------------------------------------

/// One head generation: a fixed head position plus the number of views
/// pinning it.
struct HeadGen {
    position: AtomicUsize,
    pins: AtomicUsize,
}

// ------------------------------------------------------------------------------------------------
// MutableBuffer
// ------------------------------------------------------------------------------------------------

/// One record slot. Written exclusively by the thread that reserved the
/// position, read-only once published.
struct Slot<R>(UnsafeCell<MaybeUninit<Wrapped<R>>>);

/// The lock-amortized append-only ring buffer.
///
/// Writers contend only on two atomic counters; readers take wait-free
/// [`BufferView`]s. The buffer owns every record between the oldest
/// outstanding head generation and the visible tail.
pub struct MutableBuffer<R: Record> {
    slots: Box<[Slot<R>]>,
    lwm: usize,
    hwm: usize,

    /// Next logical position to reserve (CAS).
    reserved: AtomicUsize,
    /// Positions `< visible` are published and readable.
    visible: AtomicUsize,

    /// The two outstanding head generations; `active` indexes the newer.
    heads: [HeadGen; 2],
    active: AtomicUsize,

    /// Stats over the live region `[head, visible)`.
    tombstones: AtomicUsize,
    deleted: AtomicUsize,
    /// f64 bit patterns; updated by CAS.
    total_weight: AtomicU64,
    /// Running maximum, never decremented. An over-approximation the
    /// rejection sampler tolerates by construction.
    max_weight: AtomicU64,
}

// SAFETY: a slot is written by exactly one thread (the one that won the
// position CAS) strictly before the position becomes visible; after
// publication the slot is read-only until its logical position falls a
// full capacity behind the reservation counter, which the two-generation
// head protocol guarantees cannot happen while any view still covers it.
// Record headers are atomic, so concurrent tagging through shared
// references is sound.
unsafe impl<R: Record> Send for MutableBuffer<R> {}
unsafe impl<R: Record> Sync for MutableBuffer<R> {}

impl<R: Record> MutableBuffer<R> {
    /// Creates a buffer with the given low and high watermarks.
    ///
    /// Watermark validation happens at the facade's config layer; this
    /// constructor assumes `0 < lwm < hwm`.
    pub fn new(lwm: usize, hwm: usize) -> Self {
        let cap = hwm * 2;
        let mut slots = Vec::with_capacity(cap);
        for _ in 0..cap {
            slots.push(Slot(UnsafeCell::new(MaybeUninit::uninit())));
        }

        Self {
            slots: slots.into_boxed_slice(),
            lwm,
            hwm,
            reserved: AtomicUsize::new(0),
            visible: AtomicUsize::new(0),
            heads: [
                HeadGen {
                    position: AtomicUsize::new(0),
                    pins: AtomicUsize::new(0),
                },
                HeadGen {
                    position: AtomicUsize::new(0),
                    pins: AtomicUsize::new(0),
                },
            ],
            active: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            total_weight: AtomicU64::new(0f64.to_bits()),
            max_weight: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Appends a record, optionally as a tombstone.
    ///
    /// Succeeds iff the live region is below the high watermark. On
    /// success the record is visible to every view taken afterwards.
    pub fn append(&self, rec: R, is_tombstone: bool) -> Result<(), BufferError> {
        let weight = if is_tombstone { 0.0 } else { rec.weight() };

        // 1. Reserve a position.
        let pos = loop {
            let tail = self.reserved.load(Ordering::Relaxed);
            let head = self.head();
            if tail - head >= self.hwm {
                return Err(BufferError::Saturated);
            }
            match self.reserved.compare_exchange_weak(
                tail,
                tail + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break tail,
                Err(_) => std::hint::spin_loop(),
            }
        };

        // 2. Write the slot.
        let wrapped = if is_tombstone {
            Wrapped::new_tombstone(rec)
        } else {
            Wrapped::new(rec)
        };
        let slot = &self.slots[pos % self.slots.len()];
        // SAFETY: position `pos` was reserved by this thread alone. If the
        // slot was used a full lap ago (pos >= capacity), its previous
        // occupant is below every outstanding head generation and no view
        // can reach it, so dropping it here is sound.
        unsafe {
            let cell = &mut *slot.0.get();
            if pos >= self.slots.len() {
                cell.assume_init_drop();
            }
            cell.write(wrapped);
        }

        // 3. Account stats before publication so views never observe a
        //    published record the counters have not caught up with.
        if is_tombstone {
            self.tombstones.fetch_add(1, Ordering::AcqRel);
        } else {
            add_f64(&self.total_weight, weight);
            max_f64(&self.max_weight, weight);
        }

        // 4. Publish in position order.
        while self
            .visible
            .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        trace!(pos, is_tombstone, "buffer append");
        Ok(())
    }

    /// Takes a consistent snapshot of the live region.
    ///
    /// The view pins the current head generation; while it lives, the
    /// head cannot advance past the snapshot's range more than once.
    pub fn view(&self) -> BufferView<'_, R> {
        let generation = loop {
            let g = self.active.load(Ordering::Acquire);
            self.heads[g].pins.fetch_add(1, Ordering::AcqRel);
            if self.active.load(Ordering::Acquire) == g {
                break g;
            }
            // A head flip raced the pin; release and retry on the new
            // generation.
            self.heads[g].pins.fetch_sub(1, Ordering::AcqRel);
        };

        let head = self.heads[generation].position.load(Ordering::Acquire);
        let tail = self.visible.load(Ordering::Acquire);

        BufferView {
            buffer: self,
            generation,
            head,
            tail,
            tombstones: self.tombstones.load(Ordering::Acquire),
            total_weight: f64::from_bits(self.total_weight.load(Ordering::Acquire)),
            max_weight: f64::from_bits(self.max_weight.load(Ordering::Acquire)),
        }
    }

    /// Advances the head past records a reconstruction has absorbed.
    ///
    /// Fails with [`BufferError::Pinned`] while any view still pins the
    /// previous head generation; the caller retries rather than blocking
    /// a scheduler worker.
    pub fn advance_head(&self, new_head: usize) -> Result<(), BufferError> {
        let cur = self.active.load(Ordering::Acquire);
        let prev = 1 - cur;
        let cur_head = self.heads[cur].position.load(Ordering::Acquire);

        debug_assert!(new_head >= cur_head);
        debug_assert!(new_head <= self.visible.load(Ordering::Acquire));

        if self.heads[prev].pins.load(Ordering::Acquire) != 0 {
            return Err(BufferError::Pinned);
        }

        // Retire live-region stats for the absorbed range. Safe to read:
        // every position below the visible tail is published.
        let mut tombstones = 0usize;
        let mut deleted = 0usize;
        let mut weight = 0.0f64;
        for pos in cur_head..new_head {
            let w = self.slot_ref(pos);
            if w.is_tombstone() {
                tombstones += 1;
            } else {
                weight += w.rec().weight();
                if w.is_deleted() {
                    deleted += 1;
                }
            }
        }

        self.heads[prev].position.store(new_head, Ordering::Release);
        self.active.store(prev, Ordering::Release);

        self.tombstones.fetch_sub(tombstones, Ordering::AcqRel);
        self.deleted.fetch_sub(deleted, Ordering::AcqRel);
        add_f64(&self.total_weight, -weight);

        trace!(
            old_head = cur_head,
            new_head, tombstones, "buffer head advanced"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Occupancy and stats
    // --------------------------------------------------------------------------------------------

    pub fn at_low_watermark(&self) -> bool {
        self.visible.load(Ordering::Acquire) - self.head() >= self.lwm
    }

    pub fn is_full(&self) -> bool {
        self.reserved.load(Ordering::Acquire) - self.head() >= self.hwm
    }

    /// Number of records in the live region, tombstones included.
    pub fn record_count(&self) -> usize {
        self.visible.load(Ordering::Acquire) - self.head()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.load(Ordering::Acquire)
    }

    /// Number of tagged-deleted records in the live region.
    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn total_weight(&self) -> f64 {
        f64::from_bits(self.total_weight.load(Ordering::Acquire))
    }

    pub fn max_weight(&self) -> f64 {
        f64::from_bits(self.max_weight.load(Ordering::Acquire))
    }

    /// High watermark: the buffer's record capacity.
    pub fn capacity(&self) -> usize {
        self.hwm
    }

    /// Bytes held by the slot array.
    pub fn memory_usage(&self) -> usize {
        self.slots.len() * size_of::<Wrapped<R>>()
    }

    pub fn low_watermark(&self) -> usize {
        self.lwm
    }

    /// Current head position of the active generation.
    pub fn head(&self) -> usize {
        let generation = self.active.load(Ordering::Acquire);
        self.heads[generation].position.load(Ordering::Acquire)
    }

    /// Current visible tail position.
    pub fn tail(&self) -> usize {
        self.visible.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Internal slot access
    // --------------------------------------------------------------------------------------------

    fn slot_ref(&self, pos: usize) -> &Wrapped<R> {
        // SAFETY: callers only pass positions below the visible tail and
        // at or above the oldest outstanding head generation; such slots
        // are published, initialized, and not eligible for reuse.
        unsafe { (*self.slots[pos % self.slots.len()].0.get()).assume_init_ref() }
    }
}

impl<R: Record> Drop for MutableBuffer<R> {
    fn drop(&mut self) {
        let tail = *self.visible.get_mut();
        let cap = self.slots.len();
        let first_live_slot = tail.saturating_sub(cap);
        for pos in first_live_slot..tail {
            // SAFETY: exclusive access in Drop; exactly the slots holding
            // the most recent occupant per index are initialized.
            unsafe {
                (*self.slots[pos % cap].0.get()).assume_init_drop();
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BufferView
// ------------------------------------------------------------------------------------------------

/// A pinned snapshot of the buffer's `[head, tail)` range.
///
/// While the view lives, the records it covers stay readable — the head
/// protocol refuses to recycle their slots. Dropping the view releases
/// the pin.
pub struct BufferView<'a, R: Record> {
    buffer: &'a MutableBuffer<R>,
    generation: usize,
    head: usize,
    tail: usize,
    tombstones: usize,
    total_weight: f64,
    max_weight: f64,
}

impl<'a, R: Record> BufferView<'a, R> {
    /// Number of records covered by this view, tombstones included.
    pub fn record_count(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    /// Head position this view was pinned at.
    pub fn head(&self) -> usize {
        self.head
    }

    /// Tail snapshot; a flush that absorbed this view advances the
    /// buffer head to exactly this position.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Tombstone count of the live region at pin time.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Total live-record weight at pin time.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Upper bound on any single record's weight at pin time.
    pub fn max_weight(&self) -> f64 {
        self.max_weight
    }

    /// The record at view-relative index `idx`, insertion order.
    pub fn get(&self, idx: usize) -> Option<&Wrapped<R>> {
        if idx >= self.record_count() {
            return None;
        }
        Some(self.buffer.slot_ref(self.head + idx))
    }

    /// Iterates the covered records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &Wrapped<R>> {
        (self.head..self.tail).map(|pos| self.buffer.slot_ref(pos))
    }

    /// Clones the covered records out of the ring, insertion order.
    pub fn clone_records(&self) -> Vec<Wrapped<R>> {
        self.records().cloned().collect()
    }

    /// Tags the **oldest** matching live record as deleted.
    ///
    /// Returns `true` if a record was tagged. Part of the tagging delete
    /// path; the buffer is probed before any shard because it holds the
    /// freshest data.
    pub fn tag_delete(&self, rec: &R) -> bool {
        for w in self.records() {
            if w.rec() == rec && w.is_visible() && w.set_deleted() {
                self.buffer.deleted.fetch_add(1, Ordering::AcqRel);
                return true;
            }
        }
        false
    }

    /// Looks for a tombstone matching `rec` within this view.
    pub fn contains_tombstone(&self, rec: &R) -> bool {
        self.records().any(|w| w.is_tombstone() && w.rec() == rec)
    }
}

impl<R: Record> Drop for BufferView<'_, R> {
    fn drop(&mut self) {
        self.buffer.heads[self.generation]
            .pins
            .fetch_sub(1, Ordering::AcqRel);
    }
}

// ------------------------------------------------------------------------------------------------
// Atomic f64 helpers
// ------------------------------------------------------------------------------------------------

fn add_f64(cell: &AtomicU64, delta: f64) {
    let mut cur = cell.load(Ordering::Acquire);
    loop {
        let next = (f64::from_bits(cur) + delta).to_bits();
        match cell.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => cur = observed,
        }
    }
}

fn max_f64(cell: &AtomicU64, candidate: f64) {
    let mut cur = cell.load(Ordering::Acquire);
    while candidate > f64::from_bits(cur) {
        match cell.compare_exchange_weak(
            cur,
            candidate.to_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(observed) => cur = observed,
        }
    }
}
