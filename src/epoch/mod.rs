//! # Epoch Module
//!
//! An epoch is an immutable snapshot binding one structure version to
//! one buffer head position. Readers pin an epoch for the duration of a
//! query; reconstructions publish a new epoch and never mutate a
//! published one, so a pinned reader sees the old world or the new world
//! in its entirety — never a hybrid.
//!
//! ## Reclamation
//!
//! Ownership is purely reference-counted: an epoch holds a strong
//! reference to its structure, the structure holds strong references to
//! its shards, and queries hold strong references to the epoch they
//! pinned. Retiring an epoch is dropping the facade's last `Arc` to it;
//! the structure and any shard reachable from no other epoch unwind
//! behind it. There is no sweep.
//!
//! ## Slots
//!
//! The facade keeps three slots — `previous`, `current`, `next` — behind
//! one mutex. Transitions are rare (once per reconstruction); readers
//! touch the mutex only long enough to clone an `Arc`.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

use crate::record::Record;
use crate::shard::Shard;
use crate::structure::ExtensionStructure;

// ------------------------------------------------------------------------------------------------
// Epoch
// ------------------------------------------------------------------------------------------------

/// One immutable (structure version, buffer head) snapshot.
pub struct Epoch<R: Record, S: Shard<R>> {
    id: u64,
    structure: Arc<ExtensionStructure<R, S>>,
    head_at_start: usize,
}

impl<R: Record, S: Shard<R>> Epoch<R, S> {
    pub fn new(id: u64, structure: Arc<ExtensionStructure<R, S>>, head_at_start: usize) -> Self {
        Self {
            id,
            structure,
            head_at_start,
        }
    }

    /// Strictly increasing across publishes.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn structure(&self) -> &ExtensionStructure<R, S> {
        &self.structure
    }

    /// Buffer head position at the instant this epoch was published.
    pub fn head_at_start(&self) -> usize {
        self.head_at_start
    }
}

impl<R: Record, S: Shard<R>> Drop for Epoch<R, S> {
    fn drop(&mut self) {
        trace!(id = self.id, "epoch retired");
    }
}

// ------------------------------------------------------------------------------------------------
// EpochManager
// ------------------------------------------------------------------------------------------------

struct EpochSlots<R: Record, S: Shard<R>> {
    previous: Option<Arc<Epoch<R, S>>>,
    current: Option<Arc<Epoch<R, S>>>,
    next: Option<Arc<Epoch<R, S>>>,
}

/// The facade's three epoch slots plus the transition condition.
pub struct EpochManager<R: Record, S: Shard<R>> {
    slots: Mutex<EpochSlots<R, S>>,
    transitioned: Condvar,
}

impl<R: Record, S: Shard<R>> EpochManager<R, S> {
    /// Starts with `initial` as the current epoch.
    pub fn new(initial: Epoch<R, S>) -> Self {
        Self {
            slots: Mutex::new(EpochSlots {
                previous: None,
                current: Some(Arc::new(initial)),
                next: None,
            }),
            transitioned: Condvar::new(),
        }
    }

    /// Pins and returns the active epoch.
    ///
    /// `current` answers unless a swap is mid-flight, in which case
    /// `previous` is still valid and pinned instead.
    pub fn acquire(&self) -> Arc<Epoch<R, S>> {
        let slots = self.slots.lock().expect("epoch slot lock poisoned");
        slots
            .current
            .as_ref()
            .or(slots.previous.as_ref())
            .map(Arc::clone)
            .expect("no active epoch; the facade always installs one at construction")
    }

    /// Stages a freshly built epoch in the `next` slot.
    pub fn install_next(&self, epoch: Epoch<R, S>) {
        let mut slots = self.slots.lock().expect("epoch slot lock poisoned");
        debug_assert!(slots.next.is_none(), "a reconstruction is already staged");
        slots.next = Some(Arc::new(epoch));
    }

    /// Publishes the staged epoch: `previous` retires, `current` moves to
    /// `previous`, `next` becomes `current`.
    ///
    /// `before_notify` runs under the slot lock, immediately before
    /// waiters wake — the facade clears its scheduling flag there so a
    /// woken waiter observes the transition as complete.
    pub fn publish(&self, before_notify: impl FnOnce()) {
        let retired;
        {
            let mut slots = self.slots.lock().expect("epoch slot lock poisoned");
            let staged = slots.next.take().expect("publish without a staged epoch");
            trace!(id = staged.id(), "epoch published");
            retired = slots.previous.take();
            slots.previous = slots.current.take();
            slots.current = Some(staged);
            before_notify();
            self.transitioned.notify_all();
        }
        // Retirement happens outside the lock; dropping the last
        // reference can cascade into freeing an entire structure.
        drop(retired);
    }

    /// Blocks while `cond` holds, waking on every epoch transition.
    pub fn wait_while(&self, cond: impl Fn() -> bool) {
        let mut slots = self.slots.lock().expect("epoch slot lock poisoned");
        while cond() {
            slots = self
                .transitioned
                .wait(slots)
                .expect("epoch slot lock poisoned");
        }
    }

    /// Id of the current epoch.
    pub fn current_id(&self) -> u64 {
        self.acquire().id()
    }
}
