//! # Dynamic Extension Facade
//!
//! The public surface of the framework: a [`DynamicExtension`] wraps a
//! mutable buffer, a leveled shard hierarchy, an epoch triplet, and a
//! job scheduler into a single dynamized index with `insert`, `erase`,
//! `query`, and `snapshot`.
//!
//! ## Write path
//!
//! An insert checks the buffer's low watermark, schedules at most one
//! background reconstruction (guarded by a CAS flag), then appends. A
//! saturated buffer rejects the append; the caller retries once the
//! in-flight reconstruction publishes.
//!
//! ## Read path
//!
//! A query pins the active epoch and a buffer view, preprocesses every
//! partition, runs the query's distribute hook, executes freshest
//! partition first, delete-filters each partial, and combines. The
//! future resolves when the worker finishes; queries running across an
//! epoch swap see the old or the new epoch in its entirety, never a
//! hybrid.
//!
//! ## Reconstruction
//!
//! A worker clones the current structure, restores the
//! tombstone-proportion bound, absorbs the buffer, retries the head
//! advance until stale views drain, and publishes a new epoch. The
//! previous-previous epoch retires by reference count.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, bounded};
use thiserror::Error;
use tracing::{debug, info};

use crate::buffer::{BufferError, BufferView, MutableBuffer};
use crate::config::{ConfigError, DeletePolicy, ExtensionConfig};
use crate::epoch::{Epoch, EpochManager};
use crate::query::{Query, ResultRecord};
use crate::record::{Record, Wrapped};
use crate::scheduler::{
    CoreBinding, Job, JobScheduler, NoBinding, PooledScheduler, SchedulerError, SchedulerStats,
    SerialScheduler,
};
use crate::shard::{BuildOptions, Shard};
use crate::structure::ExtensionStructure;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the [`DynamicExtension`] facade.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// Configuration rejected at construction.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The buffer is at its high watermark and the next epoch has not
    /// published yet. Retry, optionally with backoff.
    #[error("Buffer saturated; retry after the next epoch publishes")]
    BufferSaturated,

    /// A tagging erase found no matching live record.
    #[error("Record not present")]
    RecordNotPresent,

    /// The facade has begun teardown.
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// A structural invariant failed; detected by test hooks only.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<SchedulerError> for ExtensionError {
    fn from(_: SchedulerError) -> Self {
        ExtensionError::ShutdownInProgress
    }
}

// ------------------------------------------------------------------------------------------------
// QueryFuture
// ------------------------------------------------------------------------------------------------

/// Handle to an in-flight query's result.
pub struct QueryFuture<T> {
    rx: Receiver<T>,
}

impl<T> QueryFuture<T> {
    /// Blocks until the query completes.
    pub fn wait(self) -> Result<T, ExtensionError> {
        self.rx.recv().map_err(|_| ExtensionError::ShutdownInProgress)
    }

    /// Returns the result if the query has already completed.
    pub fn try_wait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

// ------------------------------------------------------------------------------------------------
// DynamicExtension
// ------------------------------------------------------------------------------------------------

/// A dynamized index over record type `R` and shard type `S`.
///
/// The handle is `Send + Sync`; share it across threads behind an `Arc`.
/// Dropping the last handle shuts the worker pool down and awaits
/// running jobs.
pub struct DynamicExtension<R: Record, S: Shard<R>> {
    inner: Arc<ExtensionInner<R, S>>,
}

struct ExtensionInner<R: Record, S: Shard<R>> {
    config: Arc<ExtensionConfig>,
    build_opts: BuildOptions,
    buffer: MutableBuffer<R>,
    epochs: EpochManager<R, S>,
    scheduler: Box<dyn JobScheduler>,

    /// True while a reconstruction is scheduled or running. At most one
    /// is in flight per structure.
    reconstruction_scheduled: AtomicBool,

    /// Pending tombstones that matched nothing when appended (erase of
    /// an absent value, or a double erase). They cancel no victim, so
    /// the live-count arithmetic adds them back; the counter shrinks
    /// when a merge drops them as spent.
    spurious_tombstones: AtomicUsize,

    next_epoch_id: AtomicU64,
    closed: AtomicBool,
}

impl<R: Record, S: Shard<R>> DynamicExtension<R, S> {
    /// Builds a dynamized index from a validated configuration.
    pub fn new(config: ExtensionConfig) -> Result<Self, ExtensionError> {
        Self::with_core_binding(config, Arc::new(NoBinding))
    }

    /// As [`DynamicExtension::new`], with a worker-to-core binding
    /// strategy for the pooled scheduler.
    pub fn with_core_binding(
        config: ExtensionConfig,
        binding: Arc<dyn CoreBinding>,
    ) -> Result<Self, ExtensionError> {
        config.validate()?;

        let scheduler: Box<dyn JobScheduler> = if config.thread_count == 0 {
            Box::new(SerialScheduler::new(config.memory_budget))
        } else {
            Box::new(PooledScheduler::new(
                config.thread_count,
                config.memory_budget,
                binding,
            ))
        };

        let config = Arc::new(config);
        let structure = ExtensionStructure::new(Arc::clone(&config));
        let initial = Epoch::new(0, Arc::new(structure), 0);

        info!(
            lwm = config.buffer_lwm,
            hwm = config.buffer_hwm,
            scale_factor = config.scale_factor,
            ?config.layout_policy,
            ?config.delete_policy,
            "dynamic extension created"
        );

        Ok(Self {
            inner: Arc::new(ExtensionInner {
                build_opts: BuildOptions {
                    bloom_fp_rate: config.bloom_fp_rate,
                    retain_tombstones: true,
                },
                buffer: MutableBuffer::new(config.buffer_lwm, config.buffer_hwm),
                epochs: EpochManager::new(initial),
                scheduler,
                reconstruction_scheduled: AtomicBool::new(false),
                spurious_tombstones: AtomicUsize::new(0),
                next_epoch_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts a record.
    ///
    /// Crossing the buffer's low watermark schedules a background
    /// reconstruction; a saturated buffer rejects with
    /// [`ExtensionError::BufferSaturated`] and the caller retries.
    pub fn insert(&self, rec: R) -> Result<(), ExtensionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExtensionError::ShutdownInProgress);
        }

        self.try_schedule_reconstruction()?;
        self.inner
            .buffer
            .append(rec, false)
            .map_err(|_| ExtensionError::BufferSaturated)
    }

    /// Erases a record by exact value.
    ///
    /// Under the tombstone policy this appends a tombstone
    /// unconditionally (and may reject like
    /// [`DynamicExtension::insert`]); a tombstone for a value with no
    /// live, undominated copy is accepted but recorded as unmatched so
    /// [`DynamicExtension::record_count`] only charges erases that hit.
    /// Under the tagging policy it tags the oldest matching live record
    /// in the buffer, or the first match in the shard hierarchy, and
    /// reports [`ExtensionError::RecordNotPresent`] when neither
    /// exists.
    pub fn erase(&self, rec: R) -> Result<(), ExtensionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExtensionError::ShutdownInProgress);
        }

        match self.inner.config.delete_policy {
            DeletePolicy::Tombstone => {
                self.try_schedule_reconstruction()?;
                // Probe before appending so the check cannot see the
                // tombstone it is classifying.
                let matched = self.inner.tombstone_will_match(&rec);
                self.inner
                    .buffer
                    .append(rec, true)
                    .map_err(|_| ExtensionError::BufferSaturated)?;
                if !matched {
                    self.inner.spurious_tombstones.fetch_add(1, Ordering::AcqRel);
                }
                Ok(())
            }

            DeletePolicy::Tagging => {
                {
                    let view = self.inner.buffer.view();
                    if view.tag_delete(&rec) {
                        return Ok(());
                    }
                }

                let epoch = self.inner.epochs.acquire();
                for (_, _, shard) in epoch.structure().shards() {
                    if shard.tag_delete(&rec) {
                        return Ok(());
                    }
                }
                Err(ExtensionError::RecordNotPresent)
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    /// Submits a query; the returned future resolves when a worker has
    /// executed it against a pinned epoch.
    pub fn query<Q: Query<R, S>>(
        &self,
        params: Q::Parameters,
    ) -> Result<QueryFuture<Q::Result>, ExtensionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExtensionError::ShutdownInProgress);
        }

        let (tx, rx) = bounded(1);
        let weak = Arc::downgrade(&self.inner);
        let job = Job::query(move || {
            if let Some(inner) = weak.upgrade() {
                let result = inner.execute_query::<Q>(params);
                let _ = tx.send(result);
            }
        });

        self.inner.scheduler.schedule(job)?;
        Ok(QueryFuture { rx })
    }

    /// Builds one shard covering every record currently live — buffer
    /// and hierarchy both. Used to seed subsidiary structures.
    pub fn snapshot(&self) -> S {
        let (epoch, view) = self.inner.pin_consistent();

        // A snapshot covers every partition, so tombstones surviving the
        // final merge are spent by construction. Buffer tombstones must
        // survive the promotion step, though — their victims may sit in
        // the shards being merged.
        let spent_opts = BuildOptions {
            retain_tombstones: false,
            ..self.inner.build_opts.clone()
        };

        if epoch.structure().shard_count() == 0 {
            return S::build_from_view(&view, &spent_opts);
        }

        let buffer_shard = S::build_from_view(&view, &self.inner.build_opts);
        let mut sources: Vec<&S> = Vec::with_capacity(epoch.structure().shard_count() + 1);
        sources.push(&buffer_shard);
        for (_, _, shard) in epoch.structure().shards() {
            sources.push(shard);
        }
        S::build_from_shards(&sources, &spent_opts)
    }

    // --------------------------------------------------------------------------------------------
    // Epoch control
    // --------------------------------------------------------------------------------------------

    /// Blocks until no reconstruction is scheduled or in flight. A
    /// no-op when the index is already quiescent.
    pub fn await_next_epoch(&self) {
        let inner = &self.inner;
        inner.epochs.wait_while(|| {
            inner.reconstruction_scheduled.load(Ordering::Acquire)
                && !inner.closed.load(Ordering::Acquire)
        });
    }

    /// Id of the currently published epoch.
    pub fn current_epoch_id(&self) -> u64 {
        self.inner.epochs.current_id()
    }

    // --------------------------------------------------------------------------------------------
    // Stats and hooks
    // --------------------------------------------------------------------------------------------

    /// Number of live records: inserts minus matched erases, across the
    /// buffer and every shard.
    pub fn record_count(&self) -> usize {
        let inner = &self.inner;
        let epoch = inner.epochs.acquire();
        let s = epoch.structure();

        let raw = (s.record_count() + inner.buffer.record_count()) as i64;
        // A pending tombstone subtracts itself and the victim it has not
        // yet cancelled; a tagged record subtracts itself. An unmatched
        // tombstone has no victim to charge, so it is added back.
        let tombstones = (s.tombstone_count() + inner.buffer.tombstone_count()) as i64;
        let tagged = (s.deleted_count() + inner.buffer.deleted_count()) as i64;
        let spurious = inner.spurious_tombstones.load(Ordering::Acquire) as i64;

        (raw - 2 * tombstones - tagged + spurious).max(0) as usize
    }

    /// Number of pending (uncancelled) tombstones.
    pub fn tombstone_count(&self) -> usize {
        let epoch = self.inner.epochs.acquire();
        epoch.structure().tombstone_count() + self.inner.buffer.tombstone_count()
    }

    /// Number of levels in the current structure version.
    pub fn height(&self) -> usize {
        self.inner.epochs.acquire().structure().height()
    }

    /// Bytes held by record storage: buffer slots plus every shard.
    pub fn memory_usage(&self) -> usize {
        self.inner.epochs.acquire().structure().memory_usage() + self.inner.buffer.memory_usage()
    }

    /// Bytes held by shard auxiliary structures.
    pub fn aux_memory_usage(&self) -> usize {
        self.inner.epochs.acquire().structure().aux_memory_usage()
    }

    /// The buffer's high watermark.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer.capacity()
    }

    /// Test hook: true when every level satisfies the configured
    /// tombstone-proportion bound.
    pub fn validate_tombstone_proportion(&self) -> bool {
        self.inner
            .epochs
            .acquire()
            .structure()
            .validate_tombstone_proportion()
    }

    /// Snapshot of the scheduler's counters.
    pub fn scheduler_statistics(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    /// Logs the scheduler counters at info level.
    pub fn print_scheduler_statistics(&self) {
        let stats = self.scheduler_statistics();
        info!(
            queries_run = stats.queries_run,
            reconstructions_run = stats.reconstructions_run,
            jobs_dropped = stats.jobs_dropped,
            memory_in_use = stats.memory_in_use,
            peak_memory = stats.peak_memory,
            workers = stats.workers,
            "scheduler statistics"
        );
    }

    /// Stops accepting operations, shuts the scheduler down, and awaits
    /// running jobs. Idempotent; also invoked on drop.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.scheduler.shutdown();
        info!("dynamic extension closed");
    }

    // --------------------------------------------------------------------------------------------
    // Reconstruction scheduling
    // --------------------------------------------------------------------------------------------

    fn try_schedule_reconstruction(&self) -> Result<(), ExtensionError> {
        let inner = &self.inner;
        if !inner.buffer.at_low_watermark() {
            return Ok(());
        }
        if inner
            .reconstruction_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        // Declared allocation: the buffer promotion plus, worst case, a
        // full cascade over the current hierarchy.
        let estimated = {
            let epoch = inner.epochs.acquire();
            inner.buffer.record_count() * size_of::<Wrapped<R>>()
                + epoch.structure().memory_usage()
        };

        debug!(estimated, "scheduling reconstruction");

        let weak = Arc::downgrade(inner);
        let job = Job::reconstruction(estimated, move || {
            if let Some(inner) = weak.upgrade() {
                inner.run_reconstruction();
            }
        });

        match inner.scheduler.schedule(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner
                    .reconstruction_scheduled
                    .store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }
}

impl<R: Record, S: Shard<R>> Drop for DynamicExtension<R, S> {
    fn drop(&mut self) {
        self.close();
    }
}

// ------------------------------------------------------------------------------------------------
// Worker-side implementation
// ------------------------------------------------------------------------------------------------

impl<R: Record, S: Shard<R>> ExtensionInner<R, S> {
    /// The reconstruction worker callback.
    fn run_reconstruction(self: &Arc<Self>) {
        // 1. Start from a shallow clone of the current structure.
        let current = self.epochs.acquire();
        let mut working = current.structure().clone_for_reconstruction();
        drop(current);

        // 2. Restore the tombstone bound before flushing, so the flush
        //    destination has headroom.
        let mut spent_tombstones = self.compact_until_bound_holds(&mut working);

        // 3. Absorb the buffer.
        let new_head;
        {
            let view = self.buffer.view();
            new_head = view.tail();
            if !view.is_empty() {
                let plan = working.plan_flush(view.record_count());
                debug!(
                    records = view.record_count(),
                    tasks = plan.len(),
                    "flushing buffer"
                );
                for task in &plan {
                    spent_tombstones += working.execute_task(task, Some(&view), &self.build_opts);
                }
            }
        }

        // The flush itself may have landed a tombstone-heavy shard; the
        // published epoch must satisfy the bound.
        spent_tombstones += self.compact_until_bound_holds(&mut working);

        // 4. Advance the head past the absorbed range, yielding while
        //    stale views still pin the previous generation.
        if new_head > self.buffer.head() {
            while self.buffer.advance_head(new_head) == Err(BufferError::Pinned) {
                std::thread::yield_now();
            }
        }

        // 5. Publish. The scheduling flag clears and the spent
        //    tombstones reconcile under the slot lock, so a woken waiter
        //    observes the transition — counts included — as complete.
        let id = self.next_epoch_id.fetch_add(1, Ordering::AcqRel);
        self.epochs
            .install_next(Epoch::new(id, Arc::new(working), new_head));
        self.epochs.publish(|| {
            if spent_tombstones > 0 {
                // A tombstone dropped as spent found no victim in a
                // merge covering every place one could be; it was
                // unmatched, and leaves the structure's counts with it.
                let _ = self.spurious_tombstones.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |v| Some(v.saturating_sub(spent_tombstones)),
                );
            }
            self.reconstruction_scheduled
                .store(false, Ordering::Release);
        });

        debug!(epoch = id, spent_tombstones, "reconstruction published");
    }

    /// Runs compaction rounds until every level satisfies the
    /// tombstone-proportion bound. Each round replans against the
    /// post-merge counts; tombstones cancel, drop at the bottom, or move
    /// strictly deeper, so the loop terminates. Returns the number of
    /// tombstones dropped as spent across all rounds.
    fn compact_until_bound_holds(&self, working: &mut ExtensionStructure<R, S>) -> usize {
        let mut spent = 0;
        loop {
            let tasks = working.plan_compaction();
            if tasks.is_empty() {
                break;
            }
            for task in &tasks {
                spent += working.execute_task(task, None, &self.build_opts);
            }
        }
        spent
    }

    /// Decides whether a tombstone appended now would have a victim to
    /// cancel: some copy of `rec` is live and no pending tombstone has
    /// already claimed it. Called before the tombstone itself lands.
    ///
    /// The check is value-based, like the rest of tombstone handling;
    /// concurrent erases of the identical value may each see the same
    /// victim and both count as matched.
    fn tombstone_will_match(&self, rec: &R) -> bool {
        let (epoch, view) = self.pin_consistent();

        if view.contains_tombstone(rec) {
            return false;
        }

        let mut live = view.records().any(|w| w.rec() == rec && w.is_visible());
        for (_, _, shard) in epoch.structure().shards() {
            match shard.point_lookup(rec, false) {
                Some(w) if w.is_tombstone() => return false,
                Some(w) if w.is_visible() => live = true,
                _ => {}
            }
        }
        live
    }

    /// Pins an epoch together with a buffer view anchored at that
    /// epoch's head. Between a head advance and the following epoch
    /// publish the two disagree briefly — pairing them blindly would
    /// miss (or double-count) the records the reconstruction absorbed,
    /// so retry until the pair is consistent.
    fn pin_consistent(&self) -> (Arc<Epoch<R, S>>, BufferView<'_, R>) {
        loop {
            let epoch = self.epochs.acquire();
            let view = self.buffer.view();
            if view.head() == epoch.head_at_start() {
                return (epoch, view);
            }
            std::thread::yield_now();
        }
    }

    /// The query worker callback: the full preprocess → distribute →
    /// execute → filter → combine → repeat pipeline.
    fn execute_query<Q: Query<R, S>>(&self, mut params: Q::Parameters) -> Q::Result {
        let (epoch, view) = self.pin_consistent();
        let shards: Vec<(usize, usize, &Arc<S>)> = epoch.structure().shards().collect();

        loop {
            let mut shard_queries: Vec<Q::LocalShardQuery> = shards
                .iter()
                .map(|(_, _, shard)| Q::preproc_shard(shard, &params))
                .collect();
            let mut buffer_query = Q::preproc_buffer(&view, &params);
            Q::distribute(&mut params, &mut shard_queries, &mut buffer_query);

            let mut partials: Vec<Vec<Q::LocalResult>> = Vec::with_capacity(shards.len() + 1);

            // Buffer first, then level 0 outward: early-abort resolves
            // at the freshest partition holding an answer.
            let raw = Q::execute_buffer(&view, &buffer_query);
            let mut resolved = Q::EARLY_ABORT && !raw.is_empty();
            partials.push(self.filter_deletes::<Q>(raw, None, &view, &shards));

            if !resolved {
                for (idx, (_, _, shard)) in shards.iter().enumerate() {
                    let raw = Q::execute_shard(shard, &shard_queries[idx]);
                    resolved = Q::EARLY_ABORT && !raw.is_empty();
                    partials.push(self.filter_deletes::<Q>(raw, Some(idx), &view, &shards));
                    if resolved {
                        break;
                    }
                }
            }

            let result = Q::combine(&partials, &params);
            if !Q::repeat(&mut params, &result) {
                return result;
            }
        }
    }

    /// Applies the configured deletion semantics to one partition's
    /// local results. `producer` is the index into `shards` of the
    /// partition that produced them; `None` means the buffer.
    fn filter_deletes<Q: Query<R, S>>(
        &self,
        raw: Vec<Q::LocalResult>,
        producer: Option<usize>,
        view: &BufferView<'_, R>,
        shards: &[(usize, usize, &Arc<S>)],
    ) -> Vec<Q::LocalResult> {
        if Q::SKIP_DELETE_FILTER {
            return raw;
        }

        match self.config.delete_policy {
            DeletePolicy::Tagging => raw
                .into_iter()
                .filter(|r| match r.wrapped() {
                    Some(w) => !w.is_deleted(),
                    None => true,
                })
                .collect(),

            DeletePolicy::Tombstone => raw
                .into_iter()
                .filter(|r| {
                    let Some(w) = r.wrapped() else { return true };
                    if w.is_tombstone() {
                        return false;
                    }
                    !self.tombstone_dominates(w.rec(), producer, view, shards)
                })
                .collect(),
        }
    }

    /// True when a pending tombstone in a partition at least as fresh as
    /// the producer suppresses `rec`.
    fn tombstone_dominates(
        &self,
        rec: &R,
        producer: Option<usize>,
        view: &BufferView<'_, R>,
        shards: &[(usize, usize, &Arc<S>)],
    ) -> bool {
        // The buffer is fresher than every shard.
        if view.contains_tombstone(rec) {
            return true;
        }

        // Shards enumerate freshest first, so exactly the prefix before
        // the producer can dominate it.
        let fresher = match producer {
            None => return false,
            Some(idx) => &shards[..idx],
        };
        fresher.iter().any(|(_, _, shard)| {
            shard
                .point_lookup(rec, true)
                .is_some_and(|w| w.is_tombstone())
        })
    }
}
