//! # Extension Structure Module
//!
//! The layered collection of shards behind the buffer, plus the planner
//! that turns "the buffer must be absorbed" and "a level holds too many
//! tombstones" into an ordered list of reconstruction tasks.
//!
//! ## Design Invariants
//!
//! - Level 0 is closest to the buffer; level index grows with age.
//! - Within a level, shards are ordered newest first.
//! - Shards are shared by reference counting: a shallow structure clone
//!   (one per reconstruction) copies the level lists, not the shards.
//! - Tasks execute strictly in plan order, deepest first, so every
//!   source a task names is still present when it runs.
//! - After a full plan executes, every level satisfies the
//!   tombstone-proportion bound, or a compaction plan would have been
//!   generated for it.
//!
//! ## Layout policies
//!
//! - **Tiering** — a level holds up to `scale_factor` shards; a full
//!   level merges them all into one shard a level down.
//! - **Leveling** — a level holds one shard of capacity
//!   `hwm · scale_factor^i` records (level 0 holds one buffer's worth);
//!   overflow pushes it a level down.
//! - **BSM** — Bentley–Saxe: a flush merges the buffer with every level
//!   above the first vacant one and lands there, growing height rather
//!   than rewriting in place.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::BufferView;
use crate::config::{ExtensionConfig, LayoutPolicy};
use crate::record::{Record, Wrapped};
use crate::shard::{BuildOptions, Shard};

// ------------------------------------------------------------------------------------------------
// Level
// ------------------------------------------------------------------------------------------------

/// One level of the hierarchy: a list of shards, newest first.
pub struct Level<R: Record, S: Shard<R>> {
    shards: Vec<Arc<S>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record, S: Shard<R>> Level<R, S> {
    fn new() -> Self {
        Self {
            shards: Vec::new(),
            _record: PhantomData,
        }
    }

    pub fn shards(&self) -> &[Arc<S>] {
        &self.shards
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.shards.iter().map(|s| s.record_count()).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.shards.iter().map(|s| s.tombstone_count()).sum()
    }

    pub fn deleted_count(&self) -> usize {
        self.shards.iter().map(|s| s.deleted_count()).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.shards.iter().map(|s| s.memory_usage()).sum()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.shards.iter().map(|s| s.aux_memory_usage()).sum()
    }

    /// Tombstone fraction of this level; `0.0` when empty.
    pub fn tombstone_proportion(&self) -> f64 {
        let records = self.record_count();
        if records == 0 {
            0.0
        } else {
            self.tombstone_count() as f64 / records as f64
        }
    }
}

impl<R: Record, S: Shard<R>> Clone for Level<R, S> {
    fn clone(&self) -> Self {
        Self {
            shards: self.shards.clone(),
            _record: PhantomData,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Reconstruction tasks
// ------------------------------------------------------------------------------------------------

/// One input of a reconstruction task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    /// The records of the buffer view the reconstruction pinned.
    Buffer,

    /// The shard at `levels[level].shards()[index]`.
    Shard { level: usize, index: usize },
}

/// A single merge the planner scheduled: consume `sources`, produce one
/// shard at `target_level`.
#[derive(Debug, Clone)]
pub struct ReconstructionTask {
    pub sources: Vec<TaskSource>,
    pub target_level: usize,

    /// Expected transient allocation, declared to the scheduler's
    /// memory budget.
    pub estimated_bytes: usize,

    /// Unmatched tombstones in this merge are spent and may be dropped:
    /// the merge consumes every shard its victims could inhabit.
    pub drop_tombstones: bool,
}

impl ReconstructionTask {
    fn consumes_buffer(&self) -> bool {
        self.sources.contains(&TaskSource::Buffer)
    }
}

// ------------------------------------------------------------------------------------------------
// ExtensionStructure
// ------------------------------------------------------------------------------------------------

/// The leveled shard hierarchy of one structure version.
///
/// Immutable once an epoch publishes it; reconstructions work on a
/// shallow clone and publish that clone as the next version.
pub struct ExtensionStructure<R: Record, S: Shard<R>> {
    levels: Vec<Level<R, S>>,
    config: Arc<ExtensionConfig>,
}

impl<R: Record, S: Shard<R>> Clone for ExtensionStructure<R, S> {
    fn clone(&self) -> Self {
        Self {
            levels: self.levels.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<R: Record, S: Shard<R>> ExtensionStructure<R, S> {
    pub fn new(config: Arc<ExtensionConfig>) -> Self {
        Self {
            levels: Vec::new(),
            config,
        }
    }

    /// Shallow clone sharing every shard; the starting point of a
    /// reconstruction.
    pub fn clone_for_reconstruction(&self) -> Self {
        self.clone()
    }

    pub fn levels(&self) -> &[Level<R, S>] {
        &self.levels
    }

    /// Number of levels, occupied or not.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Total records across all shards, tombstones included.
    pub fn record_count(&self) -> usize {
        self.levels.iter().map(Level::record_count).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.levels.iter().map(Level::tombstone_count).sum()
    }

    pub fn deleted_count(&self) -> usize {
        self.levels.iter().map(Level::deleted_count).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.levels.iter().map(Level::shard_count).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.levels.iter().map(Level::memory_usage).sum()
    }

    pub fn aux_memory_usage(&self) -> usize {
        self.levels.iter().map(Level::aux_memory_usage).sum()
    }

    /// Enumerates shards in query fan-out order: level 0 outward, and
    /// within a level newest shard first. The buffer is not included —
    /// the facade queries it before any shard.
    pub fn shards(&self) -> impl Iterator<Item = (usize, usize, &Arc<S>)> {
        self.levels.iter().enumerate().flat_map(|(li, level)| {
            level
                .shards
                .iter()
                .enumerate()
                .map(move |(si, shard)| (li, si, shard))
        })
    }

    /// True when every level satisfies the tombstone-proportion bound.
    pub fn validate_tombstone_proportion(&self) -> bool {
        self.levels
            .iter()
            .all(|level| level.tombstone_proportion() <= self.config.max_delete_prop)
    }

    // --------------------------------------------------------------------------------------------
    // Planning
    // --------------------------------------------------------------------------------------------

    /// Plans the tasks that absorb a buffer of `buffer_records` records,
    /// cascading merges down the hierarchy as levels overflow.
    ///
    /// Tasks are ordered deepest first so room exists before anything
    /// moves into it.
    pub fn plan_flush(&self, buffer_records: usize) -> Vec<ReconstructionTask> {
        match self.config.layout_policy {
            LayoutPolicy::Tiering => self.plan_flush_tiering(buffer_records),
            LayoutPolicy::Leveling => self.plan_flush_leveling(buffer_records),
            LayoutPolicy::Bsm => self.plan_flush_bsm(buffer_records),
        }
    }

    fn buffer_bytes(&self, buffer_records: usize) -> usize {
        buffer_records * size_of::<Wrapped<R>>()
    }

    /// Sum of the memory footprints of a whole level's shards.
    fn level_bytes(&self, level: usize) -> usize {
        self.levels.get(level).map(Level::memory_usage).unwrap_or(0)
    }

    /// Sources covering every shard of `level`, newest first.
    fn whole_level_sources(&self, level: usize) -> Vec<TaskSource> {
        (0..self.levels[level].shard_count())
            .map(|index| TaskSource::Shard { level, index })
            .collect()
    }

    fn plan_flush_tiering(&self, buffer_records: usize) -> Vec<ReconstructionTask> {
        let sf = self.config.scale_factor;

        // Contiguous run of full levels starting at 0; each must spill
        // into the next before anything lands on it.
        let mut full = 0;
        while full < self.levels.len() && self.levels[full].shard_count() >= sf {
            full += 1;
        }

        let mut tasks = Vec::new();
        for level in (0..full).rev() {
            let target = level + 1;
            tasks.push(ReconstructionTask {
                sources: self.whole_level_sources(level),
                target_level: target,
                estimated_bytes: self.level_bytes(level) + self.level_bytes(target),
                drop_tombstones: self.is_hierarchy_bottom(target, None),
            });
        }

        tasks.push(ReconstructionTask {
            sources: vec![TaskSource::Buffer],
            target_level: 0,
            estimated_bytes: self.buffer_bytes(buffer_records),
            drop_tombstones: self.is_hierarchy_bottom(0, None),
        });

        tasks
    }

    fn plan_flush_leveling(&self, buffer_records: usize) -> Vec<ReconstructionTask> {
        let sf = self.config.scale_factor;
        let hwm = self.config.buffer_hwm;
        // Level capacity is hwm · sf^i records, the same geometric series
        // tiering gets from sf shards per level.
        let cap = |level: usize| hwm * sf.pow(level as u32);

        // Find the depth of the push-down chain: the first level that can
        // absorb what arrives from above without overflowing.
        let record_counts: Vec<usize> = self.levels.iter().map(Level::record_count).collect();
        let mut depth = 0;
        loop {
            if depth >= record_counts.len() {
                break;
            }
            let inflow = if depth == 0 {
                buffer_records
            } else {
                record_counts[depth - 1]
            };
            if record_counts[depth] + inflow <= cap(depth) {
                break;
            }
            depth += 1;
        }

        let mut tasks = Vec::new();
        for level in (0..depth).rev() {
            let target = level + 1;
            let mut sources = vec![TaskSource::Shard { level, index: 0 }];
            // Only the deepest push-down meets a resident shard; every
            // shallower target was emptied by the task before it.
            let absorbs_resident = level == depth - 1
                && self.levels.get(target).is_some_and(|l| !l.is_empty());
            if absorbs_resident {
                sources.push(TaskSource::Shard {
                    level: target,
                    index: 0,
                });
            }
            tasks.push(ReconstructionTask {
                sources,
                target_level: target,
                estimated_bytes: self.level_bytes(level) + self.level_bytes(target),
                drop_tombstones: self
                    .is_hierarchy_bottom(target, absorbs_resident.then_some(target)),
            });
        }

        // The flush proper: merge the buffer with whatever remains at
        // level 0 (nothing, if the chain pushed it down).
        let absorbs_resident =
            depth == 0 && self.levels.first().is_some_and(|l| !l.is_empty());
        let mut sources = vec![TaskSource::Buffer];
        if absorbs_resident {
            sources.push(TaskSource::Shard { level: 0, index: 0 });
        }
        tasks.push(ReconstructionTask {
            sources,
            target_level: 0,
            estimated_bytes: self.buffer_bytes(buffer_records) + self.level_bytes(0),
            drop_tombstones: self.is_hierarchy_bottom(0, absorbs_resident.then_some(0)),
        });

        tasks
    }

    fn plan_flush_bsm(&self, buffer_records: usize) -> Vec<ReconstructionTask> {
        // Bentley–Saxe: land on the first vacant level, folding in every
        // occupied level above it.
        let vacant = self
            .levels
            .iter()
            .position(Level::is_empty)
            .unwrap_or(self.levels.len());

        let mut sources = vec![TaskSource::Buffer];
        let mut bytes = self.buffer_bytes(buffer_records);
        for level in 0..vacant {
            sources.extend(self.whole_level_sources(level));
            bytes += self.level_bytes(level);
        }

        vec![ReconstructionTask {
            sources,
            target_level: vacant,
            estimated_bytes: bytes,
            // The landing level is vacant and everything above it folds
            // into the merge; spent tombstones drop iff nothing deeper
            // survives either.
            drop_tombstones: self.levels.iter().skip(vacant + 1).all(Level::is_empty),
        }]
    }

    /// True when a merge targeting `target_level` consumes the bottom of
    /// the hierarchy: no shard at or deeper than the target survives
    /// outside the merge, so its unmatched tombstones can never meet a
    /// victim. `consumed` names a level whose shards are all merge
    /// sources (leveling consumes the target's resident shard).
    fn is_hierarchy_bottom(&self, target_level: usize, consumed: Option<usize>) -> bool {
        self.levels
            .iter()
            .enumerate()
            .skip(target_level)
            .all(|(idx, level)| Some(idx) == consumed || level.is_empty())
    }

    /// Plans merges restoring the tombstone-proportion bound on every
    /// level. Empty when the bound already holds.
    pub fn plan_compaction(&self) -> Vec<ReconstructionTask> {
        let bound = self.config.max_delete_prop;
        let mut tasks = Vec::new();

        for (idx, level) in self.levels.iter().enumerate() {
            if level.tombstone_proportion() <= bound {
                continue;
            }

            let deeper_occupied = self
                .levels
                .iter()
                .skip(idx + 1)
                .any(|l| !l.is_empty());

            if deeper_occupied {
                // Push the tombstones toward their victims: merge this
                // level with the one below it.
                let target = idx + 1;
                let mut sources = self.whole_level_sources(idx);
                sources.extend(self.whole_level_sources(target));
                tasks.push(ReconstructionTask {
                    sources,
                    target_level: target,
                    estimated_bytes: self.level_bytes(idx) + self.level_bytes(target),
                    drop_tombstones: self
                        .levels
                        .iter()
                        .skip(target + 1)
                        .all(Level::is_empty),
                });
            } else if level.shard_count() >= 1 {
                // Bottom level: rebuild it against itself; every
                // surviving tombstone is provably spent.
                tasks.push(ReconstructionTask {
                    sources: self.whole_level_sources(idx),
                    target_level: idx,
                    estimated_bytes: self.level_bytes(idx),
                    drop_tombstones: true,
                });
            }

            // One compaction per planning round; deeper violations are
            // replanned after this merge lands, against real counts.
            break;
        }

        if !tasks.is_empty() {
            debug!(tasks = tasks.len(), "tombstone compaction planned");
        }
        tasks
    }

    // --------------------------------------------------------------------------------------------
    // Execution
    // --------------------------------------------------------------------------------------------

    /// Executes one planned task against this (cloned, private)
    /// structure: builds the destination shard, splices it in, and
    /// releases the consumed sources.
    ///
    /// Returns the number of tombstones the merge dropped as spent
    /// (zero unless the task consumed the hierarchy bottom). The facade
    /// reconciles its unmatched-tombstone accounting against it.
    pub fn execute_task(
        &mut self,
        task: &ReconstructionTask,
        view: Option<&BufferView<'_, R>>,
        opts: &BuildOptions,
    ) -> usize {
        let final_opts = BuildOptions {
            retain_tombstones: !task.drop_tombstones,
            ..opts.clone()
        };

        // Source totals, needed to attribute the merge's losses. A
        // cancelled pair removes two records and one tombstone; a spent
        // tombstone removes one of each, so the split is recoverable
        // from the deltas alone.
        let (src_records, src_tombstones) = if task.drop_tombstones {
            let mut records = 0usize;
            let mut tombstones = 0usize;
            for source in &task.sources {
                match source {
                    TaskSource::Buffer => {
                        let view = view.expect("flush task executed without a buffer view");
                        records += view.record_count();
                        tombstones += view.records().filter(|w| w.is_tombstone()).count();
                    }
                    TaskSource::Shard { level, index } => {
                        let shard = &self.levels[*level].shards[*index];
                        records += shard.record_count();
                        tombstones += shard.tombstone_count();
                    }
                }
            }
            (records, tombstones)
        } else {
            (0, 0)
        };

        let new_shard = if task.sources.len() == 1 && task.consumes_buffer() {
            // Pure flush into an empty slot — the promoted buffer shard
            // is already the destination.
            let view = view.expect("flush task executed without a buffer view");
            S::build_from_view(view, &final_opts)
        } else {
            // A buffer tombstone's victim may live in one of the other
            // sources, so the promotion step always retains tombstones;
            // only the final merge may declare them spent.
            let buffer_shard = if task.consumes_buffer() {
                let view = view.expect("flush task executed without a buffer view");
                Some(S::build_from_view(
                    view,
                    &BuildOptions {
                        retain_tombstones: true,
                        ..opts.clone()
                    },
                ))
            } else {
                None
            };

            let mut source_refs: Vec<&S> = Vec::with_capacity(task.sources.len());
            for source in &task.sources {
                match source {
                    TaskSource::Buffer => {
                        source_refs.push(buffer_shard.as_ref().expect("buffer shard built above"));
                    }
                    TaskSource::Shard { level, index } => {
                        source_refs.push(&self.levels[*level].shards[*index]);
                    }
                }
            }
            S::build_from_shards(&source_refs, &final_opts)
        };

        let spent_tombstones = if task.drop_tombstones {
            let dropped_records = src_records - new_shard.record_count();
            let dropped_tombstones = src_tombstones - new_shard.tombstone_count();
            (2 * dropped_tombstones).saturating_sub(dropped_records)
        } else {
            0
        };

        debug!(
            target_level = task.target_level,
            sources = task.sources.len(),
            records = new_shard.record_count(),
            tombstones = new_shard.tombstone_count(),
            spent_tombstones,
            "reconstruction task complete"
        );

        // Release consumed shards, highest index first so the remaining
        // indices stay valid.
        let mut consumed: Vec<(usize, usize)> = task
            .sources
            .iter()
            .filter_map(|s| match s {
                TaskSource::Shard { level, index } => Some((*level, *index)),
                TaskSource::Buffer => None,
            })
            .collect();
        consumed.sort_unstable_by(|a, b| b.cmp(a));
        for (level, index) in consumed {
            self.levels[level].shards.remove(index);
        }

        // Splice the destination in as the newest shard of its level.
        while self.levels.len() <= task.target_level {
            self.levels.push(Level::new());
        }
        self.levels[task.target_level]
            .shards
            .insert(0, Arc::new(new_shard));

        spent_tombstones
    }
}
