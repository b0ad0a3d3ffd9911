//! # Shard Module
//!
//! The external contract a static structure must satisfy to be
//! dynamized, plus a reference implementation over sorted runs.
//!
//! ## The contract
//!
//! A shard is an immutable, bulk-built structure that owns its records.
//! It is created exactly two ways — promoted from a buffer view, or
//! merged from a non-empty list of existing shards — and never mutated
//! afterwards, with one carve-out: the *deleted* bit in a record's
//! atomic header may be set in place under the tagging delete policy.
//!
//! Both build paths apply identical deletion semantics: records are
//! sorted, adjacent live-record/tombstone pairs over the identical
//! record cancel, and tagged-deleted records are dropped.
//!
//! Shards are shared across reader threads and across epochs, so every
//! implementation must be `Send + Sync`.

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub mod sorted_run;

pub use sorted_run::SortedRunShard;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use rand::Rng;

use crate::buffer::BufferView;
use crate::record::{DistanceRecord, KeyedRecord, Record, Wrapped};

// ------------------------------------------------------------------------------------------------
// Build options
// ------------------------------------------------------------------------------------------------

/// Construction parameters handed to every shard build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// False-positive rate for the shard's tombstone bloom filter.
    pub bloom_fp_rate: f64,

    /// Whether unmatched tombstones survive the build. The planner
    /// disables this for merges that consume the bottom of the
    /// hierarchy, where a surviving tombstone could never meet its
    /// victim.
    pub retain_tombstones: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            bloom_fp_rate: 0.01,
            retain_tombstones: true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shard trait
// ------------------------------------------------------------------------------------------------

/// Contract of a static structure under dynamization.
pub trait Shard<R: Record>: Send + Sync + Sized + 'static {
    /// Builds a shard from the records covered by a buffer view.
    ///
    /// Sorts, cancels live/tombstone pairs, drops tagged-deleted records,
    /// and computes any auxiliary structures (filters, samplers, indices).
    fn build_from_view(view: &BufferView<'_, R>, opts: &BuildOptions) -> Self;

    /// Builds a shard by k-way merging the given shards, applying the
    /// same cancellation rules as [`Shard::build_from_view`].
    ///
    /// `sources` is non-empty; the framework never requests an empty
    /// merge.
    fn build_from_shards(sources: &[&Self], opts: &BuildOptions) -> Self;

    /// Finds a record equal to `rec` (live or tombstone).
    ///
    /// With `use_filter`, the shard may consult its tombstone filter and
    /// answer `None` without touching its records; callers pass `true`
    /// only when probing for tombstones.
    fn point_lookup(&self, rec: &R, use_filter: bool) -> Option<&Wrapped<R>>;

    /// Tags the first matching live record as deleted in place.
    ///
    /// Returns `true` if a record was tagged. Implementations must
    /// reflect successful tags in [`Shard::deleted_count`].
    fn tag_delete(&self, rec: &R) -> bool;

    /// Number of stored records, tombstones included.
    fn record_count(&self) -> usize;

    /// Number of stored tombstones.
    fn tombstone_count(&self) -> usize;

    /// Number of records tagged deleted since construction.
    fn deleted_count(&self) -> usize;

    /// Bytes held by the record storage itself.
    fn memory_usage(&self) -> usize;

    /// Bytes held by auxiliary structures (filters, samplers, indices).
    fn aux_memory_usage(&self) -> usize;
}

// ------------------------------------------------------------------------------------------------
// Capability subtraits
// ------------------------------------------------------------------------------------------------

/// Shards whose records are stored in key order with positional access.
pub trait SortedShard<R: KeyedRecord>: Shard<R> {
    /// Index of the first record whose key is `>= key`.
    fn lower_bound(&self, key: &R::Key) -> usize;

    /// Index one past the last record whose key is `<= key`.
    fn upper_bound(&self, key: &R::Key) -> usize;

    /// The record at position `idx`, if in bounds.
    fn get_at(&self, idx: usize) -> Option<&Wrapped<R>>;
}

/// Shards that support weight-proportional record sampling.
pub trait WeightedShard<R: Record>: Shard<R> {
    /// Sum of live-record weights.
    fn total_weight(&self) -> f64;

    /// Draws the index of one record with probability proportional to
    /// its weight. `None` when the shard holds no positive weight.
    fn weighted_sample<G: Rng + ?Sized>(&self, rng: &mut G) -> Option<usize>;
}

/// Shards over metric-space records supporting k-nearest-neighbour
/// search.
pub trait DistanceShard<R: DistanceRecord>: Shard<R> {
    /// The `k` stored records closest to `point`, nearest first.
    fn nearest_search(&self, point: &R, k: usize) -> Vec<&Wrapped<R>>;
}
