//! # Query Module
//!
//! The external contract a query type must satisfy, and the reference
//! queries over sorted-run shards.
//!
//! ## Pipeline
//!
//! A query is a stateless type; all per-invocation state lives in its
//! associated types. The facade drives one invocation as:
//!
//! 1. `preproc_shard` once per shard and `preproc_buffer` once — build
//!    local query state per partition.
//! 2. `distribute` once — coordinate cross-partition state (e.g. split a
//!    sample budget proportionally to partition weights).
//! 3. `execute_buffer`, then `execute_shard` per shard, freshest
//!    partition first. With [`Query::EARLY_ABORT`], execution stops at
//!    the first partition producing any local result.
//! 4. Delete filtering of every local result list (unless
//!    [`Query::SKIP_DELETE_FILTER`]), then `combine`.
//! 5. `repeat` may mutate the parameters and request another round —
//!    sampling queries use this to top up short draws.

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub mod range;

pub use range::{PointParams, PointQuery, RangeCountQuery, RangeParams, RangeQuery};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use crate::buffer::BufferView;
use crate::record::{Record, Wrapped};
use crate::shard::Shard;

// ------------------------------------------------------------------------------------------------
// ResultRecord — envelope access for delete filtering
// ------------------------------------------------------------------------------------------------

/// Gives the facade's delete filter access to the record envelope behind
/// a local result.
///
/// Results that carry no per-record state (counts, aggregates) return
/// `None` and should set [`Query::SKIP_DELETE_FILTER`].
pub trait ResultRecord<R: Record> {
    fn wrapped(&self) -> Option<&Wrapped<R>>;
}

impl<R: Record> ResultRecord<R> for Wrapped<R> {
    fn wrapped(&self) -> Option<&Wrapped<R>> {
        Some(self)
    }
}

impl<R: Record> ResultRecord<R> for i64 {
    fn wrapped(&self) -> Option<&Wrapped<R>> {
        None
    }
}

// ------------------------------------------------------------------------------------------------
// Query trait
// ------------------------------------------------------------------------------------------------

/// Contract of a query over record type `R` and shard type `S`.
pub trait Query<R: Record, S: Shard<R>>: 'static {
    /// Caller-supplied invocation parameters; owned by the query job.
    type Parameters: Send + 'static;

    /// Per-shard preprocessed state.
    type LocalShardQuery: Send;

    /// Buffer preprocessed state.
    type LocalBufferQuery: Send;

    /// One partition-local result item.
    type LocalResult: ResultRecord<R> + Send;

    /// The combined, caller-facing result.
    type Result: Send + 'static;

    /// Stop executing partitions after the first non-empty local result.
    /// Point-like queries set this; the freshest partition wins.
    const EARLY_ABORT: bool = false;

    /// Local results carry no per-record deletion state; skip the
    /// facade's delete filter.
    const SKIP_DELETE_FILTER: bool = false;

    fn preproc_shard(shard: &S, params: &Self::Parameters) -> Self::LocalShardQuery;

    fn preproc_buffer(view: &BufferView<'_, R>, params: &Self::Parameters)
    -> Self::LocalBufferQuery;

    /// Coordinates cross-partition state. Invoked once per round, after
    /// all preprocessing and before any local execution. The default
    /// does nothing — most queries need no coordination.
    fn distribute(
        _params: &mut Self::Parameters,
        _shard_queries: &mut [Self::LocalShardQuery],
        _buffer_query: &mut Self::LocalBufferQuery,
    ) {
    }

    fn execute_shard(shard: &S, local: &Self::LocalShardQuery) -> Vec<Self::LocalResult>;

    fn execute_buffer(
        view: &BufferView<'_, R>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Self::LocalResult>;

    /// Merges the per-partition result lists into the final result.
    /// `partials` is ordered freshest partition first (buffer, then
    /// level 0 outward).
    fn combine(partials: &[Vec<Self::LocalResult>], params: &Self::Parameters) -> Self::Result;

    /// Decides whether to run another round with the (possibly mutated)
    /// parameters. The default never repeats.
    fn repeat(_params: &mut Self::Parameters, _result: &Self::Result) -> bool {
        false
    }
}
