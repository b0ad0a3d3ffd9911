//! Reference queries over sorted-run shards.
//!
//! [`RangeQuery`] returns the live records in an inclusive key range in
//! key order. [`RangeCountQuery`] returns only their number, skipping
//! the per-record delete filter by netting tombstones arithmetically.
//! [`PointQuery`] resolves a single record, aborting at the freshest
//! partition that knows the answer.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::marker::PhantomData;

use crate::buffer::BufferView;
use crate::query::Query;
use crate::record::{KeyValue, KeyedRecord, Wrapped};
use crate::shard::sorted_run::{RunKey, RunValue};
use crate::shard::{Shard, SortedRunShard, SortedShard};

// ------------------------------------------------------------------------------------------------
// RangeQuery
// ------------------------------------------------------------------------------------------------

/// Parameters of a range query: the inclusive key interval `[lower, upper]`.
#[derive(Debug, Clone)]
pub struct RangeParams<K> {
    pub lower: K,
    pub upper: K,
}

/// Precomputed shard slice for one range invocation.
pub struct ShardRange {
    start: usize,
    end: usize,
}

/// Returns all live records with keys in `[lower, upper]`, sorted by key.
pub struct RangeQuery<K, V> {
    _marker: PhantomData<(K, V)>,
}

impl<K: RunKey, V: RunValue> Query<KeyValue<K, V>, SortedRunShard<K, V>> for RangeQuery<K, V> {
    type Parameters = RangeParams<K>;
    type LocalShardQuery = ShardRange;
    type LocalBufferQuery = RangeParams<K>;
    type LocalResult = Wrapped<KeyValue<K, V>>;
    type Result = Vec<KeyValue<K, V>>;

    fn preproc_shard(shard: &SortedRunShard<K, V>, params: &Self::Parameters) -> ShardRange {
        ShardRange {
            start: shard.lower_bound(&params.lower),
            end: shard.upper_bound(&params.upper),
        }
    }

    fn preproc_buffer(
        _view: &BufferView<'_, KeyValue<K, V>>,
        params: &Self::Parameters,
    ) -> Self::LocalBufferQuery {
        params.clone()
    }

    fn execute_shard(
        shard: &SortedRunShard<K, V>,
        local: &ShardRange,
    ) -> Vec<Self::LocalResult> {
        shard.records()[local.start..local.end].to_vec()
    }

    fn execute_buffer(
        view: &BufferView<'_, KeyValue<K, V>>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Self::LocalResult> {
        view.records()
            .filter(|w| {
                let key = w.rec().key();
                *key >= local.lower && *key <= local.upper
            })
            .cloned()
            .collect()
    }

    fn combine(
        partials: &[Vec<Self::LocalResult>],
        _params: &Self::Parameters,
    ) -> Self::Result {
        let mut recs: Vec<KeyValue<K, V>> = partials
            .iter()
            .flatten()
            .map(|w| w.rec().clone())
            .collect();
        recs.sort();
        recs
    }
}

// ------------------------------------------------------------------------------------------------
// RangeCountQuery
// ------------------------------------------------------------------------------------------------

/// Counts the live records with keys in `[lower, upper]`.
///
/// Carries no per-record state: each partition reports live records
/// minus tombstones in range, and the facade's delete filter is skipped.
/// An erased record and its pending tombstone share a key, so the pair
/// nets to zero across partitions.
pub struct RangeCountQuery<K, V> {
    _marker: PhantomData<(K, V)>,
}

impl<K: RunKey, V: RunValue> Query<KeyValue<K, V>, SortedRunShard<K, V>>
    for RangeCountQuery<K, V>
{
    type Parameters = RangeParams<K>;
    type LocalShardQuery = ShardRange;
    type LocalBufferQuery = RangeParams<K>;
    type LocalResult = i64;
    type Result = u64;

    const SKIP_DELETE_FILTER: bool = true;

    fn preproc_shard(shard: &SortedRunShard<K, V>, params: &Self::Parameters) -> ShardRange {
        ShardRange {
            start: shard.lower_bound(&params.lower),
            end: shard.upper_bound(&params.upper),
        }
    }

    fn preproc_buffer(
        _view: &BufferView<'_, KeyValue<K, V>>,
        params: &Self::Parameters,
    ) -> Self::LocalBufferQuery {
        params.clone()
    }

    fn execute_shard(
        shard: &SortedRunShard<K, V>,
        local: &ShardRange,
    ) -> Vec<Self::LocalResult> {
        let net = shard.records()[local.start..local.end]
            .iter()
            .map(net_count)
            .sum();
        vec![net]
    }

    fn execute_buffer(
        view: &BufferView<'_, KeyValue<K, V>>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Self::LocalResult> {
        let net = view
            .records()
            .filter(|w| {
                let key = w.rec().key();
                *key >= local.lower && *key <= local.upper
            })
            .map(net_count)
            .sum();
        vec![net]
    }

    fn combine(
        partials: &[Vec<Self::LocalResult>],
        _params: &Self::Parameters,
    ) -> Self::Result {
        let total: i64 = partials.iter().flatten().sum();
        total.max(0) as u64
    }
}

/// Contribution of one envelope to a net live count.
fn net_count<K: RunKey, V: RunValue>(w: &Wrapped<KeyValue<K, V>>) -> i64 {
    if w.is_tombstone() {
        // A tombstone negates itself and its victim.
        -1
    } else if w.is_deleted() {
        0
    } else {
        1
    }
}

// ------------------------------------------------------------------------------------------------
// PointQuery
// ------------------------------------------------------------------------------------------------

/// Parameters of a point lookup: the exact record sought.
#[derive(Debug, Clone)]
pub struct PointParams<K, V> {
    pub target: KeyValue<K, V>,
}

/// Resolves a single record by exact value.
///
/// Early-aborts at the freshest partition holding either the record or
/// its tombstone; the delete filter then decides which of the two
/// outcomes the caller sees.
pub struct PointQuery<K, V> {
    _marker: PhantomData<(K, V)>,
}

impl<K: RunKey, V: RunValue> Query<KeyValue<K, V>, SortedRunShard<K, V>> for PointQuery<K, V> {
    type Parameters = PointParams<K, V>;
    type LocalShardQuery = PointParams<K, V>;
    type LocalBufferQuery = PointParams<K, V>;
    type LocalResult = Wrapped<KeyValue<K, V>>;
    type Result = Option<KeyValue<K, V>>;

    const EARLY_ABORT: bool = true;

    fn preproc_shard(
        _shard: &SortedRunShard<K, V>,
        params: &Self::Parameters,
    ) -> Self::LocalShardQuery {
        params.clone()
    }

    fn preproc_buffer(
        _view: &BufferView<'_, KeyValue<K, V>>,
        params: &Self::Parameters,
    ) -> Self::LocalBufferQuery {
        params.clone()
    }

    fn execute_shard(
        shard: &SortedRunShard<K, V>,
        local: &Self::LocalShardQuery,
    ) -> Vec<Self::LocalResult> {
        shard
            .point_lookup(&local.target, false)
            .map(|w| vec![w.clone()])
            .unwrap_or_default()
    }

    fn execute_buffer(
        view: &BufferView<'_, KeyValue<K, V>>,
        local: &Self::LocalBufferQuery,
    ) -> Vec<Self::LocalResult> {
        // Newest-to-oldest so the record's current buffer state wins.
        for idx in (0..view.record_count()).rev() {
            let w = view.get(idx).expect("index within view bounds");
            if w.rec() == &local.target {
                return vec![w.clone()];
            }
        }
        Vec::new()
    }

    fn combine(
        partials: &[Vec<Self::LocalResult>],
        _params: &Self::Parameters,
    ) -> Self::Result {
        partials
            .iter()
            .flatten()
            .find(|w| w.is_visible())
            .map(|w| w.rec().clone())
    }
}
