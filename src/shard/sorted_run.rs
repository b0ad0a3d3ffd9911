//! Reference shard: a sorted run of key/value records.
//!
//! The simplest structure satisfying the full shard contract — a sorted
//! array with binary-search bounds, a bloom filter over tombstone keys,
//! and an alias table for weighted sampling. It is what the test suite
//! dynamizes, and the model for implementing richer shard types.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tracing::debug;

use crate::buffer::BufferView;
use crate::record::{KeyValue, KeyedRecord, Wrapped};
use crate::shard::{BuildOptions, Shard, SortedShard, WeightedShard};
use crate::util::alias::AliasTable;
use crate::util::bloom::TombstoneFilter;
use crate::util::merge;

/// Trait alias bounds for the key and value types of a sorted run.
///
/// Keys additionally need `Hash` for the tombstone filter.
pub trait RunKey: Clone + Eq + Ord + Hash + Send + Sync + 'static {}
impl<T: Clone + Eq + Ord + Hash + Send + Sync + 'static> RunKey for T {}

pub trait RunValue: Clone + Eq + Ord + Send + Sync + 'static {}
impl<T: Clone + Eq + Ord + Send + Sync + 'static> RunValue for T {}

// ------------------------------------------------------------------------------------------------
// SortedRunShard
// ------------------------------------------------------------------------------------------------

/// An immutable sorted run of wrapped key/value records.
pub struct SortedRunShard<K: RunKey, V: RunValue> {
    /// Records in envelope order (key, value, tombstone flag).
    records: Vec<Wrapped<KeyValue<K, V>>>,

    /// Bloom filter over tombstone keys; consulted by filtered lookups.
    filter: TombstoneFilter<K>,

    /// Alias table over record weights; tombstones carry zero weight.
    sampler: Option<AliasTable>,

    tombstones: usize,
    deleted: AtomicUsize,
}

impl<K: RunKey, V: RunValue> SortedRunShard<K, V> {
    /// Assembles a run from already sorted-and-cancelled records.
    fn assemble(records: Vec<Wrapped<KeyValue<K, V>>>, opts: &BuildOptions) -> Self {
        let tombstones = records.iter().filter(|w| w.is_tombstone()).count();

        let tombstone_keys: Vec<K> = records
            .iter()
            .filter(|w| w.is_tombstone())
            .map(|w| w.rec().key.clone())
            .collect();
        let filter = TombstoneFilter::build(opts.bloom_fp_rate, tombstone_keys.into_iter());

        let weights: Vec<f64> = records.iter().map(|w| w.weight()).collect();
        let sampler = AliasTable::new(&weights);

        debug!(
            records = records.len(),
            tombstones, "sorted run assembled"
        );

        Self {
            records,
            filter,
            sampler,
            tombstones,
            deleted: AtomicUsize::new(0),
        }
    }

    /// All records of the run, envelope order.
    pub fn records(&self) -> &[Wrapped<KeyValue<K, V>>] {
        &self.records
    }

    /// Position of the first record not below `rec` in envelope order.
    fn search(&self, rec: &KeyValue<K, V>) -> usize {
        self.records.partition_point(|w| w.rec() < rec)
    }
}

impl<K: RunKey, V: RunValue> Shard<KeyValue<K, V>> for SortedRunShard<K, V> {
    fn build_from_view(view: &BufferView<'_, KeyValue<K, V>>, opts: &BuildOptions) -> Self {
        Self::assemble(
            merge::sort_and_cancel(view.clone_records(), opts.retain_tombstones),
            opts,
        )
    }

    fn build_from_shards(sources: &[&Self], opts: &BuildOptions) -> Self {
        let iters: Vec<Box<dyn Iterator<Item = Wrapped<KeyValue<K, V>>> + '_>> = sources
            .iter()
            .map(|s| {
                Box::new(s.records.iter().cloned())
                    as Box<dyn Iterator<Item = Wrapped<KeyValue<K, V>>> + '_>
            })
            .collect();

        Self::assemble(
            merge::merge_and_cancel(iters, opts.retain_tombstones).collect(),
            opts,
        )
    }

    fn point_lookup(&self, rec: &KeyValue<K, V>, use_filter: bool) -> Option<&Wrapped<KeyValue<K, V>>> {
        if use_filter && !self.filter.may_contain(&rec.key) {
            return None;
        }

        let idx = self.search(rec);
        self.records.get(idx).filter(|w| w.rec() == rec)
    }

    fn tag_delete(&self, rec: &KeyValue<K, V>) -> bool {
        let mut idx = self.search(rec);
        while let Some(w) = self.records.get(idx) {
            if w.rec() != rec {
                break;
            }
            if w.is_visible() && w.set_deleted() {
                self.deleted.fetch_add(1, Ordering::AcqRel);
                return true;
            }
            idx += 1;
        }
        false
    }

    fn record_count(&self) -> usize {
        self.records.len()
    }

    fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Acquire)
    }

    fn memory_usage(&self) -> usize {
        self.records.len() * size_of::<Wrapped<KeyValue<K, V>>>()
    }

    fn aux_memory_usage(&self) -> usize {
        self.filter.memory_usage()
            + self
                .sampler
                .as_ref()
                .map(AliasTable::memory_usage)
                .unwrap_or(0)
    }
}

impl<K: RunKey, V: RunValue> SortedShard<KeyValue<K, V>> for SortedRunShard<K, V> {
    fn lower_bound(&self, key: &K) -> usize {
        self.records.partition_point(|w| w.rec().key() < key)
    }

    fn upper_bound(&self, key: &K) -> usize {
        self.records.partition_point(|w| w.rec().key() <= key)
    }

    fn get_at(&self, idx: usize) -> Option<&Wrapped<KeyValue<K, V>>> {
        self.records.get(idx)
    }
}

impl<K: RunKey, V: RunValue> WeightedShard<KeyValue<K, V>> for SortedRunShard<K, V> {
    fn total_weight(&self) -> f64 {
        self.sampler
            .as_ref()
            .map(AliasTable::total_weight)
            .unwrap_or(0.0)
    }

    fn weighted_sample<G: Rng + ?Sized>(&self, rng: &mut G) -> Option<usize> {
        self.sampler.as_ref().map(|s| s.sample(rng))
    }
}
