//! Per-shard tombstone filters.
//!
//! Under the tombstone delete policy, query-result filtering probes every
//! partition fresher than the producing shard for a dominating tombstone.
//! A [`TombstoneFilter`] built over a shard's tombstone keys turns most of
//! those probes into a single hash check.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::hash::Hash;

use bloomfilter::Bloom;
use tracing::warn;

/// A bloom filter over the tombstone keys of a single shard.
///
/// Shards with no tombstones carry an empty filter that answers `false`
/// for every probe without allocating a bitmap.
pub struct TombstoneFilter<T> {
    bloom: Option<Bloom<T>>,
    entries: usize,
}

impl<T: Hash> TombstoneFilter<T> {
    /// Builds a filter over `keys` with the requested false-positive rate.
    ///
    /// Falls back to an always-maybe filter (every probe answers `true`)
    /// if the underlying bitmap sizing fails, which only degrades probe
    /// performance, never correctness.
    pub fn build(fp_rate: f64, keys: impl ExactSizeIterator<Item = T>) -> Self {
        let entries = keys.len();
        if entries == 0 {
            return Self {
                bloom: None,
                entries: 0,
            };
        }

        match Bloom::new_for_fp_rate(entries, fp_rate) {
            Ok(mut bloom) => {
                for key in keys {
                    bloom.set(&key);
                }
                Self {
                    bloom: Some(bloom),
                    entries,
                }
            }
            Err(e) => {
                warn!(entries, fp_rate, %e, "bloom sizing failed, probes degrade to always-maybe");
                Self { bloom: None, entries }
            }
        }
    }

    /// Returns `true` when the key **may** be a tombstone in this shard.
    /// Returns `false` only when the key is definitively absent.
    pub fn may_contain(&self, key: &T) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.check(key),
            // No bitmap: empty filter answers definitively-absent, a
            // failed build must answer maybe.
            None => self.entries > 0,
        }
    }

    /// Number of keys inserted at build time.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Approximate heap footprint of the filter bitmap in bytes.
    pub fn memory_usage(&self) -> usize {
        self.bloom
            .as_ref()
            .map(|b| b.as_slice().len())
            .unwrap_or(0)
    }
}
