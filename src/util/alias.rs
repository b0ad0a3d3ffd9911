//! Walker alias tables for constant-time weighted sampling.
//!
//! Weighted shards answer `weighted_sample` by drawing an index from an
//! alias table built over their record weights at construction time.
//! Build is O(n); each draw costs one uniform index, one uniform coin,
//! and one table lookup.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use rand::Rng;

/// A precomputed Walker alias table over a fixed weight vector.
pub struct AliasTable {
    /// Acceptance probability per slot.
    prob: Vec<f64>,
    /// Fallback index per slot.
    alias: Vec<usize>,
    total_weight: f64,
}

impl AliasTable {
    /// Builds a table from the given weights.
    ///
    /// Returns `None` when `weights` is empty or carries no positive
    /// weight — there is nothing to sample from.
    pub fn new(weights: &[f64]) -> Option<Self> {
        let n = weights.len();
        let total: f64 = weights.iter().copied().filter(|w| *w > 0.0).sum();
        if n == 0 || total <= 0.0 {
            return None;
        }

        // Scale each weight to mean 1.0, then split the slots into
        // under-full and over-full worklists.
        let mut prob = vec![0.0; n];
        let mut alias = vec![0usize; n];
        let mut scaled: Vec<f64> = weights
            .iter()
            .map(|w| (w.max(0.0) / total) * n as f64)
            .collect();

        let mut small = Vec::new();
        let mut large = Vec::new();
        for (i, p) in scaled.iter().enumerate() {
            if *p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while !small.is_empty() && !large.is_empty() {
            let s = small.pop().expect("checked non-empty");
            let l = *large.last().expect("checked non-empty");

            prob[s] = scaled[s];
            alias[s] = l;
            scaled[l] = (scaled[l] + scaled[s]) - 1.0;
            if scaled[l] < 1.0 {
                large.pop();
                small.push(l);
            }
        }

        // Remaining slots are full up to floating-point error.
        for i in large.into_iter().chain(small) {
            prob[i] = 1.0;
        }

        Some(Self {
            prob,
            alias,
            total_weight: total,
        })
    }

    /// Draws one index with probability proportional to its weight.
    pub fn sample<G: Rng + ?Sized>(&self, rng: &mut G) -> usize {
        let slot = rng.random_range(0..self.prob.len());
        if rng.random::<f64>() < self.prob[slot] {
            slot
        } else {
            self.alias[slot]
        }
    }

    /// Sum of the positive input weights.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Number of slots in the table.
    pub fn len(&self) -> usize {
        self.prob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        self.prob.len() * (size_of::<f64>() + size_of::<usize>())
    }
}
