//! # Configuration Module
//!
//! Runtime configuration for a dynamized index: buffer watermarks, level
//! growth, deletion policy, scheduling, and reconstruction budgets.
//!
//! All settings are validated once, at facade construction; an invalid
//! combination is rejected up front rather than surfacing as a hard-to-trace
//! invariant failure later.

use thiserror::Error;

/// Error raised when an [`ExtensionConfig`] fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// How shards accumulate within levels and cascade between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutPolicy {
    /// One shard per level; an overflowing level merges its shard into
    /// the next level down.
    Leveling,

    /// Up to `scale_factor` shards per level; a full level merges all of
    /// its shards into a single shard one level down.
    #[default]
    Tiering,

    /// Bentley–Saxe monotone: a flush merges the buffer with every level
    /// above the first vacant one, growing height instead of merging in
    /// place.
    Bsm,
}

/// How erasure is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Erase appends a tombstone record; cancellation happens lazily in
    /// shard-producing merges.
    #[default]
    Tombstone,

    /// Erase tags the matching record's deleted bit in place. Requires
    /// the serial scheduler (`thread_count == 0`).
    Tagging,
}

/// Configuration for a dynamized index.
///
/// Defaults favour a read-mostly workload on a machine with a moderate
/// core count; any field can be overridden with struct-update syntax:
///
/// ```rust
/// use dynamize::ExtensionConfig;
///
/// let config = ExtensionConfig {
///     buffer_lwm: 500,
///     buffer_hwm: 4_000,
///     ..ExtensionConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ExtensionConfig {
    /// Buffer occupancy (records) at which a reconstruction is scheduled.
    pub buffer_lwm: usize,

    /// Buffer occupancy (records) at which appends are rejected.
    pub buffer_hwm: usize,

    /// Per-level capacity growth multiplier.
    pub scale_factor: usize,

    /// Maximum tolerated tombstone fraction per level; `1.0` disables
    /// tombstone compaction entirely.
    pub max_delete_prop: f64,

    /// Bytes of in-flight reconstruction allowed at once; `0` means
    /// unbounded.
    pub memory_budget: usize,

    /// Worker pool size. `0` selects the serial scheduler, which runs
    /// every job inline on the calling thread.
    pub thread_count: usize,

    /// False-positive rate for per-shard tombstone bloom filters.
    pub bloom_fp_rate: f64,

    /// Shard layout policy.
    pub layout_policy: LayoutPolicy,

    /// Deletion policy.
    pub delete_policy: DeletePolicy,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            buffer_lwm: 1_000,
            buffer_hwm: 12_000,
            scale_factor: 6,
            max_delete_prop: 1.0,
            memory_budget: 0,
            thread_count: 16,
            bloom_fp_rate: 0.01,
            layout_policy: LayoutPolicy::default(),
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl ExtensionConfig {
    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_lwm == 0 {
            return Err(ConfigError("buffer_lwm must be positive".into()));
        }
        if self.buffer_lwm >= self.buffer_hwm {
            return Err(ConfigError(format!(
                "buffer_lwm ({}) must be below buffer_hwm ({})",
                self.buffer_lwm, self.buffer_hwm
            )));
        }
        if self.scale_factor < 2 {
            return Err(ConfigError(format!(
                "scale_factor ({}) must be at least 2",
                self.scale_factor
            )));
        }
        if !(self.max_delete_prop > 0.0 && self.max_delete_prop <= 1.0) {
            return Err(ConfigError(format!(
                "max_delete_prop ({}) must be in (0, 1]",
                self.max_delete_prop
            )));
        }
        if !(self.bloom_fp_rate > 0.0 && self.bloom_fp_rate < 1.0) {
            return Err(ConfigError(format!(
                "bloom_fp_rate ({}) must be in (0, 1)",
                self.bloom_fp_rate
            )));
        }
        if self.delete_policy == DeletePolicy::Tagging && self.thread_count != 0 {
            return Err(ConfigError(
                "tagging deletes require the serial scheduler (thread_count == 0)".into(),
            ));
        }
        Ok(())
    }
}
