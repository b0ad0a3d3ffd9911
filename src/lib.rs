//! # Dynamize
//!
//! A generic framework that turns any **static** data structure — one
//! that supports bulk construction plus read-only queries — into a
//! **dynamic** index with insertion, deletion, and safe concurrent reads
//! during background reorganization.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    DynamicExtension                        │
//! │  ┌────────────┐   ┌──────────────────────────────────┐     │
//! │  │  Mutable   │   │       ExtensionStructure         │     │
//! │  │  Buffer    │   │  level 0: [shard][shard]         │     │
//! │  │  (ring)    │   │  level 1: [  shard  ]            │     │
//! │  └─────┬──────┘   │  level 2: [     shard      ]     │     │
//! │        │  flush   └──────────────┬───────────────────┘     │
//! │        └─────────► merge/compact │                         │
//! │                                  │                         │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Scheduler (query + reconstruction worker pool)      │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │  Epochs (previous / current / next snapshots)        │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`extension`] | Public facade — insert, erase, query, snapshot, stats |
//! | [`buffer`] | Lock-amortized append-only ring; the write front-end |
//! | [`structure`] | Leveled shard hierarchy and the reconstruction planner |
//! | [`epoch`] | Reference-counted (structure, buffer-head) snapshots |
//! | [`scheduler`] | Two-class job scheduler with a reconstruction memory budget |
//! | [`shard`] | The contract a static structure satisfies, plus a sorted-run reference shard |
//! | [`query`] | The query contract and reference range/count/point queries |
//! | [`record`] | Record capability traits and the two-bit envelope |
//! | [`util`] | Cancelling merges, tombstone bloom filters, alias sampling |
//!
//! ## Key Properties
//!
//! - **Query performance is inherited** — the framework adds a bounded
//!   number of partitions (buffer + shards) over the static structure's
//!   own query cost.
//! - **Reads never block** — queries pin an immutable epoch and a buffer
//!   view; reconstruction publishes a new epoch instead of mutating the
//!   old one.
//! - **Deletes are logical** — tombstones cancel lazily during merges,
//!   or records are tagged in place under single-threaded scheduling.
//! - **Reconstruction is budgeted** — a configurable byte budget gates
//!   in-flight merges; layout policies (tiering, leveling, Bentley–Saxe)
//!   bound write amplification.
//!
//! ## Quick Start
//!
//! ```rust
//! use dynamize::{DynamicExtension, ExtensionConfig, KeyValue, RangeParams, RangeQuery,
//!     SortedRunShard};
//!
//! let config = ExtensionConfig {
//!     buffer_lwm: 100,
//!     buffer_hwm: 1_000,
//!     scale_factor: 2,
//!     thread_count: 0, // serial scheduler: deterministic, inline jobs
//!     ..ExtensionConfig::default()
//! };
//!
//! let index: DynamicExtension<KeyValue<u64, u64>, SortedRunShard<u64, u64>> =
//!     DynamicExtension::new(config).unwrap();
//!
//! // Write
//! for k in 0..500u64 {
//!     index.insert(KeyValue::new(k, k * 10)).unwrap();
//! }
//!
//! // Read
//! let hits = index
//!     .query::<RangeQuery<u64, u64>>(RangeParams { lower: 10, upper: 19 })
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//! assert_eq!(hits.len(), 10);
//!
//! // Delete
//! index.erase(KeyValue::new(10, 100)).unwrap();
//! index.await_next_epoch();
//! assert_eq!(index.record_count(), 499);
//! ```

#![allow(dead_code)]

pub mod buffer;
pub mod config;
pub mod epoch;
pub mod extension;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod shard;
pub mod structure;
pub mod util;

pub use buffer::{BufferError, BufferView, MutableBuffer};
pub use config::{ConfigError, DeletePolicy, ExtensionConfig, LayoutPolicy};
pub use extension::{DynamicExtension, ExtensionError, QueryFuture};
pub use query::{
    PointParams, PointQuery, Query, RangeCountQuery, RangeParams, RangeQuery, ResultRecord,
};
pub use record::{DistanceRecord, KeyValue, KeyedRecord, Record, Wrapped};
pub use scheduler::{CoreBinding, JobScheduler, NoBinding, SchedulerStats};
pub use shard::{
    BuildOptions, DistanceShard, Shard, SortedRunShard, SortedShard, WeightedShard,
};
