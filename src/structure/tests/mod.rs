
use std::sync::Arc;

use crate::buffer::MutableBuffer;
use crate::config::{ExtensionConfig, LayoutPolicy};
use crate::record::KeyValue;
use crate::shard::{BuildOptions, SortedRunShard};
use crate::structure::ExtensionStructure;

pub type Rec = KeyValue<u64, u64>;
pub type Run = SortedRunShard<u64, u64>;
pub type Structure = ExtensionStructure<Rec, Run>;

pub fn config(layout: LayoutPolicy, scale_factor: usize, hwm: usize) -> Arc<ExtensionConfig> {
    Arc::new(ExtensionConfig {
        buffer_lwm: hwm / 2,
        buffer_hwm: hwm,
        scale_factor,
        layout_policy: layout,
        thread_count: 0,
        ..ExtensionConfig::default()
    })
}

/// Pushes `keys` through a buffer view and executes a full flush plan,
/// the way one reconstruction absorbs the buffer.
pub fn flush_keys(structure: &mut Structure, keys: impl IntoIterator<Item = u64>) {
    flush_records(structure, keys.into_iter().map(|k| (k, k, false)));
}

pub fn flush_records(
    structure: &mut Structure,
    records: impl IntoIterator<Item = (u64, u64, bool)>,
) {
    let records: Vec<_> = records.into_iter().collect();
    let buffer: MutableBuffer<Rec> = MutableBuffer::new(1, records.len().max(1) + 1);
    for (k, v, tombstone) in records {
        buffer.append(KeyValue::new(k, v), tombstone).unwrap();
    }
    let view = buffer.view();

    let plan = structure.plan_flush(view.record_count());
    for task in &plan {
        structure.execute_task(task, Some(&view), &BuildOptions::default());
    }
}

/// Shard counts per level, level 0 first.
pub fn shape(structure: &Structure) -> Vec<usize> {
    structure.levels().iter().map(|l| l.shard_count()).collect()
}
