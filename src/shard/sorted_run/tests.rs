use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::buffer::MutableBuffer;
use crate::record::KeyValue;
use crate::shard::{BuildOptions, Shard, SortedRunShard, SortedShard, WeightedShard};

type Rec = KeyValue<u64, u64>;
type Run = SortedRunShard<u64, u64>;

fn kv(k: u64, v: u64) -> Rec {
    KeyValue::new(k, v)
}

/// Builds a run by pushing records through a buffer view, the way the
/// engine promotes the buffer.
fn build_run(records: &[(u64, u64, bool)]) -> Run {
    let buffer: MutableBuffer<Rec> = MutableBuffer::new(1, records.len().max(1) + 1);
    for (k, v, tombstone) in records {
        buffer.append(kv(*k, *v), *tombstone).unwrap();
    }
    let view = buffer.view();
    Run::build_from_view(&view, &BuildOptions::default())
}

#[test]
fn test_build_from_view_sorts() {
    let run = build_run(&[(3, 30, false), (1, 10, false), (2, 20, false)]);

    assert_eq!(run.record_count(), 3);
    assert_eq!(run.tombstone_count(), 0);
    let keys: Vec<u64> = run.records().iter().map(|w| w.rec().key).collect();
    assert_eq!(keys, vec![1, 2, 3]);
}

#[test]
fn test_build_cancels_tombstone_pairs() {
    let run = build_run(&[
        (1, 10, false),
        (2, 20, false),
        (2, 20, true),
        (3, 30, true),
    ]);

    // (2,20) cancelled against its tombstone; (3,30)'s tombstone has no
    // victim here and survives.
    assert_eq!(run.record_count(), 2);
    assert_eq!(run.tombstone_count(), 1);
}

#[test]
fn test_build_drops_tagged_records() {
    let buffer: MutableBuffer<Rec> = MutableBuffer::new(1, 8);
    buffer.append(kv(1, 10), false).unwrap();
    buffer.append(kv(2, 20), false).unwrap();
    let view = buffer.view();
    view.tag_delete(&kv(1, 10));

    let run = Run::build_from_view(&view, &BuildOptions::default());
    assert_eq!(run.record_count(), 1);
    assert_eq!(run.records()[0].rec().key, 2);
}

#[test]
fn test_point_lookup() {
    let run = build_run(&[(1, 10, false), (5, 50, false), (9, 90, true)]);

    assert!(run.point_lookup(&kv(5, 50), false).is_some());
    assert!(run.point_lookup(&kv(5, 51), false).is_none());
    assert!(run.point_lookup(&kv(4, 40), false).is_none());

    // Tombstones are found too; the header tells them apart.
    let hit = run.point_lookup(&kv(9, 90), false).unwrap();
    assert!(hit.is_tombstone());
}

#[test]
fn test_filtered_lookup_skips_non_tombstone_keys() {
    let run = build_run(&[(1, 10, false), (9, 90, true)]);

    // The filter is built over tombstone keys only: a filtered probe for
    // a live-only key answers None without a search.
    assert!(run.point_lookup(&kv(1, 10), true).is_none());
    assert!(run.point_lookup(&kv(9, 90), true).is_some());
}

#[test]
fn test_bounds() {
    let run = build_run(&[
        (10, 1, false),
        (20, 2, false),
        (20, 3, false),
        (30, 4, false),
    ]);

    assert_eq!(run.lower_bound(&20), 1);
    assert_eq!(run.upper_bound(&20), 3);
    assert_eq!(run.lower_bound(&5), 0);
    assert_eq!(run.lower_bound(&35), 4);
    assert_eq!(run.upper_bound(&35), 4);

    assert_eq!(run.get_at(0).unwrap().rec().key, 10);
    assert!(run.get_at(4).is_none());
}

#[test]
fn test_build_from_shards_merges_and_cancels() {
    // The tombstone in the younger run meets its victim in the older one.
    let older = build_run(&[(1, 10, false), (2, 20, false), (3, 30, false)]);
    let newer = build_run(&[(2, 20, true), (4, 40, false)]);

    let merged = Run::build_from_shards(&[&newer, &older], &BuildOptions::default());
    let keys: Vec<u64> = merged.records().iter().map(|w| w.rec().key).collect();
    assert_eq!(keys, vec![1, 3, 4]);
    assert_eq!(merged.tombstone_count(), 0);
}

#[test]
fn test_build_from_shards_can_drop_spent_tombstones() {
    let only = build_run(&[(1, 10, false), (9, 90, true)]);

    let opts = BuildOptions {
        retain_tombstones: false,
        ..BuildOptions::default()
    };
    let rebuilt = Run::build_from_shards(&[&only], &opts);
    assert_eq!(rebuilt.record_count(), 1);
    assert_eq!(rebuilt.tombstone_count(), 0);
}

#[test]
fn test_tag_delete_counts() {
    let run = build_run(&[(1, 10, false), (2, 20, false)]);

    assert!(run.tag_delete(&kv(2, 20)));
    assert_eq!(run.deleted_count(), 1);
    // Already tagged; nothing left to tag.
    assert!(!run.tag_delete(&kv(2, 20)));
    assert!(!run.tag_delete(&kv(7, 70)));
    assert_eq!(run.deleted_count(), 1);
}

#[test]
fn test_weighted_sampling() {
    let run = build_run(&[(1, 10, false), (2, 20, false), (3, 30, false)]);
    let mut rng = StdRng::seed_from_u64(11);

    assert_eq!(run.total_weight(), 3.0);
    for _ in 0..100 {
        let idx = run.weighted_sample(&mut rng).unwrap();
        assert!(idx < 3);
    }

    let empty = build_run(&[]);
    assert!(empty.weighted_sample(&mut rng).is_none());
}

#[test]
fn test_memory_accounting() {
    let run = build_run(&[(1, 10, false), (2, 20, true)]);
    assert!(run.memory_usage() > 0);
    // Aux covers the tombstone filter and the sampler.
    assert!(run.aux_memory_usage() > 0);
}
