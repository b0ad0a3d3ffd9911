use crate::record::{Record, Wrapped};
use crate::util::merge::{TombstoneCancel, WrappedMerge, merge_and_cancel, sort_and_cancel};

fn live(v: u64) -> Wrapped<u64> {
    Wrapped::new(v)
}

fn tomb(v: u64) -> Wrapped<u64> {
    Wrapped::new_tombstone(v)
}

fn boxed<R: Record>(records: Vec<Wrapped<R>>) -> Box<dyn Iterator<Item = Wrapped<R>>> {
    Box::new(records.into_iter())
}

fn values(records: &[Wrapped<u64>]) -> Vec<(u64, bool)> {
    records.iter().map(|w| (*w.rec(), w.is_tombstone())).collect()
}

#[test]
fn test_merge_interleaves_sorted_streams() {
    let merged: Vec<_> = WrappedMerge::new(vec![
        boxed(vec![live(1), live(4), live(7)]),
        boxed(vec![live(2), live(5)]),
        boxed(vec![live(3), live(6)]),
    ])
    .collect();

    assert_eq!(
        values(&merged),
        (1..=7).map(|v| (v, false)).collect::<Vec<_>>()
    );
}

#[test]
fn test_merge_places_tombstone_after_matching_live() {
    let merged: Vec<_> = WrappedMerge::new(vec![
        boxed(vec![live(3)]),
        boxed(vec![tomb(3)]),
    ])
    .collect();

    assert_eq!(values(&merged), vec![(3, false), (3, true)]);
}

#[test]
fn test_cancel_drops_matched_pair() {
    let out: Vec<_> =
        TombstoneCancel::new(vec![live(1), live(2), tomb(2), live(3)].into_iter()).collect();
    assert_eq!(values(&out), vec![(1, false), (3, false)]);
}

#[test]
fn test_cancel_nets_duplicates_pairwise() {
    // Two inserts and two erases of the same record net to nothing.
    let out: Vec<_> =
        TombstoneCancel::new(vec![live(5), live(5), tomb(5), tomb(5)].into_iter()).collect();
    assert!(out.is_empty());

    // Three inserts, one erase: two copies survive.
    let out: Vec<_> =
        TombstoneCancel::new(vec![live(5), live(5), live(5), tomb(5)].into_iter()).collect();
    assert_eq!(values(&out), vec![(5, false), (5, false)]);
}

#[test]
fn test_unmatched_tombstone_retained_by_default() {
    let out: Vec<_> = TombstoneCancel::new(vec![live(1), tomb(2)].into_iter()).collect();
    assert_eq!(values(&out), vec![(1, false), (2, true)]);
}

#[test]
fn test_unmatched_tombstone_dropped_without_retention() {
    let out: Vec<_> =
        TombstoneCancel::with_retention(vec![live(1), tomb(2), tomb(3)].into_iter(), false)
            .collect();
    assert_eq!(values(&out), vec![(1, false)]);
}

#[test]
fn test_excess_tombstones_survive_cancellation() {
    // One live, two tombstones: the pair cancels, one tombstone remains.
    let out: Vec<_> =
        TombstoneCancel::new(vec![live(5), tomb(5), tomb(5)].into_iter()).collect();
    assert_eq!(values(&out), vec![(5, true)]);
}

#[test]
fn test_tagged_records_dropped() {
    let tagged = live(2);
    tagged.set_deleted();
    let out: Vec<_> =
        TombstoneCancel::new(vec![live(1), tagged, live(3)].into_iter()).collect();
    assert_eq!(values(&out), vec![(1, false), (3, false)]);
}

#[test]
fn test_merge_and_cancel_across_streams() {
    // The tombstone lives in a different stream than its victim.
    let out: Vec<_> = merge_and_cancel(
        vec![
            boxed(vec![live(1), live(2), live(3)]),
            boxed(vec![tomb(2)]),
        ],
        true,
    )
    .collect();
    assert_eq!(values(&out), vec![(1, false), (3, false)]);
}

#[test]
fn test_sort_and_cancel_unordered_input() {
    let out = sort_and_cancel(vec![live(3), tomb(1), live(2), live(1)], true);
    assert_eq!(values(&out), vec![(2, false), (3, false)]);
}

#[test]
fn test_empty_inputs() {
    let out: Vec<Wrapped<u64>> = merge_and_cancel(vec![], true).collect();
    assert!(out.is_empty());

    let out = sort_and_cancel(Vec::<Wrapped<u64>>::new(), false);
    assert!(out.is_empty());
}
