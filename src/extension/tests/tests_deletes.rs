#[cfg(test)]
mod tests {
    use crate::extension::ExtensionError;
    use crate::extension::tests::helpers::{
        fill, kv, range_keys, serial_index, tagging_index,
    };
    use crate::query::{PointParams, PointQuery};

    // --------------------------------------------------------------------------------------------
    // Tombstone policy
    // --------------------------------------------------------------------------------------------

    #[test]
    fn test_tombstone_erase_in_buffer() {
        let index = serial_index(100, 1_000, 2);
        fill(&index, 0..50);
        index.erase(kv(20, 20)).unwrap();

        assert_eq!(index.record_count(), 49);
        let keys = range_keys(&index, 0, 49);
        assert_eq!(keys.len(), 49);
        assert!(!keys.contains(&20));
    }

    #[test]
    fn test_tombstone_suppresses_flushed_victim() {
        let index = serial_index(100, 1_000, 2);
        // One flush absorbs keys 0..100; the rest stays buffered.
        fill(&index, 0..150);
        assert_eq!(index.height(), 1);

        // The victim lives in a shard, the tombstone in the buffer.
        index.erase(kv(50, 50)).unwrap();

        assert_eq!(index.record_count(), 149);
        assert_eq!(index.tombstone_count(), 1);
        let keys = range_keys(&index, 0, 149);
        assert_eq!(keys.len(), 149);
        assert!(!keys.contains(&50));

        let miss = index
            .query::<PointQuery<u64, u64>>(PointParams { target: kv(50, 50) })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn test_tombstone_cancels_at_merge() {
        let index = serial_index(100, 1_000, 2);
        fill(&index, 0..150);
        index.erase(kv(50, 50)).unwrap();
        assert_eq!(index.tombstone_count(), 1);

        // Drive enough inserts that the tombstone flushes and meets its
        // victim in a cascade merge.
        fill(&index, 150..500);
        index.await_next_epoch();

        assert_eq!(index.record_count(), 499);
        assert_eq!(index.tombstone_count(), 0);
        assert!(!range_keys(&index, 0, 499).contains(&50));
    }

    #[test]
    fn test_tombstone_erase_of_absent_record_keeps_count() {
        let index = serial_index(100, 1_000, 2);
        index.insert(kv(1, 1)).unwrap();
        index.insert(kv(2, 2)).unwrap();

        // The tombstone policy accepts an erase of a value that was
        // never inserted, but it matches nothing and must not charge
        // the live count.
        index.erase(kv(3, 3)).unwrap();
        assert_eq!(index.record_count(), 2);
        assert_eq!(index.tombstone_count(), 1);

        let keys = range_keys(&index, 0, 100);
        assert_eq!(keys, vec![1, 2]);

        // The first flush covers the whole hierarchy and drops the
        // unmatched tombstone as spent; the count stays honest.
        fill(&index, 10..200);
        index.await_next_epoch();
        assert_eq!(index.record_count(), 192);
        assert_eq!(index.tombstone_count(), 0);
    }

    #[test]
    fn test_tombstone_double_erase_counts_once() {
        let index = serial_index(100, 1_000, 2);
        fill(&index, 0..150);

        // The second erase finds its victim already claimed by the
        // first tombstone; only one erase matched.
        index.erase(kv(50, 50)).unwrap();
        index.erase(kv(50, 50)).unwrap();
        assert_eq!(index.record_count(), 149);
        assert_eq!(index.tombstone_count(), 2);
        assert_eq!(range_keys(&index, 0, 149).len(), 149);

        // Merges cancel the matched tombstone and drop the redundant
        // one as spent.
        fill(&index, 150..500);
        index.await_next_epoch();
        assert_eq!(index.record_count(), 499);
        assert_eq!(index.tombstone_count(), 0);
        assert!(!range_keys(&index, 0, 499).contains(&50));
    }

    #[test]
    fn test_erase_then_reinsert() {
        let index = serial_index(100, 1_000, 2);
        fill(&index, 0..150);
        index.erase(kv(50, 50)).unwrap();
        index.insert(kv(50, 50)).unwrap();
        fill(&index, 150..300);
        index.await_next_epoch();

        // The erase consumed the old copy; the reinsert survives.
        assert_eq!(index.record_count(), 300);
        assert!(range_keys(&index, 50, 50).contains(&50));
    }

    #[test]
    fn test_tombstone_suppression_across_levels() {
        let index = serial_index(10, 100, 2);
        // Spread records across several levels.
        fill(&index, 0..80);
        // Erase records living at various depths, then flush the
        // tombstones into the hierarchy too.
        for k in [0u64, 15, 33, 77] {
            index.erase(kv(k, k)).unwrap();
        }
        fill(&index, 80..120);
        index.await_next_epoch();

        assert_eq!(index.record_count(), 116);
        let keys = range_keys(&index, 0, 119);
        assert_eq!(keys.len(), 116);
        for k in [0u64, 15, 33, 77] {
            assert!(!keys.contains(&k), "erased key {k} resurfaced");
        }
    }

    // --------------------------------------------------------------------------------------------
    // Tagging policy
    // --------------------------------------------------------------------------------------------

    #[test]
    fn test_tagging_erase_in_buffer() {
        let index = tagging_index(100, 1_000, 2);
        fill(&index, 0..50);

        index.erase(kv(20, 20)).unwrap();
        assert_eq!(index.record_count(), 49);
        assert!(!range_keys(&index, 0, 49).contains(&20));
    }

    #[test]
    fn test_tagging_erase_in_shard() {
        let index = tagging_index(100, 1_000, 2);
        fill(&index, 0..150);
        assert_eq!(index.height(), 1);

        // Key 50 was flushed; the tag lands inside the shard.
        index.erase(kv(50, 50)).unwrap();
        assert_eq!(index.record_count(), 149);
        assert!(!range_keys(&index, 0, 149).contains(&50));

        let miss = index
            .query::<PointQuery<u64, u64>>(PointParams { target: kv(50, 50) })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn test_tagging_erase_missing_record() {
        let index = tagging_index(100, 1_000, 2);
        fill(&index, 0..50);

        assert!(matches!(
            index.erase(kv(999, 999)),
            Err(ExtensionError::RecordNotPresent)
        ));
        // Same key, different value: exact-record match required.
        assert!(matches!(
            index.erase(kv(20, 21)),
            Err(ExtensionError::RecordNotPresent)
        ));
        assert_eq!(index.record_count(), 50);
    }

    #[test]
    fn test_tagged_records_dropped_at_merge() {
        let index = tagging_index(100, 1_000, 2);
        fill(&index, 0..150);
        index.erase(kv(50, 50)).unwrap();
        index.erase(kv(120, 120)).unwrap();

        fill(&index, 150..300);
        index.await_next_epoch();

        assert_eq!(index.record_count(), 298);
        let keys = range_keys(&index, 0, 299);
        assert_eq!(keys.len(), 298);
        assert!(!keys.contains(&50));
        assert!(!keys.contains(&120));
    }

    #[test]
    fn test_tagging_erase_same_record_twice() {
        let index = tagging_index(100, 1_000, 2);
        fill(&index, 0..50);

        index.erase(kv(20, 20)).unwrap();
        assert!(matches!(
            index.erase(kv(20, 20)),
            Err(ExtensionError::RecordNotPresent)
        ));
        assert_eq!(index.record_count(), 49);
    }
}
