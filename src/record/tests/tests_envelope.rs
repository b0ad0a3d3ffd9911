#[cfg(test)]
mod tests {
    use crate::record::{KeyValue, Wrapped};

    #[test]
    fn test_new_record_is_visible() {
        let w = Wrapped::new(KeyValue::new(1u64, 10u64));
        assert!(!w.is_tombstone());
        assert!(!w.is_deleted());
        assert!(w.is_visible());
    }

    #[test]
    fn test_tombstone_flags() {
        let t = Wrapped::new_tombstone(KeyValue::new(1u64, 10u64));
        assert!(t.is_tombstone());
        assert!(!t.is_deleted());
        assert!(!t.is_visible());
    }

    #[test]
    fn test_set_deleted_once() {
        let w = Wrapped::new(KeyValue::new(1u64, 10u64));
        assert!(w.set_deleted());
        assert!(w.is_deleted());
        assert!(!w.is_visible());

        // A second tag reports failure.
        assert!(!w.set_deleted());
    }

    #[test]
    fn test_tombstone_cannot_be_tagged() {
        let t = Wrapped::new_tombstone(KeyValue::new(1u64, 10u64));
        assert!(!t.set_deleted());
    }

    #[test]
    fn test_live_sorts_before_its_tombstone() {
        let live = Wrapped::new(KeyValue::new(5u64, 50u64));
        let tomb = Wrapped::new_tombstone(KeyValue::new(5u64, 50u64));
        assert!(live < tomb);

        let mut v = vec![tomb.clone(), live.clone()];
        v.sort();
        assert!(!v[0].is_tombstone());
        assert!(v[1].is_tombstone());
    }

    #[test]
    fn test_deleted_bit_does_not_affect_ordering_or_equality() {
        let a = Wrapped::new(KeyValue::new(5u64, 50u64));
        let b = Wrapped::new(KeyValue::new(5u64, 50u64));
        a.set_deleted();
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_cancels() {
        let live = Wrapped::new(KeyValue::new(5u64, 50u64));
        let tomb = Wrapped::new_tombstone(KeyValue::new(5u64, 50u64));
        let other = Wrapped::new_tombstone(KeyValue::new(6u64, 60u64));

        assert!(tomb.cancels(&live));
        assert!(!live.cancels(&tomb));
        assert!(!other.cancels(&live));
        // A tombstone does not cancel another tombstone.
        assert!(!tomb.cancels(&tomb));
    }

    #[test]
    fn test_clone_preserves_header() {
        let t = Wrapped::new_tombstone(KeyValue::new(1u64, 10u64));
        assert!(t.clone().is_tombstone());

        let w = Wrapped::new(KeyValue::new(1u64, 10u64));
        w.set_deleted();
        assert!(w.clone().is_deleted());
    }

    #[test]
    fn test_tombstone_weight_is_zero() {
        let live = Wrapped::new(7u64);
        let tomb = Wrapped::new_tombstone(7u64);
        assert_eq!(live.weight(), 1.0);
        assert_eq!(tomb.weight(), 0.0);
    }
}
