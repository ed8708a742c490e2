//! Property tests: token bookkeeping is conserved across arbitrary
//! acquire/release interleavings.

use director_shaper::{NodeId, TokenShaper};
use proptest::prelude::*;

fn build(capacity: usize) -> (TokenShaper<()>, Vec<NodeId>) {
    let mut shaper = TokenShaper::new(capacity);
    let a = shaper.create_node("a", 0.25, 1.0).unwrap();
    let b = shaper.create_node("b", 0.25, 0.5).unwrap();
    let c = shaper.create_node("c", 0.5, 1.0).unwrap();
    let d = shaper.create_child(c, "d", 0.5, 1.0).unwrap();
    (shaper, vec![a, b, c, d])
}

fn snapshot(shaper: &TokenShaper<()>, buckets: &[NodeId]) -> Vec<i64> {
    let mut all = vec![shaper.available(shaper.root())];
    all.extend(buckets.iter().map(|&b| shaper.available(b)));
    all
}

proptest! {
    #[test]
    fn acquire_release_conserves_tokens(
        capacity in 1usize..32,
        ops in proptest::collection::vec((0usize..4, any::<bool>()), 0..200),
    ) {
        let (mut shaper, buckets) = build(capacity);
        let before = snapshot(&shaper, &buckets);
        let mut held: Vec<NodeId> = Vec::new();

        for (pick, acquire) in ops {
            if acquire {
                let bucket = buckets[pick];
                if shaper.get(bucket, 1) {
                    held.push(bucket);
                }
            } else if let Some(bucket) = held.pop() {
                shaper.put(bucket, 1);
            }

            // committed work never exceeds any ceiling
            for &b in &buckets {
                prop_assert!(shaper.actual_rate(b) <= shaper.ceil(b));
                prop_assert!(shaper.available(b) <= shaper.ceil(b) as i64);
            }
            prop_assert!(shaper.actual_rate(shaper.root()) <= shaper.capacity());
        }

        for bucket in held.drain(..) {
            shaper.put(bucket, 1);
        }

        prop_assert_eq!(snapshot(&shaper, &buckets), before);
    }

    #[test]
    fn grants_never_exceed_root_capacity(
        capacity in 1usize..16,
        picks in proptest::collection::vec(0usize..4, 0..64),
    ) {
        let (mut shaper, buckets) = build(capacity);
        let mut granted = 0usize;

        for pick in picks {
            if shaper.get(buckets[pick], 1) {
                granted += 1;
            }
        }

        prop_assert!(granted <= capacity);
    }
}
