//! Property tests over the scheduling state machine: arbitrary
//! interleavings of arrivals and completions never violate the capacity
//! and accounting invariants.

mod common;

use common::{cluster_with, get_request, http_spec, online_backend, Behavior, MockFactory};
use director::Cluster;
use proptest::prelude::*;
use std::sync::Arc;

fn harness(capacity: usize) -> (Arc<Cluster>, Arc<MockFactory>) {
    let (cluster, factory) = cluster_with(|b| b.configure(|c| c.queue_limit = 1024));
    online_backend(&cluster, http_spec("app", 3500).capacity(capacity));
    factory.control("app").set_behavior(Behavior::Hold);
    cluster.create_bucket("main", 1.0, 1.0).unwrap();
    (cluster, factory)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn load_stays_within_capacity_under_any_interleaving(
        capacity in 1usize..6,
        arrivals in proptest::collection::vec(any::<bool>(), 1..120),
    ) {
        let (cluster, factory) = harness(capacity);
        let bucket = cluster.find_bucket("main").unwrap();
        let control = factory.control("app");

        for arrive in arrivals {
            if arrive {
                let (_, exchange) = get_request("/r");
                cluster.schedule(exchange, bucket);
            } else {
                control.complete_one(200, b"ok");
            }

            let backend = cluster.backend(cluster.find_backend("app").unwrap()).unwrap();
            prop_assert!(backend.load().current() <= capacity);
            prop_assert!(cluster.load().current() <= cluster.shaper_capacity());
        }

        while control.complete_one(200, b"ok") {}
        prop_assert_eq!(cluster.load().current(), 0);
        prop_assert_eq!(cluster.queued().current(), 0);
        prop_assert_eq!(cluster.dropped(), 0);

        // the shaper is fully replenished: a fresh burst admits exactly
        // the capacity again
        let before = control.processed();
        for _ in 0..capacity + 1 {
            let (_, exchange) = get_request("/again");
            cluster.schedule(exchange, bucket);
        }
        prop_assert_eq!(control.processed() - before, capacity);
    }
}
