//! Cross-cutting invariants: token conservation, load bounds, and
//! admission/termination pairing under churn.

mod common;

use common::{cluster_with, get_request, http_spec, online_backend, Behavior};
use director::HttpExchange;

#[test]
fn shaper_tokens_are_conserved_across_a_full_drain() {
    let (cluster, factory) = cluster_with(|b| b);
    online_backend(&cluster, http_spec("app", 3401).capacity(3));
    factory.control("app").set_behavior(Behavior::Hold);
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    // fill the bucket, overflow into the queue
    let requests: Vec<_> = (0..5)
        .map(|i| {
            let (mock, exchange) = get_request(&format!("/r{i}"));
            cluster.schedule(exchange, bucket);
            mock
        })
        .collect();

    assert_eq!(cluster.load().current(), 3);
    assert_eq!(cluster.queued().current(), 2);

    while factory.control("app").complete_one(200, b"ok") {}

    assert_eq!(cluster.load().current(), 0);
    assert_eq!(cluster.queued().current(), 0);
    for request in &requests {
        assert!(request.is_finished());
        assert_eq!(request.status_code(), Some(200));
    }

    // every token made it back: a fresh burst admits the full capacity
    for i in 0..3 {
        let (_, exchange) = get_request(&format!("/again{i}"));
        cluster.schedule(exchange, bucket);
    }
    assert_eq!(cluster.load().current(), 3);
    assert_eq!(cluster.queued().current(), 0);
}

#[test]
fn backend_load_never_exceeds_capacity() {
    let (cluster, factory) = cluster_with(|b| b.configure(|c| c.enqueue_on_unavailable = true));
    let id = online_backend(&cluster, http_spec("small", 3402).capacity(2));
    factory.control("small").set_behavior(Behavior::Hold);
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    for i in 0..6 {
        let (_, exchange) = get_request(&format!("/r{i}"));
        cluster.schedule(exchange, bucket);
        let backend = cluster.backend(id).unwrap();
        assert!(backend.load().current() <= backend.capacity());
    }

    let backend = cluster.backend(id).unwrap();
    assert_eq!(backend.load().current(), 2);
    assert!(cluster.load().current() <= cluster.shaper_capacity());
}

#[test]
fn interleaved_churn_balances_admissions_and_terminations() {
    let (cluster, factory) = cluster_with(|b| b);
    online_backend(&cluster, http_spec("a", 3403).capacity(2));
    online_backend(&cluster, http_spec("b", 3404).capacity(2));
    factory.control("a").set_behavior(Behavior::Hold);
    factory.control("b").set_behavior(Behavior::Hold);
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let mut mocks = Vec::new();
    for round in 0..8 {
        for i in 0..3 {
            let (mock, exchange) = get_request(&format!("/{round}/{i}"));
            cluster.schedule(exchange, bucket);
            mocks.push(mock);
        }
        // free one slot on each backend; dequeues refill them
        factory.control("a").complete_one(200, b"ok");
        factory.control("b").complete_one(200, b"ok");
    }

    while factory.control("a").complete_one(200, b"ok") {}
    while factory.control("b").complete_one(200, b"ok") {}
    cluster.sweep_once();

    assert_eq!(cluster.load().current(), 0);
    assert_eq!(cluster.queued().current(), 0);

    let admissions =
        factory.control("a").processed() + factory.control("b").processed();
    let finished = mocks.iter().filter(|m| m.is_finished()).count();
    assert!(admissions >= finished);
    assert_eq!(cluster.dropped(), 0, "nothing should have been dropped");
}
