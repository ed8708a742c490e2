//! End-to-end scheduling behavior: admission, queueing, failover, and the
//! retry state machine.

mod common;

use common::{cluster_with, get_request, http_spec, online_backend, Behavior};
use director::{BackendRole, HealthState, HttpExchange};

#[test]
fn admits_up_to_bucket_tokens_then_queues_and_dequeues_on_release() {
    let (cluster, factory) = cluster_with(|b| b);
    online_backend(&cluster, http_spec("app01", 3000).capacity(2));
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();
    let control = factory.control("app01");
    control.set_behavior(Behavior::Hold);

    assert_eq!(cluster.shaper_capacity(), 2);

    let (r1, e1) = get_request("/one");
    let (r2, e2) = get_request("/two");
    let (r3, e3) = get_request("/three");

    cluster.schedule(e1, bucket);
    cluster.schedule(e2, bucket);
    cluster.schedule(e3, bucket);

    // two fit the bucket, the third waits
    assert_eq!(control.processed(), 2);
    assert_eq!(cluster.queued().current(), 1);
    assert_eq!(cluster.load().current(), 2);
    assert_eq!(
        r1.response_header("X-Director-Backend").as_deref(),
        Some("app01")
    );
    assert_eq!(
        r1.response_header("X-Director-Bucket").as_deref(),
        Some("main")
    );
    assert!(!r3.is_finished());

    // releasing the first request pulls the waiter onto the same backend
    assert!(control.complete_one(200, b"done"));
    assert!(r1.is_finished());
    assert_eq!(r1.status_code(), Some(200));
    assert_eq!(control.processed(), 3);
    assert_eq!(cluster.queued().current(), 0);
    assert_eq!(cluster.load().current(), 2);
    assert!(!r2.is_finished());
    assert!(!r3.is_finished());

    // drain; the shaper must be fully replenished afterwards
    while control.complete_one(200, b"done") {}
    assert_eq!(cluster.load().current(), 0);

    let (_, e4) = get_request("/four");
    let (_, e5) = get_request("/five");
    cluster.schedule(e4, bucket);
    cluster.schedule(e5, bucket);
    assert_eq!(control.processed(), 5);
}

#[test]
fn backup_pool_serves_when_every_active_backend_is_down() {
    let (cluster, factory) = cluster_with(|b| b);

    let active = online_backend(&cluster, http_spec("a", 3001).capacity(1));
    cluster
        .backend(active)
        .unwrap()
        .monitor()
        .set_state(HealthState::Offline);

    online_backend(
        &cluster,
        http_spec("b", 3002).capacity(1).role(BackendRole::Backup),
    );
    factory.control("b").set_behavior(Behavior::Hold);

    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    assert_eq!(factory.control("a").processed(), 0);
    assert_eq!(factory.control("b").processed(), 1);
    assert_eq!(r.response_header("X-Director-Backend").as_deref(), Some("b"));
    assert_eq!(cluster.load().current(), 1);
    assert_eq!(cluster.queued().current(), 0);
}

#[test]
fn synchronous_transport_refusal_demotes_and_rejects() {
    let (cluster, factory) = cluster_with(|b| b);
    let id = online_backend(&cluster, http_spec("flaky", 3003).capacity(4));
    let control = factory.control("flaky");
    control.set_behavior(Behavior::RefuseSync);

    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    assert_eq!(control.processed(), 1);
    assert_eq!(r.status_code(), Some(503));
    assert_eq!(
        cluster.backend(id).unwrap().health_state(),
        HealthState::Offline
    );
    assert_eq!(cluster.dropped(), 1);

    // the demoted backend is not even asked anymore
    let (r2, e2) = get_request("/");
    cluster.schedule(e2, bucket);
    assert_eq!(control.processed(), 1);
    assert_eq!(r2.status_code(), Some(503));
    assert_eq!(cluster.dropped(), 2);
    assert_eq!(cluster.load().current(), 0);
}

#[test]
fn first_reject_is_final_when_no_retries_are_allowed() {
    let (cluster, factory) = cluster_with(|b| b.configure(|c| c.max_retry_count = 0));
    online_backend(&cluster, http_spec("app", 3004).capacity(1));
    factory
        .control("app")
        .set_behavior(Behavior::RejectAfterAccept);

    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    assert_eq!(factory.control("app").processed(), 1);
    assert_eq!(r.status_code(), Some(503));
    assert_eq!(cluster.dropped(), 1);
    assert_eq!(cluster.load().current(), 0);
}

#[test]
fn retries_are_bounded_and_every_admission_is_terminated_exactly_once() {
    let (cluster, factory) = cluster_with(|b| b.configure(|c| c.max_retry_count = 2));
    let b1 = online_backend(&cluster, http_spec("b1", 3005).capacity(1));
    online_backend(&cluster, http_spec("b2", 3006).capacity(1));
    factory.control("b1").set_behavior(Behavior::RejectAfterAccept);
    factory.control("b2").set_behavior(Behavior::RejectAfterAccept);

    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    // both backends got one attempt and were demoted; the request now
    // waits in the bucket queue with its retry budget almost spent
    assert_eq!(factory.control("b1").processed(), 1);
    assert_eq!(factory.control("b2").processed(), 1);
    assert_eq!(cluster.queued().current(), 1);
    assert!(!r.is_finished());

    // recovery triggers the dequeue; the final attempt exhausts the budget
    cluster
        .backend(b1)
        .unwrap()
        .monitor()
        .set_state(HealthState::Online);

    assert_eq!(factory.control("b1").processed(), 2);
    assert!(r.is_finished());
    assert_eq!(r.status_code(), Some(503));
    assert_eq!(cluster.dropped(), 1);
    assert_eq!(cluster.queued().current(), 0);
    assert_eq!(cluster.load().current(), 0);

    // one reject per admission, three admissions in total
    assert_eq!(
        factory.control("b1").processed() + factory.control("b2").processed(),
        3
    );
}

#[test]
fn zero_queue_limit_turns_queueing_into_immediate_503() {
    let (cluster, _factory) = cluster_with(|b| {
        b.configure(|c| {
            c.queue_limit = 0;
            c.enqueue_on_unavailable = true;
        })
    });
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    assert_eq!(r.status_code(), Some(503));
    assert_eq!(r.response_header("Retry-After").as_deref(), Some("10"));
    assert_eq!(cluster.dropped(), 1);
    assert_eq!(cluster.queued().current(), 0);
}

#[test]
fn zero_capacity_backends_never_fund_the_shaper() {
    let (cluster, factory) = cluster_with(|b| b);
    online_backend(&cluster, http_spec("pass", 3007).capacity(0));
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    assert_eq!(cluster.shaper_capacity(), 0);

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    assert_eq!(factory.control("pass").processed(), 0);
    assert_eq!(r.status_code(), Some(503));
}

#[test]
fn pinned_dispatch_bypasses_shaping_and_never_falls_back() {
    let (cluster, factory) = cluster_with(|b| b);
    let pass = online_backend(&cluster, http_spec("pass", 3008).capacity(0));
    online_backend(&cluster, http_spec("other", 3009).capacity(1));
    factory.control("pass").set_behavior(Behavior::Hold);

    // a capacity-zero backend admits unbounded through the pinned path
    let (r, e) = get_request("/");
    cluster.schedule_to_backend(e, pass);
    assert_eq!(factory.control("pass").processed(), 1);
    assert_eq!(
        r.response_header("X-Director-Backend").as_deref(),
        Some("pass")
    );
    assert!(factory.control("pass").complete_one(200, b"ok"));

    // a dead pinned backend means 503, not a fallback to the pool
    cluster
        .backend(pass)
        .unwrap()
        .monitor()
        .set_state(HealthState::Offline);
    let (r2, e2) = get_request("/");
    cluster.schedule_to_backend(e2, pass);
    assert_eq!(r2.status_code(), Some(503));
    assert_eq!(factory.control("other").processed(), 0);
}

#[test]
fn disabled_cluster_answers_503_with_retry_after() {
    let (cluster, factory) = cluster_with(|b| b.configure(|c| c.enabled = false));
    online_backend(&cluster, http_spec("app", 3010).capacity(1));
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    assert_eq!(r.status_code(), Some(503));
    assert_eq!(r.response_header("Retry-After").as_deref(), Some("10"));
    assert_eq!(factory.control("app").processed(), 0);
    assert_eq!(cluster.dropped(), 1);
}

#[test]
fn repeated_enables_move_shaper_capacity_only_once() {
    let (cluster, _factory) = cluster_with(|b| b);
    let id = online_backend(&cluster, http_spec("app", 3011).capacity(5));

    assert_eq!(cluster.shaper_capacity(), 5);
    cluster.set_backend_enabled(id, true);
    cluster.set_backend_enabled(id, true);
    assert_eq!(cluster.shaper_capacity(), 5);

    cluster.set_backend_enabled(id, false);
    assert_eq!(cluster.shaper_capacity(), 0);
    cluster.set_backend_enabled(id, false);
    assert_eq!(cluster.shaper_capacity(), 0);
}

#[test]
fn client_abort_close_frees_backend_and_tokens() {
    let (cluster, factory) = cluster_with(|b| b);
    online_backend(&cluster, http_spec("app", 3012).capacity(1));
    factory.control("app").set_behavior(Behavior::Hold);
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/slow");
    cluster.schedule(e, bucket);
    assert_eq!(cluster.load().current(), 1);

    // default policy is `close`: tearing down finishes the request and
    // frees both the backend slot and the shaper token
    r.client_abort();
    assert!(r.is_finished());
    assert_eq!(cluster.load().current(), 0);

    let (_, e2) = get_request("/next");
    cluster.schedule(e2, bucket);
    assert_eq!(factory.control("app").processed(), 2);
}
