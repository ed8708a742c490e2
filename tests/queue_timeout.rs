//! Queue-timeout behavior: waiters expire with 504 and Retry-After.

mod common;

use common::{cluster_with, get_request};
use director::HttpExchange;
use std::time::Duration;

#[test]
fn expired_waiters_finish_with_gateway_timeout() {
    let (cluster, _factory) = cluster_with(|b| {
        b.configure(|c| {
            c.queue_timeout = Duration::ZERO;
            c.queue_limit = 10;
            c.enqueue_on_unavailable = true;
        })
    });
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);
    assert_eq!(cluster.queued().current(), 1);
    assert!(!r.is_finished());

    cluster.sweep_once();

    assert!(r.is_finished());
    assert_eq!(r.status_code(), Some(504));
    assert_eq!(r.response_header("Retry-After").as_deref(), Some("10"));
    assert_eq!(cluster.queued().current(), 0);
    assert_eq!(cluster.dropped(), 1);
}

#[test]
fn fresh_waiters_survive_the_sweep() {
    let (cluster, _factory) = cluster_with(|b| {
        b.configure(|c| {
            c.queue_timeout = Duration::from_secs(60);
            c.enqueue_on_unavailable = true;
        })
    });
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);

    cluster.sweep_once();

    assert!(!r.is_finished());
    assert_eq!(cluster.queued().current(), 1);
}

#[tokio::test(start_paused = true)]
async fn the_background_sweep_expires_waiters_on_its_own() {
    let (cluster, _factory) = cluster_with(|b| {
        b.configure(|c| {
            c.queue_timeout = Duration::from_secs(1);
            c.enqueue_on_unavailable = true;
        })
    });
    let bucket = cluster.create_bucket("main", 1.0, 1.0).unwrap();

    cluster.start();

    let (r, e) = get_request("/");
    cluster.schedule(e, bucket);
    assert!(!r.is_finished());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(r.is_finished());
    assert_eq!(r.status_code(), Some(504));

    cluster.stop();
}
