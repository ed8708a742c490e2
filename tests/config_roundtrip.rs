//! Persistence: save-then-load yields an equivalent cluster.

mod common;

use common::{cluster_with, http_spec};
use director::{BackendRole, BackendSpec, PolicyKind, Protocol, SocketSpec};
use director_cache::ObjectCache;
use director_core::ClientAbortAction;
use std::time::Duration;

#[test]
fn save_then_load_is_equivalent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");

    let (original, _factory) = cluster_with(|b| {
        b.cache(ObjectCache::builder().build()).configure(|c| {
            c.queue_limit = 64;
            c.queue_timeout = Duration::from_secs(30);
            c.retry_after = Duration::from_secs(8);
            c.max_retry_count = 3;
            c.sticky_offline_mode = true;
            c.enqueue_on_unavailable = true;
            c.on_client_abort = ClientAbortAction::Notify;
            c.scheduler = PolicyKind::Chance;
            c.health_check.host_header = "hc.internal".to_string();
            c.health_check.request_path = "/healthz".to_string();
        })
    });

    original.create_bucket("uploads", 0.2, 0.5).unwrap();
    original.create_bucket("api", 0.5, 1.0).unwrap();
    original
        .create_backend(
            http_spec("app01", 3301)
                .capacity(2)
                .health_interval(Duration::from_secs(5)),
        )
        .unwrap();
    original
        .create_backend(
            BackendSpec::new(
                "app02",
                Protocol::Fastcgi,
                SocketSpec::local("/run/app02.sock"),
            )
            .capacity(1)
            .role(BackendRole::Backup)
            .enabled(false),
        )
        .unwrap();

    original.load_file(&path).unwrap();
    original.save().unwrap();
    let first = std::fs::read_to_string(&path).unwrap();

    let (restored, _factory2) = cluster_with(|b| b.cache(ObjectCache::builder().build()));
    restored.load_file(&path).unwrap();

    let config = restored.config();
    assert_eq!(config.queue_limit, 64);
    assert_eq!(config.queue_timeout, Duration::from_secs(30));
    assert_eq!(config.retry_after, Duration::from_secs(8));
    assert_eq!(config.max_retry_count, 3);
    assert!(config.sticky_offline_mode);
    assert!(config.enqueue_on_unavailable);
    assert_eq!(config.on_client_abort, ClientAbortAction::Notify);
    assert_eq!(config.scheduler, PolicyKind::Chance);
    assert_eq!(config.health_check.host_header, "hc.internal");
    assert_eq!(config.health_check.request_path, "/healthz");

    assert!(restored.find_bucket("uploads").is_some());
    assert!(restored.find_bucket("api").is_some());

    let app01 = restored.find_backend("app01").expect("app01 restored");
    let app01 = restored.backend(app01).unwrap();
    assert_eq!(app01.capacity(), 2);
    assert_eq!(app01.role(), BackendRole::Active);
    assert!(app01.is_enabled());
    assert_eq!(app01.monitor().interval(), Duration::from_secs(5));

    let app02 = restored.find_backend("app02").expect("app02 restored");
    let app02 = restored.backend(app02).unwrap();
    assert_eq!(app02.protocol(), Protocol::Fastcgi);
    assert_eq!(app02.role(), BackendRole::Backup);
    assert!(!app02.is_enabled());
    assert!(app02.socket().is_local());

    // the rewritten file is byte-identical: same knobs, buckets, backends
    restored.save().unwrap();
    let second = std::fs::read_to_string(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn loading_a_missing_file_seeds_the_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.db");

    let (cluster, _factory) = cluster_with(|b| b);
    cluster.load_file(&path).unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[director]"));
    assert!(written.contains("queue-limit=128"));
    assert!(written.contains("scheduler=rr"));
}

#[test]
fn malformed_files_are_rejected_wholesale() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.db");
    std::fs::write(&path, "[director]\nqueue-limit=not-a-number\n").unwrap();

    let (cluster, _factory) = cluster_with(|b| b);
    let err = cluster.load_file(&path).unwrap_err();
    assert!(err.to_string().contains("queue-limit"));
}

#[test]
fn unknown_sections_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("odd.db");

    // write a complete valid file, then append junk
    let (seeder, _factory) = cluster_with(|b| b);
    seeder.load_file(&path).unwrap();
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("\n[frontend=nope]\nkey=value\n");
    std::fs::write(&path, content).unwrap();

    let (cluster, _factory2) = cluster_with(|b| b);
    let err = cluster.load_file(&path).unwrap_err();
    assert!(err.to_string().contains("frontend=nope"));
}
