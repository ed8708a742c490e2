//! Cluster configuration knobs.

use crate::pool::PolicyKind;
use crate::transport::HealthCheckPrototype;
use director_core::ClientAbortAction;
use std::time::Duration;

/// Runtime-tunable knobs of a cluster.
///
/// Defaults match a freshly created director: enabled, a queue of 128
/// waiters with a one minute timeout, six retries, and round-robin
/// selection.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Master kill-switch; a disabled cluster answers 503 immediately.
    pub enabled: bool,
    /// Maximum waiters per bucket queue.
    pub queue_limit: usize,
    /// Maximum time a waiter may sit in a queue.
    pub queue_timeout: Duration,
    /// What to do with the upstream call when the client disconnects.
    pub on_client_abort: ClientAbortAction,
    /// Advisory `Retry-After` on 503/504; zero disables the header.
    pub retry_after: Duration,
    /// Per-attempt connect phase bound, consumed by the transports.
    pub connect_timeout: Duration,
    /// Per-attempt read phase bound, consumed by the transports.
    pub read_timeout: Duration,
    /// Per-attempt write phase bound, consumed by the transports.
    pub write_timeout: Duration,
    /// Dispatch attempts before a request is dropped with 503.
    pub max_retry_count: usize,
    /// A recovered backend stays disabled until an operator re-enables it.
    pub sticky_offline_mode: bool,
    /// Permit the origin to delegate the body via `X-Sendfile`.
    pub allow_x_sendfile: bool,
    /// Enqueue instead of answering 503 when every pool is unavailable.
    pub enqueue_on_unavailable: bool,
    /// Probe synthesis strings handed to the transports.
    pub health_check: HealthCheckPrototype,
    /// Backend selection policy for all pools.
    pub scheduler: PolicyKind,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_limit: 128,
            queue_timeout: Duration::from_secs(60),
            on_client_abort: ClientAbortAction::Close,
            retry_after: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            max_retry_count: 6,
            sticky_offline_mode: false,
            allow_x_sendfile: false,
            enqueue_on_unavailable: false,
            health_check: HealthCheckPrototype::default(),
            scheduler: PolicyKind::RoundRobin,
        }
    }
}
