//! Per-request scheduling state.

use crate::backend::BackendId;
use crate::cluster::ClusterInner;
use director_cache::BuildToken;
use director_core::{ClientAbortAction, HttpExchange};
use director_shaper::NodeId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Scheduling state attached to a request for its lifetime.
///
/// Lives in the request's custom-data map, so the cluster, the shaper
/// queues, the cache, and the transports all see the same record. Shaper
/// tokens held at destruction are returned to their bucket so capacity is
/// never leaked.
pub struct RequestNotes {
    ctime: Instant,
    cluster: Weak<ClusterInner>,
    backend: Mutex<Option<BackendId>>,
    try_count: AtomicUsize,
    bucket: Mutex<Option<NodeId>>,
    tokens: AtomicUsize,
    client_abort: Mutex<ClientAbortAction>,
    cache_key: Mutex<Option<String>>,
    cache_ttl: Mutex<Option<Duration>>,
    cache_ignore: AtomicBool,
    cache_build: Mutex<Option<BuildToken>>,
    via_added: AtomicBool,
}

impl RequestNotes {
    pub(crate) fn new(cluster: Weak<ClusterInner>, on_client_abort: ClientAbortAction) -> Self {
        Self {
            ctime: Instant::now(),
            cluster,
            backend: Mutex::new(None),
            try_count: AtomicUsize::new(0),
            bucket: Mutex::new(None),
            tokens: AtomicUsize::new(0),
            client_abort: Mutex::new(on_client_abort),
            cache_key: Mutex::new(None),
            cache_ttl: Mutex::new(None),
            cache_ignore: AtomicBool::new(false),
            cache_build: Mutex::new(None),
            via_added: AtomicBool::new(false),
        }
    }

    /// The notes attached to `exchange`, if the cluster has seen it.
    pub fn of(exchange: &Arc<dyn HttpExchange>) -> Option<Arc<RequestNotes>> {
        exchange.custom_data().get::<RequestNotes>()
    }

    pub(crate) fn attach(exchange: &Arc<dyn HttpExchange>, notes: Arc<RequestNotes>) {
        exchange.custom_data().set(notes);
    }

    pub fn ctime(&self) -> Instant {
        self.ctime
    }

    pub fn backend(&self) -> Option<BackendId> {
        *self.backend.lock()
    }

    pub(crate) fn set_backend(&self, backend: Option<BackendId>) {
        *self.backend.lock() = backend;
    }

    pub(crate) fn take_backend(&self) -> Option<BackendId> {
        self.backend.lock().take()
    }

    pub fn try_count(&self) -> usize {
        self.try_count.load(Ordering::Relaxed)
    }

    /// Increments the dispatch-attempt counter, returning the new value.
    pub(crate) fn bump_try_count(&self) -> usize {
        self.try_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn bucket(&self) -> Option<NodeId> {
        *self.bucket.lock()
    }

    pub(crate) fn set_bucket(&self, bucket: NodeId) {
        *self.bucket.lock() = Some(bucket);
    }

    pub fn tokens(&self) -> usize {
        self.tokens.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tokens(&self, tokens: usize) {
        self.tokens.store(tokens, Ordering::Relaxed);
    }

    /// Takes the held tokens, leaving zero behind.
    pub(crate) fn take_tokens(&self) -> usize {
        self.tokens.swap(0, Ordering::Relaxed)
    }

    pub fn client_abort_action(&self) -> ClientAbortAction {
        *self.client_abort.lock()
    }

    pub fn set_client_abort_action(&self, action: ClientAbortAction) {
        *self.client_abort.lock() = action;
    }

    pub fn cache_key(&self) -> Option<String> {
        self.cache_key.lock().clone()
    }

    /// Overrides the cache key for this request (handlers may pin one
    /// before scheduling).
    pub fn set_cache_key(&self, key: impl Into<String>) {
        *self.cache_key.lock() = Some(key.into());
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        *self.cache_ttl.lock()
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        *self.cache_ttl.lock() = Some(ttl);
    }

    pub fn cache_ignore(&self) -> bool {
        self.cache_ignore.load(Ordering::Relaxed)
    }

    pub fn set_cache_ignore(&self, value: bool) {
        self.cache_ignore.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_cache_build(&self, token: BuildToken) {
        *self.cache_build.lock() = Some(token);
    }

    pub(crate) fn take_cache_build(&self) -> Option<BuildToken> {
        self.cache_build.lock().take()
    }

    pub(crate) fn mark_via_added(&self) -> bool {
        !self.via_added.swap(true, Ordering::Relaxed)
    }
}

impl Drop for RequestNotes {
    fn drop(&mut self) {
        // a request must not die holding shaper capacity
        let tokens = self.tokens.swap(0, Ordering::Relaxed);
        if tokens > 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(tokens, "request dropped while holding shaper tokens");

            if let (Some(cluster), Some(bucket)) = (self.cluster.upgrade(), *self.bucket.lock()) {
                cluster.return_tokens(bucket, tokens);
            }
        }
    }
}
