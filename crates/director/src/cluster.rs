//! The cluster facade: scheduling, retries, release/reject, and the
//! queue-timeout sweep.

use crate::backend::{Backend, BackendId, BackendRole};
use crate::config::ClusterConfig;
use crate::error::{BackendError, DropReason};
use crate::events::ClusterEvent;
use crate::notes::RequestNotes;
use crate::pool::{BackendPool, PolicyKind};
use crate::transport::{BackendSpec, TransportFactory};
use director_cache::{CacheLookup, CommitOutcome, ObjectCache};
use director_core::{
    ClientAbortAction, Counter, EventListener, EventListeners, FnListener, HealthState,
    HttpExchange, HttpStatus, SchedulerStatus,
};
use director_health::HealthMonitor;
use director_shaper::{NodeId, TokenShaper, TokenShaperError};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info, warn};

/// The load-balancing facade: owns the backends, the token shaper, the
/// wait queues, and the optional response cache.
///
/// Requests enter through [`schedule`](Cluster::schedule) (or
/// [`schedule_to_backend`](Cluster::schedule_to_backend) for pinned
/// dispatch); the backend transports report completion through
/// [`release`](Cluster::release) and [`reject`](Cluster::reject).
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

pub(crate) struct ClusterInner {
    pub(crate) name: String,
    pub(crate) config: RwLock<ClusterConfig>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) backends: RwLock<Vec<Option<Arc<Backend>>>>,
    pub(crate) pools: [Mutex<BackendPool>; 3],
    pub(crate) shaper: Mutex<TokenShaper<Arc<dyn HttpExchange>>>,
    pub(crate) load: Counter,
    pub(crate) queued: Counter,
    pub(crate) dropped: AtomicU64,
    pub(crate) cache: Option<Arc<ObjectCache>>,
    pub(crate) events: EventListeners<ClusterEvent>,
    pub(crate) storage_path: Mutex<Option<PathBuf>>,
    pub(crate) sweep_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) started: AtomicBool,
    pub(crate) self_weak: Weak<ClusterInner>,
}

impl Cluster {
    /// Starts building a cluster around the given transport factory.
    pub fn builder(
        name: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
    ) -> ClusterBuilder {
        ClusterBuilder {
            name: name.into(),
            config: ClusterConfig::default(),
            factory,
            cache: None,
            events: EventListeners::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> ClusterConfig {
        self.inner.config.read().clone()
    }

    /// Applies a configuration change. The pool selection policy is kept
    /// in sync with the `scheduler` knob.
    pub fn update_config(&self, apply: impl FnOnce(&mut ClusterConfig)) {
        let scheduler = {
            let mut config = self.inner.config.write();
            apply(&mut config);
            config.scheduler
        };
        for pool in &self.inner.pools {
            let mut pool = pool.lock();
            if pool.policy() != scheduler {
                pool.set_policy(scheduler);
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.read().enabled
    }

    pub fn set_enabled(&self, value: bool) {
        self.inner.config.write().enabled = value;
    }

    pub fn cache(&self) -> Option<&Arc<ObjectCache>> {
        self.inner.cache.as_ref()
    }

    /// Marks every cached object stale; current servers are unaffected.
    pub fn expire_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.expire_all();
        }
    }

    /// Frees the whole cache store. Requests parked on in-flight builds
    /// are rescheduled with caching bypassed.
    pub fn purge_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            let reseed = cache.purge_all();
            self.inner.reseed(reseed);
        }
    }

    /// Concurrent in-flight requests across all backends.
    pub fn load(&self) -> &Counter {
        &self.inner.load
    }

    /// Requests currently parked in bucket queues.
    pub fn queued(&self) -> &Counter {
        &self.inner.queued
    }

    /// Requests finished by the cluster with an error status.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // buckets
    // ------------------------------------------------------------------

    pub fn root_bucket(&self) -> NodeId {
        self.inner.shaper.lock().root()
    }

    /// Creates a shaping bucket under the root. `rate` and `ceil` are
    /// fractions of the root's capacity in `[0, 1]`.
    pub fn create_bucket(
        &self,
        name: &str,
        rate: f64,
        ceil: f64,
    ) -> Result<NodeId, TokenShaperError> {
        self.inner.shaper.lock().create_node(name, rate, ceil)
    }

    pub fn find_bucket(&self, name: &str) -> Option<NodeId> {
        self.inner.shaper.lock().find_node(name)
    }

    pub fn bucket_name(&self, bucket: NodeId) -> String {
        self.inner.shaper.lock().name(bucket).to_string()
    }

    /// Total shaper capacity (the root ceiling).
    pub fn shaper_capacity(&self) -> usize {
        self.inner.shaper.lock().capacity()
    }

    // ------------------------------------------------------------------
    // backends
    // ------------------------------------------------------------------

    /// Registers a backend. It is created disabled, then enabled per the
    /// spec, so the enable path is uniform with later admin changes.
    pub fn create_backend(&self, spec: BackendSpec) -> Result<BackendId, BackendError> {
        self.inner.create_backend(spec)
    }

    pub fn backend(&self, id: BackendId) -> Option<Arc<Backend>> {
        self.inner.backend(id)
    }

    pub fn find_backend(&self, name: &str) -> Option<BackendId> {
        self.inner.find_backend(name)
    }

    pub fn set_backend_enabled(&self, id: BackendId, enabled: bool) {
        self.inner.set_backend_enabled(id, enabled);
    }

    pub fn set_backend_capacity(&self, id: BackendId, capacity: usize) {
        self.inner.set_backend_capacity(id, capacity);
    }

    pub fn set_backend_role(&self, id: BackendId, role: BackendRole) -> Result<(), BackendError> {
        self.inner.set_backend_role(id, role)
    }

    /// Admin deletion: drains through the Terminate role when the backend
    /// still carries load; refused entirely for protected backends.
    pub fn remove_backend(&self, id: BackendId) -> Result<(), BackendError> {
        let backend = self.inner.backend(id).ok_or(BackendError::NotFound)?;
        if backend.terminate_protection() {
            return Err(BackendError::TerminateProtected(backend.name().to_string()));
        }
        self.inner.set_backend_role(id, BackendRole::Terminate)
    }

    // ------------------------------------------------------------------
    // request flow
    // ------------------------------------------------------------------

    /// Primary entry point: schedule a request through a shaping bucket.
    ///
    /// Exactly one of three things happens: a backend accepts the request,
    /// the request is parked in the bucket's queue, or the request is
    /// finished with an error status. Never blocks.
    pub fn schedule(&self, exchange: Arc<dyn HttpExchange>, bucket: NodeId) {
        self.inner.schedule(&exchange, bucket);
    }

    /// Pins a request to one backend; no fallback, no shaping, no queue.
    pub fn schedule_to_backend(&self, exchange: Arc<dyn HttpExchange>, id: BackendId) {
        self.inner.schedule_to_backend(&exchange, id);
    }

    /// Transport callback: the request finished successfully upstream.
    pub fn release(&self, exchange: &Arc<dyn HttpExchange>) {
        self.inner.release(exchange);
    }

    /// Transport callback: the request failed upstream. The backend is
    /// demoted and the request rescheduled; the status suggestion is
    /// ignored because a later outcome picks the real one.
    pub fn reject(&self, exchange: &Arc<dyn HttpExchange>, status: HttpStatus) {
        self.inner.reject(exchange, status);
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Starts the health monitors and the periodic queue/cache sweep.
    /// Requires a tokio runtime.
    pub fn start(&self) {
        self.inner.start();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// One pass of the queue-timeout and cache-lock sweeps. The background
    /// task calls this periodically; tests may call it directly.
    pub fn sweep_once(&self) {
        self.inner.sweep_once();
    }

    pub(crate) fn inner(&self) -> &Arc<ClusterInner> {
        &self.inner
    }
}

impl ClusterInner {
    pub(crate) fn backend(&self, id: BackendId) -> Option<Arc<Backend>> {
        self.backends.read().get(id.0).and_then(|slot| slot.clone())
    }

    pub(crate) fn find_backend(&self, name: &str) -> Option<BackendId> {
        self.backends
            .read()
            .iter()
            .position(|slot| slot.as_ref().map(|b| b.name() == name).unwrap_or(false))
            .map(BackendId)
    }

    pub(crate) fn return_tokens(&self, bucket: NodeId, tokens: usize) {
        self.shaper.lock().put(bucket, tokens);
    }

    fn ensure_notes(&self, exchange: &Arc<dyn HttpExchange>) -> Arc<RequestNotes> {
        if let Some(notes) = RequestNotes::of(exchange) {
            return notes;
        }
        let notes = Arc::new(RequestNotes::new(
            self.self_weak.clone(),
            self.config.read().on_client_abort,
        ));
        RequestNotes::attach(exchange, Arc::clone(&notes));
        notes
    }

    // ------------------------------------------------------------------
    // scheduling
    // ------------------------------------------------------------------

    fn schedule(&self, exchange: &Arc<dyn HttpExchange>, bucket: NodeId) {
        let notes = self.ensure_notes(exchange);
        notes.set_bucket(bucket);

        if !self.config.read().enabled {
            self.finish_dropped(
                exchange,
                &notes,
                HttpStatus::SERVICE_UNAVAILABLE,
                DropReason::ClusterDisabled,
            );
            return;
        }

        if self.try_cache(exchange, &notes) {
            return;
        }

        self.annotate(exchange, &notes, bucket);

        let granted = self.shaper.lock().get(bucket, 1);
        if granted {
            notes.set_tokens(1);

            let first = self.try_role(BackendRole::Active, exchange, &notes);
            if first == SchedulerStatus::Success {
                return;
            }
            if first == SchedulerStatus::Unavailable
                && self.try_role(BackendRole::Backup, exchange, &notes)
                    == SchedulerStatus::Success
            {
                return;
            }

            // no backend took it; hand the token back before queueing
            let tokens = notes.take_tokens();
            self.shaper.lock().put(bucket, tokens);

            if first == SchedulerStatus::Unavailable && !self.config.read().enqueue_on_unavailable
            {
                self.finish_dropped(
                    exchange,
                    &notes,
                    HttpStatus::SERVICE_UNAVAILABLE,
                    DropReason::AllBackendsUnavailable,
                );
                return;
            }
        } else {
            let ceil = self.shaper.lock().ceil(bucket);
            if ceil == 0 && !self.config.read().enqueue_on_unavailable {
                self.finish_dropped(
                    exchange,
                    &notes,
                    HttpStatus::SERVICE_UNAVAILABLE,
                    DropReason::AllBackendsUnavailable,
                );
                return;
            }
        }

        self.try_enqueue(exchange, &notes);
    }

    fn schedule_to_backend(&self, exchange: &Arc<dyn HttpExchange>, id: BackendId) {
        let notes = self.ensure_notes(exchange);

        if !self.config.read().enabled {
            self.finish_dropped(
                exchange,
                &notes,
                HttpStatus::SERVICE_UNAVAILABLE,
                DropReason::ClusterDisabled,
            );
            return;
        }

        let root = self.shaper.lock().root();
        notes.set_bucket(root);
        self.annotate(exchange, &notes, root);

        if self.dispatch(id, exchange, &notes) != SchedulerStatus::Success {
            #[cfg(feature = "tracing")]
            warn!(
                cluster = %self.name,
                backend = id.0,
                tries = notes.try_count(),
                "pinned backend cannot process the request"
            );
            self.finish_dropped(
                exchange,
                &notes,
                HttpStatus::SERVICE_UNAVAILABLE,
                DropReason::PinnedBackendUnavailable,
            );
        }
    }

    fn annotate(&self, exchange: &Arc<dyn HttpExchange>, notes: &RequestNotes, bucket: NodeId) {
        exchange.overwrite_header("X-Director-Cluster", &self.name);
        let bucket_name = self.shaper.lock().name(bucket).to_string();
        exchange.overwrite_header("X-Director-Bucket", &bucket_name);

        if notes.mark_via_added() {
            let entry = format!("1.1 {}", self.name);
            match exchange.response_header("Via") {
                Some(existing) => {
                    exchange.overwrite_header("Via", &format!("{entry}, {existing}"))
                }
                None => exchange.push_header("Via", &entry),
            }
        }
    }

    /// Consults the object cache. Returns true when the request has been
    /// fully handled (served, parked, or answered a PURGE).
    fn try_cache(&self, exchange: &Arc<dyn HttpExchange>, notes: &Arc<RequestNotes>) -> bool {
        let cache = match &self.cache {
            Some(cache) if cache.enabled() => cache,
            _ => return false,
        };

        let method = exchange.method();

        if method == "PURGE" {
            let key = self.resolve_cache_key(exchange, notes, cache);
            let found = cache.purge(&key);
            exchange.set_status(if found {
                HttpStatus::OK
            } else {
                HttpStatus::NOT_FOUND
            });
            exchange.finish();
            return true;
        }

        if notes.cache_ignore() || (method != "GET" && method != "HEAD") {
            return false;
        }

        let key = self.resolve_cache_key(exchange, notes, cache);
        let ttl = notes.cache_ttl().unwrap_or_else(|| cache.default_ttl());

        match cache.deliver_active(exchange, &key, ttl) {
            CacheLookup::Served => true,
            CacheLookup::Build(token) => {
                notes.set_cache_build(token);
                false
            }
            CacheLookup::Bypass => false,
        }
    }

    fn resolve_cache_key(
        &self,
        exchange: &Arc<dyn HttpExchange>,
        notes: &RequestNotes,
        cache: &ObjectCache,
    ) -> String {
        if let Some(key) = notes.cache_key() {
            return key;
        }
        let key = expand_cache_key(&cache.default_key(), exchange);
        notes.set_cache_key(key.clone());
        key
    }

    fn try_role(
        &self,
        role: BackendRole,
        exchange: &Arc<dyn HttpExchange>,
        notes: &Arc<RequestNotes>,
    ) -> SchedulerStatus {
        let order = self.pools[role.index()].lock().plan();
        let total = order.len();
        let mut unavailable = 0;

        for id in order {
            match self.dispatch(id, exchange, notes) {
                SchedulerStatus::Success => {
                    self.pools[role.index()].lock().note_success(id);
                    return SchedulerStatus::Success;
                }
                SchedulerStatus::Unavailable => unavailable += 1,
                SchedulerStatus::Overloaded => {}
            }
        }

        BackendPool::aggregate(total, unavailable)
    }

    /// One admission attempt against one backend.
    fn dispatch(
        &self,
        id: BackendId,
        exchange: &Arc<dyn HttpExchange>,
        notes: &Arc<RequestNotes>,
    ) -> SchedulerStatus {
        let backend = match self.backend(id) {
            Some(backend) => backend,
            None => return SchedulerStatus::Unavailable,
        };

        // bind and count before the transport runs; a transport may
        // complete (and call release) from inside `process`
        notes.set_backend(Some(id));
        self.load.incr();

        let status = backend.try_process(exchange);

        if status == SchedulerStatus::Success {
            self.install_abort_handler(exchange);
        } else {
            self.load.decr();
            notes.set_backend(None);
        }

        status
    }

    fn install_abort_handler(&self, exchange: &Arc<dyn HttpExchange>) {
        let weak = self.self_weak.clone();
        let ex = Arc::clone(exchange);
        exchange.set_abort_handler(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_client_abort(&ex);
            }
        }));
    }

    /// Client went away. `ignore` leaves the upstream call running; the
    /// other actions tear it down and finish the request locally, so the
    /// transport must not call release/reject afterwards.
    fn on_client_abort(&self, exchange: &Arc<dyn HttpExchange>) {
        let notes = match RequestNotes::of(exchange) {
            Some(notes) => notes,
            None => return,
        };

        let action = notes.client_abort_action();
        if action == ClientAbortAction::Ignore {
            return;
        }

        #[cfg(feature = "tracing")]
        info!(cluster = %self.name, action = %action, "client aborted; tearing down upstream call");

        let freed_backend = notes.take_backend();
        if let Some(id) = freed_backend {
            if let Some(backend) = self.backend(id) {
                backend.transport().client_abort(exchange, action);
                backend.load().decr();
            }
            self.load.decr();
        }

        if let Some(token) = notes.take_cache_build() {
            if let Some(cache) = &self.cache {
                let reseed = cache.abandon(token);
                self.reseed(reseed);
            }
        }

        let tokens = notes.take_tokens();
        if tokens > 0 {
            if let Some(bucket) = notes.bucket() {
                self.shaper.lock().put(bucket, tokens);
            }
        }

        exchange.finish();

        if let Some(id) = freed_backend {
            self.dequeue_to(id);
        }
    }

    /// Retry entry: called on every reject and on failed dequeues.
    fn reschedule(&self, exchange: &Arc<dyn HttpExchange>) {
        let notes = self.ensure_notes(exchange);

        let tries = notes.bump_try_count();
        if tries > self.config.read().max_retry_count {
            #[cfg(feature = "tracing")]
            info!(cluster = %self.name, tries, "request failed too often");
            self.finish_dropped(
                exchange,
                &notes,
                HttpStatus::SERVICE_UNAVAILABLE,
                DropReason::RetryExhausted,
            );
            return;
        }

        let first = self.try_role(BackendRole::Active, exchange, &notes);
        if first == SchedulerStatus::Success {
            return;
        }
        if first == SchedulerStatus::Unavailable
            && self.try_role(BackendRole::Backup, exchange, &notes) == SchedulerStatus::Success
        {
            return;
        }

        self.try_enqueue(exchange, &notes);
    }

    /// Parks the request in its bucket's queue, respecting the queue
    /// limit. Waiters hold no tokens.
    fn try_enqueue(&self, exchange: &Arc<dyn HttpExchange>, notes: &Arc<RequestNotes>) {
        let bucket = notes
            .bucket()
            .unwrap_or_else(|| self.shaper.lock().root());
        let limit = self.config.read().queue_limit;
        let tokens = notes.take_tokens();
        notes.set_backend(None);

        let (queue_full, depth) = {
            let mut shaper = self.shaper.lock();
            if tokens > 0 {
                shaper.put(bucket, tokens);
            }
            if shaper.queued(bucket) >= limit {
                (true, shaper.queued(bucket))
            } else {
                shaper.enqueue(bucket, Arc::clone(exchange), Instant::now());
                (false, shaper.queued(bucket))
            }
        };

        if queue_full {
            #[cfg(feature = "tracing")]
            warn!(cluster = %self.name, limit, "queue limit reached; rejecting request");
            self.finish_dropped(
                exchange,
                notes,
                HttpStatus::SERVICE_UNAVAILABLE,
                DropReason::QueueFull,
            );
            return;
        }

        self.queued.incr();

        #[cfg(feature = "tracing")]
        debug!(cluster = %self.name, depth, "request enqueued");

        self.events.emit(&ClusterEvent::RequestQueued {
            cluster_name: self.name.clone(),
            bucket: self.shaper.lock().name(bucket).to_string(),
            depth,
            timestamp: Instant::now(),
        });
    }

    // ------------------------------------------------------------------
    // completion callbacks
    // ------------------------------------------------------------------

    fn release(&self, exchange: &Arc<dyn HttpExchange>) {
        let notes = match RequestNotes::of(exchange) {
            Some(notes) => notes,
            None => return,
        };

        // commit the cache build first so parked waiters ride the result
        if let Some(token) = notes.take_cache_build() {
            if let Some(cache) = &self.cache {
                match cache.commit(token, exchange) {
                    CommitOutcome::Stored { .. } => {}
                    CommitOutcome::Uncacheable { reseed } => self.reseed(reseed),
                }
            }
        }

        self.load.decr();

        let tokens = notes.take_tokens();
        if tokens > 0 {
            if let Some(bucket) = notes.bucket() {
                self.shaper.lock().put(bucket, tokens);
            }
        }

        if let Some(id) = notes.take_backend() {
            if let Some(backend) = self.backend(id) {
                backend.load().decr();
                backend.monitor().note_traffic();

                if backend.role() == BackendRole::Terminate && backend.load().current() == 0 {
                    self.delete_backend(id);
                } else {
                    self.dequeue_to(id);
                }
            }
        }
    }

    fn reject(&self, exchange: &Arc<dyn HttpExchange>, _status: HttpStatus) {
        let notes = self.ensure_notes(exchange);

        self.load.decr();

        if let Some(id) = notes.take_backend() {
            if let Some(backend) = self.backend(id) {
                backend.load().decr();
                // the transport could not serve through this backend;
                // treat it as broken until the monitor proves otherwise
                backend.monitor().set_state(HealthState::Offline);
            }
        }

        self.reschedule(exchange);
    }

    /// Pops the next waiter the shaper will fund and posts it at the
    /// backend that just freed capacity.
    fn dequeue_to(&self, id: BackendId) {
        let popped = self.shaper.lock().dequeue();
        let (_bucket, exchange) = match popped {
            Some(entry) => entry,
            None => return,
        };

        self.queued.decr();
        if let Some(notes) = RequestNotes::of(&exchange) {
            notes.set_tokens(1);
        }

        let weak = self.self_weak.clone();
        let ex = Arc::clone(&exchange);
        exchange.post(Box::new(move || {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let notes = inner.ensure_notes(&ex);
            if inner.dispatch(id, &ex, &notes) != SchedulerStatus::Success {
                // token stays with the request; the reschedule path
                // either reuses or returns it
                inner.reschedule(&ex);
            }
        }));
    }

    /// Finishes a request with an error status, after trying the stale
    /// cache fallback. Token bookkeeping is settled on every exit.
    fn finish_dropped(
        &self,
        exchange: &Arc<dyn HttpExchange>,
        notes: &RequestNotes,
        status: HttpStatus,
        reason: DropReason,
    ) {
        let tokens = notes.take_tokens();
        if tokens > 0 {
            if let Some(bucket) = notes.bucket() {
                self.shaper.lock().put(bucket, tokens);
            }
        }

        // a dying builder releases its parked waiters
        if let Some(token) = notes.take_cache_build() {
            if let Some(cache) = &self.cache {
                let reseed = cache.abandon(token);
                self.reseed(reseed);
            }
        }

        if let Some(cache) = &self.cache {
            if !notes.cache_ignore() {
                if let Some(key) = notes.cache_key() {
                    if cache.deliver_shadow(exchange, &key) {
                        return;
                    }
                }
            }
        }

        let retry_after = self.config.read().retry_after;
        if !retry_after.is_zero() {
            exchange.push_header("Retry-After", &retry_after.as_secs().to_string());
        }

        exchange.set_status(status);
        exchange.finish();

        self.dropped.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "director_requests_dropped_total",
            "reason" => reason.as_str()
        )
        .increment(1);

        #[cfg(feature = "tracing")]
        warn!(cluster = %self.name, reason = reason.as_str(), status = %status, "request dropped");

        self.events.emit(&ClusterEvent::RequestDropped {
            cluster_name: self.name.clone(),
            reason,
            status,
            timestamp: Instant::now(),
        });
    }

    /// Requests handed back by the cache (destroyed objects, overdue
    /// waiters) re-enter scheduling with caching bypassed.
    fn reseed(&self, exchanges: Vec<Arc<dyn HttpExchange>>) {
        for exchange in exchanges {
            let notes = self.ensure_notes(&exchange);
            notes.set_cache_ignore(true);

            let weak = self.self_weak.clone();
            let ex = Arc::clone(&exchange);
            exchange.post(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.reschedule(&ex);
                }
            }));
        }
    }

    // ------------------------------------------------------------------
    // backend administration
    // ------------------------------------------------------------------

    pub(crate) fn create_backend(&self, spec: BackendSpec) -> Result<BackendId, BackendError> {
        if self.find_backend(&spec.name).is_some() {
            return Err(BackendError::DuplicateName(spec.name));
        }

        let health = self.config.read().health_check.clone();
        let (transport, probe) = self.factory.create(&spec, &health);

        let monitor = HealthMonitor::builder(probe)
            .interval(spec.health_interval)
            .mode(spec.health_mode)
            .build();

        let backend = Arc::new(Backend::new(
            spec.name.clone(),
            spec.protocol,
            spec.socket.clone(),
            spec.capacity,
            spec.role,
            monitor,
            transport,
        ));

        let id = {
            let mut arena = self.backends.write();
            arena.push(Some(Arc::clone(&backend)));
            BackendId(arena.len() - 1)
        };
        self.pools[spec.role.index()].lock().push(id);

        let weak = self.self_weak.clone();
        backend
            .monitor()
            .set_state_change_callback(move |old, new| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_health_changed(id, old, new);
                }
            });

        if self.started.load(Ordering::Relaxed) {
            backend.monitor().start();
        }

        if spec.enabled {
            self.set_backend_enabled(id, true);
        }

        #[cfg(feature = "tracing")]
        info!(cluster = %self.name, backend = %backend.name(), "backend created");

        Ok(id)
    }

    pub(crate) fn set_backend_enabled(&self, id: BackendId, enabled: bool) {
        let backend = match self.backend(id) {
            Some(backend) => backend,
            None => return,
        };

        // repeated enables are idempotent; only a real flip moves capacity
        if backend.set_enabled_flag(enabled) {
            self.on_enabled_changed(id, &backend, enabled);
        }
    }

    fn set_backend_capacity(&self, id: BackendId, capacity: usize) {
        let backend = match self.backend(id) {
            Some(backend) => backend,
            None => return,
        };

        let old = backend.capacity();
        backend.set_capacity(capacity);

        if Self::funds_shaper(&backend) && backend.is_eligible() {
            self.resize_shaper_by(capacity as i64 - old as i64);
        }
    }

    fn set_backend_role(&self, id: BackendId, role: BackendRole) -> Result<(), BackendError> {
        let backend = self.backend(id).ok_or(BackendError::NotFound)?;
        let old_role = backend.role();
        if old_role == role {
            return Ok(());
        }

        let contributed = old_role != BackendRole::Terminate && backend.is_eligible();
        let contributes = role != BackendRole::Terminate && backend.is_eligible();

        self.pools[old_role.index()].lock().remove(id);
        backend.set_role(role);

        if role == BackendRole::Terminate && backend.load().current() == 0 {
            self.delete_backend(id);
        } else {
            self.pools[role.index()].lock().push(id);
        }

        if contributed && !contributes {
            self.resize_shaper_by(-(backend.capacity() as i64));
        } else if !contributed && contributes {
            self.resize_shaper_by(backend.capacity() as i64);
        }

        self.persist_best_effort();
        Ok(())
    }

    fn delete_backend(&self, id: BackendId) {
        let backend = {
            let mut arena = self.backends.write();
            arena.get_mut(id.0).and_then(|slot| slot.take())
        };

        if let Some(backend) = backend {
            backend.monitor().stop();
            self.pools[backend.role().index()].lock().remove(id);

            #[cfg(feature = "tracing")]
            info!(cluster = %self.name, backend = %backend.name(), "backend removed");
        }

        self.persist_best_effort();
    }

    // ------------------------------------------------------------------
    // capacity signals
    // ------------------------------------------------------------------

    /// Whether this backend's capacity funds the shaper. Backup members
    /// count too: their capacity is what lets requests flow during a full
    /// active-pool outage.
    fn funds_shaper(backend: &Backend) -> bool {
        backend.role() != BackendRole::Terminate
    }

    fn on_enabled_changed(&self, id: BackendId, backend: &Arc<Backend>, enabled: bool) {
        self.events.emit(&ClusterEvent::BackendEnabledChanged {
            cluster_name: self.name.clone(),
            backend: backend.name().to_string(),
            enabled,
            timestamp: Instant::now(),
        });

        if !Self::funds_shaper(backend) || !backend.monitor().is_online() {
            return;
        }

        if enabled {
            self.resize_shaper_by(backend.capacity() as i64);
            self.dequeue_to(id);
        } else {
            self.resize_shaper_by(-(backend.capacity() as i64));
        }
    }

    fn on_health_changed(&self, id: BackendId, old: HealthState, new: HealthState) {
        let backend = match self.backend(id) {
            Some(backend) => backend,
            None => return,
        };

        #[cfg(feature = "tracing")]
        info!(cluster = %self.name, backend = %backend.name(), from = %old, to = %new, "backend health changed");

        self.events.emit(&ClusterEvent::BackendHealthChanged {
            cluster_name: self.name.clone(),
            backend: backend.name().to_string(),
            old,
            new,
            timestamp: Instant::now(),
        });

        if new == HealthState::Online {
            if !backend.is_enabled() {
                return;
            }
            if Self::funds_shaper(&backend) {
                self.resize_shaper_by(backend.capacity() as i64);
            }
            if self.config.read().sticky_offline_mode {
                #[cfg(feature = "tracing")]
                warn!(
                    cluster = %self.name,
                    backend = %backend.name(),
                    "backend disabled due to sticky offline mode"
                );
                self.set_backend_enabled(id, false);
            } else {
                self.dequeue_to(id);
            }
        } else if old == HealthState::Online
            && backend.is_enabled()
            && Self::funds_shaper(&backend)
        {
            self.resize_shaper_by(-(backend.capacity() as i64));
        }
    }

    fn resize_shaper_by(&self, delta: i64) {
        let mut shaper = self.shaper.lock();
        let capacity = (shaper.capacity() as i64 + delta).max(0) as usize;
        shaper.resize(capacity);
    }

    // ------------------------------------------------------------------
    // sweeps and lifecycle
    // ------------------------------------------------------------------

    fn sweep_once(&self) {
        let timeout = self.config.read().queue_timeout;
        let expired = self.shaper.lock().expire_queued(timeout, Instant::now());

        for exchange in expired {
            self.queued.decr();
            let notes = self.ensure_notes(&exchange);
            let age = notes.ctime().elapsed();

            #[cfg(feature = "tracing")]
            info!(cluster = %self.name, age_secs = age.as_secs(), "queued request timed out");
            #[cfg(not(feature = "tracing"))]
            let _ = age;

            let weak = self.self_weak.clone();
            let ex = Arc::clone(&exchange);
            exchange.post(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Some(notes) = RequestNotes::of(&ex) {
                        inner.finish_dropped(
                            &ex,
                            &notes,
                            HttpStatus::GATEWAY_TIMEOUT,
                            DropReason::QueueTimeout,
                        );
                    }
                }
            }));
        }

        if let Some(cache) = &self.cache {
            let reseed = cache.release_overdue_waiters();
            self.reseed(reseed);
        }
    }

    fn start(&self) {
        self.started.store(true, Ordering::Relaxed);

        for slot in self.backends.read().iter().flatten() {
            slot.monitor().start();
        }

        let mut task = self.sweep_task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let weak = self.self_weak.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                let period = match weak.upgrade() {
                    Some(inner) => {
                        let timeout = inner.config.read().queue_timeout;
                        (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1))
                    }
                    None => return,
                };
                tokio::time::sleep(period).await;
                match weak.upgrade() {
                    Some(inner) => inner.sweep_once(),
                    None => return,
                }
            }
        }));
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Relaxed);

        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }

        let ids: Vec<BackendId> = (0..self.backends.read().len()).map(BackendId).collect();
        for id in ids {
            if let Some(backend) = self.backend(id) {
                self.set_backend_enabled(id, false);
                backend.monitor().stop();
            }
        }
    }

    fn persist_best_effort(&self) {
        if self.storage_path.lock().is_none() {
            return;
        }
        if let Err(_err) = self.save_to_storage() {
            #[cfg(feature = "tracing")]
            error!(cluster = %self.name, error = %_err, "could not rewrite cluster configuration");
        }
    }
}

fn expand_cache_key(template: &str, exchange: &Arc<dyn HttpExchange>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(&exchange.request_header("Host").unwrap_or_default()),
            Some('r') => out.push_str(&exchange.path()),
            Some('q') => out.push_str(&exchange.query()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Builder for [`Cluster`].
pub struct ClusterBuilder {
    name: String,
    config: ClusterConfig,
    factory: Arc<dyn TransportFactory>,
    cache: Option<ObjectCache>,
    events: EventListeners<ClusterEvent>,
}

impl ClusterBuilder {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjusts the configuration in place.
    pub fn configure(mut self, apply: impl FnOnce(&mut ClusterConfig)) -> Self {
        apply(&mut self.config);
        self
    }

    /// Attaches a response cache.
    pub fn cache(mut self, cache: ObjectCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Registers an event listener for all cluster events.
    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: EventListener<ClusterEvent> + 'static,
    {
        self.events.add(listener);
        self
    }

    /// Registers a callback fired whenever the cluster drops a request.
    pub fn on_request_dropped<F>(mut self, f: F) -> Self
    where
        F: Fn(DropReason) + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(move |event: &ClusterEvent| {
            if let ClusterEvent::RequestDropped { reason, .. } = event {
                f(*reason);
            }
        }));
        self
    }

    /// Registers a callback fired on backend health transitions.
    pub fn on_backend_health_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, HealthState, HealthState) + Send + Sync + 'static,
    {
        self.events.add(FnListener::new(move |event: &ClusterEvent| {
            if let ClusterEvent::BackendHealthChanged {
                backend, old, new, ..
            } = event
            {
                f(backend, *old, *new);
            }
        }));
        self
    }

    pub fn build(self) -> Cluster {
        let scheduler = self.config.scheduler;
        let inner = Arc::new_cyclic(|weak| ClusterInner {
            name: self.name,
            config: RwLock::new(self.config),
            factory: self.factory,
            backends: RwLock::new(Vec::new()),
            pools: [
                Mutex::new(BackendPool::new(scheduler)),
                Mutex::new(BackendPool::new(scheduler)),
                Mutex::new(BackendPool::new(PolicyKind::RoundRobin)),
            ],
            shaper: Mutex::new(TokenShaper::new(0)),
            load: Counter::new(),
            queued: Counter::new(),
            dropped: AtomicU64::new(0),
            cache: self.cache.map(Arc::new),
            events: self.events,
            storage_path: Mutex::new(None),
            sweep_task: Mutex::new(None),
            started: AtomicBool::new(false),
            self_weak: weak.clone(),
        });
        Cluster { inner }
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
    }
}
