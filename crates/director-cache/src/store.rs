//! The cache store: key map, lookup/commit/abandon, purging.

use crate::config::CacheConfig;
use crate::entry::{Entry, ObjectState, Stored, Waiter};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use director_core::HttpExchange;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

/// Outcome of a cache lookup.
pub enum CacheLookup {
    /// The request has been served, or parked to be served when the
    /// in-flight build for its key completes. The caller is done with it.
    Served,
    /// The caller must fetch upstream; once the origin response completed,
    /// pass the token to [`ObjectCache::commit`] (or
    /// [`ObjectCache::abandon`] on failure).
    Build(BuildToken),
    /// Caching does not apply to this request.
    Bypass,
}

/// Capability to finish one in-flight build. Exactly one exists per
/// concurrent build of a variant.
#[derive(Debug)]
pub struct BuildToken {
    pub(crate) key: String,
    pub(crate) variant: u64,
}

impl BuildToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Outcome of committing a completed origin response.
pub enum CommitOutcome {
    /// The response was stored; `delivered` parked waiters were served it.
    Stored { delivered: usize },
    /// The origin forbade caching. The entry was destroyed; the returned
    /// waiters must be rescheduled (with caching bypassed).
    Uncacheable {
        reseed: Vec<Arc<dyn HttpExchange>>,
    },
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    shadow_hits: AtomicU64,
    misses: AtomicU64,
    purges: AtomicU64,
    expiries: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn shadow_hits(&self) -> u64 {
        self.shadow_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn purges(&self) -> u64 {
        self.purges.load(Ordering::Relaxed)
    }

    pub fn expiries(&self) -> u64 {
        self.expiries.load(Ordering::Relaxed)
    }

    fn count_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("director_cache_lookups_total", "outcome" => "hit").increment(1);
    }

    fn count_shadow_hit(&self) {
        self.shadow_hits.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("director_cache_lookups_total", "outcome" => "shadow").increment(1);
    }

    fn count_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("director_cache_lookups_total", "outcome" => "miss").increment(1);
    }
}

/// Keyed response cache with single-flight build coalescing.
pub struct ObjectCache {
    enabled: AtomicBool,
    deliver_active: AtomicBool,
    deliver_shadow: AtomicBool,
    lock_on_update: AtomicBool,
    update_lock_timeout: Mutex<Duration>,
    default_key: Mutex<String>,
    default_ttl: Mutex<Duration>,
    default_shadow_ttl: Mutex<Duration>,
    stats: CacheStats,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

impl ObjectCache {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            deliver_active: AtomicBool::new(config.deliver_active),
            deliver_shadow: AtomicBool::new(config.deliver_shadow),
            lock_on_update: AtomicBool::new(config.lock_on_update),
            update_lock_timeout: Mutex::new(config.update_lock_timeout),
            default_key: Mutex::new(config.default_key),
            default_ttl: Mutex::new(config.default_ttl),
            default_shadow_ttl: Mutex::new(config.default_shadow_ttl),
            stats: CacheStats::default(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn builder() -> crate::CacheConfigBuilder {
        CacheConfig::builder()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Relaxed);
    }

    pub fn deliver_active_enabled(&self) -> bool {
        self.deliver_active.load(Ordering::Relaxed)
    }

    pub fn set_deliver_active(&self, value: bool) {
        self.deliver_active.store(value, Ordering::Relaxed);
    }

    pub fn deliver_shadow_enabled(&self) -> bool {
        self.deliver_shadow.load(Ordering::Relaxed)
    }

    pub fn set_deliver_shadow(&self, value: bool) {
        self.deliver_shadow.store(value, Ordering::Relaxed);
    }

    pub fn lock_on_update(&self) -> bool {
        self.lock_on_update.load(Ordering::Relaxed)
    }

    pub fn set_lock_on_update(&self, value: bool) {
        self.lock_on_update.store(value, Ordering::Relaxed);
    }

    pub fn update_lock_timeout(&self) -> Duration {
        *self.update_lock_timeout.lock()
    }

    pub fn set_update_lock_timeout(&self, value: Duration) {
        *self.update_lock_timeout.lock() = value;
    }

    pub fn default_key(&self) -> String {
        self.default_key.lock().clone()
    }

    pub fn default_ttl(&self) -> Duration {
        *self.default_ttl.lock()
    }

    pub fn set_default_ttl(&self, value: Duration) {
        *self.default_ttl.lock() = value;
    }

    pub fn default_shadow_ttl(&self) -> Duration {
        *self.default_shadow_ttl.lock()
    }

    pub fn set_default_shadow_ttl(&self, value: Duration) {
        *self.default_shadow_ttl.lock() = value;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn entry_for(&self, key: &str) -> Arc<Mutex<Entry>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Entry::new()))),
        )
    }

    /// Attempts to serve `exchange` from cache.
    ///
    /// Returns [`CacheLookup::Served`] when the request was delivered (or
    /// parked on the in-flight build), [`CacheLookup::Build`] when the
    /// caller must fetch upstream, and [`CacheLookup::Bypass`] when caching
    /// is switched off.
    pub fn deliver_active(
        &self,
        exchange: &Arc<dyn HttpExchange>,
        key: &str,
        ttl: Duration,
    ) -> CacheLookup {
        if !self.enabled() || !self.deliver_active_enabled() {
            return CacheLookup::Bypass;
        }

        let now = Instant::now();
        let entry_arc = self.entry_for(key);
        let mut entry = entry_arc.lock();

        let variant_id = match entry.select(exchange) {
            Some(id) => id,
            None => {
                let id = entry.spawn_variant();
                self.stats.count_miss();
                drop(entry);
                return self.begin_build(exchange, key, id, ObjectState::Spawning);
            }
        };

        let lock_on_update = self.lock_on_update();
        let variant = match entry.variant_mut(variant_id) {
            Some(v) => v,
            None => return CacheLookup::Bypass,
        };

        // freshness check
        if variant.state == ObjectState::Active {
            if let Some(stored) = &variant.stored {
                if now.saturating_duration_since(stored.ctime) >= ttl {
                    variant.state = ObjectState::Stale;
                    self.stats.expiries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        match variant.state {
            ObjectState::Spawning => {
                if variant.building {
                    self.stats.count_hit();
                    variant.interests.push(Waiter {
                        exchange: Arc::clone(exchange),
                        parked_at: now,
                    });
                    CacheLookup::Served
                } else {
                    // the previous builder vanished; take over
                    variant.building = true;
                    self.stats.count_miss();
                    drop(entry);
                    self.begin_build(exchange, key, variant_id, ObjectState::Spawning)
                }
            }
            ObjectState::Active => match variant.stored.clone() {
                Some(stored) => {
                    self.stats.count_hit();
                    drop(entry);
                    stored.deliver(exchange, ObjectState::Active, now);
                    CacheLookup::Served
                }
                None => {
                    // active without a body cannot be served; rebuild
                    variant.state = ObjectState::Spawning;
                    variant.building = true;
                    self.stats.count_miss();
                    drop(entry);
                    self.begin_build(exchange, key, variant_id, ObjectState::Spawning)
                }
            },
            ObjectState::Stale => {
                self.stats.count_miss();
                variant.state = ObjectState::Updating;
                variant.building = true;
                drop(entry);
                self.begin_build(exchange, key, variant_id, ObjectState::Updating)
            }
            ObjectState::Updating => {
                if lock_on_update {
                    self.stats.count_hit();
                    variant.interests.push(Waiter {
                        exchange: Arc::clone(exchange),
                        parked_at: now,
                    });
                    CacheLookup::Served
                } else {
                    self.stats.count_shadow_hit();
                    let stored = variant.stored.clone();
                    drop(entry);
                    if let Some(stored) = stored {
                        stored.deliver(exchange, ObjectState::Updating, now);
                    }
                    CacheLookup::Served
                }
            }
        }
    }

    fn begin_build(
        &self,
        exchange: &Arc<dyn HttpExchange>,
        key: &str,
        variant: u64,
        state: ObjectState,
    ) -> CacheLookup {
        // a conditional GET must not end up cached as a 304
        if exchange.method() == "GET" {
            for header in [
                "If-Match",
                "If-None-Match",
                "If-Modified-Since",
                "If-Unmodified-Since",
            ] {
                exchange.remove_request_header(header);
            }
        }

        exchange.push_header("X-Cache-Lookup", state.lookup_str());
        exchange.push_header("X-Cache-Hits", "0");
        exchange.push_header("Age", "0");

        #[cfg(feature = "tracing")]
        debug!(key, "cache build started");

        CacheLookup::Build(BuildToken {
            key: key.to_string(),
            variant,
        })
    }

    /// Stores the builder's completed response and serves all parked
    /// waiters.
    ///
    /// An origin response carrying `Set-Cookie`, `Cache-Control: no-cache`,
    /// `Pragma: no-cache`, or `Vary: *` is not cacheable: the variant is
    /// destroyed and its waiters handed back for rescheduling.
    pub fn commit(
        &self,
        token: BuildToken,
        builder: &Arc<dyn HttpExchange>,
    ) -> CommitOutcome {
        let snapshot = builder.response_snapshot();
        let now = Instant::now();

        let vary_all = snapshot
            .header("Vary")
            .map(|v| v.trim() == "*")
            .unwrap_or(false);
        let uncacheable = snapshot.header("Set-Cookie").is_some()
            || header_has_token(&snapshot.headers, "Cache-Control", "no-cache")
            || header_has_token(&snapshot.headers, "Pragma", "no-cache")
            || vary_all;

        let entry_arc = match self.entries.read().get(&token.key) {
            Some(entry) => Arc::clone(entry),
            None => return CommitOutcome::Stored { delivered: 0 },
        };

        if uncacheable {
            #[cfg(feature = "tracing")]
            info!(
                key = %token.key,
                "origin response is uncacheable; destroying cache object"
            );
            let reseed = self.destroy_variant(&entry_arc, &token);
            return CommitOutcome::Uncacheable { reseed };
        }

        let stored = Stored::from_snapshot(&snapshot, now);
        let waiters = {
            let mut entry = entry_arc.lock();

            if let Some(vary) = snapshot.header("Vary") {
                entry.vary = vary
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            let vary = entry.vary.clone();

            match entry.variant_mut(token.variant) {
                Some(variant) => {
                    variant.matchers = vary
                        .iter()
                        .map(|name| {
                            let value = builder.request_header(name).unwrap_or_default();
                            (name.clone(), value)
                        })
                        .collect();
                    variant.state = ObjectState::Active;
                    variant.building = false;
                    variant.stored = Some(stored.clone());
                    std::mem::take(&mut variant.interests)
                }
                None => Vec::new(),
            }
        };

        let delivered = waiters.len();
        for waiter in waiters {
            let stored = stored.clone();
            let exchange = Arc::clone(&waiter.exchange);
            waiter.exchange.post(Box::new(move || {
                stored.deliver(&exchange, ObjectState::Active, now);
            }));
        }

        CommitOutcome::Stored { delivered }
    }

    /// Gives up an in-flight build. If a stale body exists it is served to
    /// the parked waiters; otherwise they are returned for rescheduling.
    pub fn abandon(&self, token: BuildToken) -> Vec<Arc<dyn HttpExchange>> {
        let entry_arc = match self.entries.read().get(&token.key) {
            Some(entry) => Arc::clone(entry),
            None => return Vec::new(),
        };

        let staled = {
            let mut entry = entry_arc.lock();
            match entry.variant_mut(token.variant) {
                Some(variant) if variant.stored.is_some() => {
                    variant.building = false;
                    variant.state = ObjectState::Stale;
                    variant
                        .stored
                        .clone()
                        .map(|stored| (stored, std::mem::take(&mut variant.interests)))
                }
                _ => None,
            }
        };

        match staled {
            Some((stored, waiters)) => {
                let now = Instant::now();
                for waiter in waiters {
                    self.stats.count_shadow_hit();
                    let stored = stored.clone();
                    let exchange = Arc::clone(&waiter.exchange);
                    waiter.exchange.post(Box::new(move || {
                        stored.deliver(&exchange, ObjectState::Stale, now);
                    }));
                }
                Vec::new()
            }
            None => self.destroy_variant(&entry_arc, &token),
        }
    }

    fn destroy_variant(
        &self,
        entry_arc: &Arc<Mutex<Entry>>,
        token: &BuildToken,
    ) -> Vec<Arc<dyn HttpExchange>> {
        let (waiters, entry_empty) = {
            let mut entry = entry_arc.lock();
            let waiters = match entry.variant_mut(token.variant) {
                Some(variant) => std::mem::take(&mut variant.interests),
                None => Vec::new(),
            };
            entry.variants.retain(|v| v.id != token.variant);
            (waiters, entry.variants.is_empty())
        };

        if entry_empty {
            self.entries.write().remove(&token.key);
        }

        waiters.into_iter().map(|w| w.exchange).collect()
    }

    /// Attempts to serve a stored body for `key` as a failure fallback.
    pub fn deliver_shadow(&self, exchange: &Arc<dyn HttpExchange>, key: &str) -> bool {
        if !self.enabled() || !self.deliver_shadow_enabled() {
            return false;
        }

        let entry_arc = match self.entries.read().get(key) {
            Some(entry) => Arc::clone(entry),
            None => return false,
        };

        let (state, stored) = {
            let entry = entry_arc.lock();
            let variant = match entry.select(exchange) {
                Some(id) => entry.variants.iter().find(|v| v.id == id),
                None => None,
            };
            match variant.and_then(|v| v.stored.clone().map(|s| (v.state, s))) {
                Some((state, stored)) => (state, stored),
                None => return false,
            }
        };

        self.stats.count_shadow_hit();
        exchange.push_header("X-Director-Cache", "shadow");
        stored.deliver(exchange, state, Instant::now());
        true
    }

    /// Marks the fresh representations under `key` stale. They remain
    /// available for shadow delivery.
    ///
    /// Returns true only when something was actually expired, so purging
    /// the same key twice reports found, then not-found, and moves the
    /// purge counter exactly once.
    pub fn purge(&self, key: &str) -> bool {
        let entry_arc = match self.entries.read().get(key) {
            Some(entry) => Arc::clone(entry),
            None => return false,
        };

        let mut entry = entry_arc.lock();
        let mut changed = false;
        for variant in &mut entry.variants {
            if variant.stored.is_some() && variant.state == ObjectState::Active {
                variant.state = ObjectState::Stale;
                changed = true;
            }
        }

        if changed {
            self.stats.purges.fetch_add(1, Ordering::Relaxed);

            #[cfg(feature = "tracing")]
            info!(key, "cache entry purged");
        }

        changed
    }

    /// Marks every cached representation stale without freeing the store.
    pub fn expire_all(&self) {
        let entries: Vec<_> = self.entries.read().values().cloned().collect();
        for entry_arc in entries {
            let mut entry = entry_arc.lock();
            for variant in &mut entry.variants {
                if variant.stored.is_some() && variant.state == ObjectState::Active {
                    variant.state = ObjectState::Stale;
                }
            }
            self.stats.purges.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Frees the whole store. Waiters parked on in-flight builds are
    /// returned for rescheduling.
    pub fn purge_all(&self) -> Vec<Arc<dyn HttpExchange>> {
        let drained: Vec<_> = {
            let mut entries = self.entries.write();
            let n = entries.len() as u64;
            self.stats.purges.fetch_add(n, Ordering::Relaxed);
            entries.drain().map(|(_, v)| v).collect()
        };

        let mut reseed = Vec::new();
        for entry_arc in drained {
            let mut entry = entry_arc.lock();
            for variant in &mut entry.variants {
                reseed.extend(
                    std::mem::take(&mut variant.interests)
                        .into_iter()
                        .map(|w| w.exchange),
                );
            }
        }
        reseed
    }

    /// Releases waiters that have been parked on a build longer than
    /// `update_lock_timeout`: served stale when a body exists, otherwise
    /// returned for rescheduling. Driven by the cluster's sweep timer.
    pub fn release_overdue_waiters(&self) -> Vec<Arc<dyn HttpExchange>> {
        let timeout = self.update_lock_timeout();
        let now = Instant::now();
        let entries: Vec<_> = self.entries.read().values().cloned().collect();

        let mut reseed = Vec::new();
        for entry_arc in entries {
            let mut entry = entry_arc.lock();
            for variant in &mut entry.variants {
                if !variant.building {
                    continue;
                }
                let overdue: Vec<Waiter> = {
                    let mut kept = Vec::new();
                    let mut out = Vec::new();
                    for waiter in variant.interests.drain(..) {
                        if now.saturating_duration_since(waiter.parked_at) >= timeout {
                            out.push(waiter);
                        } else {
                            kept.push(waiter);
                        }
                    }
                    variant.interests = kept;
                    out
                };

                for waiter in overdue {
                    match variant.stored.clone() {
                        Some(stored) => {
                            self.stats.count_shadow_hit();
                            let exchange = Arc::clone(&waiter.exchange);
                            waiter.exchange.post(Box::new(move || {
                                stored.deliver(&exchange, ObjectState::Updating, now);
                            }));
                        }
                        None => reseed.push(waiter.exchange),
                    }
                }
            }
        }
        reseed
    }
}

fn header_has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .any(|(_, v)| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}
