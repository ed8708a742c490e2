//! Cache configuration.

use std::time::Duration;

/// Configuration for the object cache.
///
/// All knobs stay adjustable at runtime through the [`ObjectCache`]
/// setters; this struct carries the initial values.
///
/// [`ObjectCache`]: crate::ObjectCache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub(crate) enabled: bool,
    pub(crate) deliver_active: bool,
    pub(crate) deliver_shadow: bool,
    pub(crate) lock_on_update: bool,
    pub(crate) update_lock_timeout: Duration,
    pub(crate) default_key: String,
    pub(crate) default_ttl: Duration,
    pub(crate) default_shadow_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deliver_active: true,
            deliver_shadow: true,
            lock_on_update: true,
            update_lock_timeout: Duration::from_secs(10),
            default_key: "%h#%r#%q".to_string(),
            default_ttl: Duration::from_secs(20),
            default_shadow_ttl: Duration::ZERO,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Master switch. Default: true.
    pub fn enabled(mut self, value: bool) -> Self {
        self.config.enabled = value;
        self
    }

    /// Serve cached objects on the fast path. Default: true.
    pub fn deliver_active(mut self, value: bool) -> Self {
        self.config.deliver_active = value;
        self
    }

    /// Serve stale objects instead of failure responses. Default: true.
    pub fn deliver_shadow(mut self, value: bool) -> Self {
        self.config.deliver_shadow = value;
        self
    }

    /// Park concurrent requests while a key is being refreshed instead of
    /// serving them the stale body. Default: true.
    pub fn lock_on_update(mut self, value: bool) -> Self {
        self.config.lock_on_update = value;
        self
    }

    /// How long a parked request may wait on a build before it is served
    /// stale (or rescheduled). Default: 10s.
    pub fn update_lock_timeout(mut self, value: Duration) -> Self {
        self.config.update_lock_timeout = value;
        self
    }

    /// Cache-key template (`%h` host, `%r` path, `%q` query).
    /// Default: `%h#%r#%q`.
    pub fn default_key(mut self, value: impl Into<String>) -> Self {
        self.config.default_key = value.into();
        self
    }

    /// How long an object stays fresh. Default: 20s.
    pub fn default_ttl(mut self, value: Duration) -> Self {
        self.config.default_ttl = value;
        self
    }

    /// How long a stale object is still worth keeping for shadow delivery.
    /// Default: zero.
    pub fn default_shadow_ttl(mut self, value: Duration) -> Self {
        self.config.default_shadow_ttl = value;
        self
    }

    pub fn build(self) -> crate::ObjectCache {
        crate::ObjectCache::new(self.config)
    }
}
