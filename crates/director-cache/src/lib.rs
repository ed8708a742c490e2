//! Response object cache for the director.
//!
//! Maps a request fingerprint (the cache key, computed by the cluster) to a
//! cached response object. The cache guarantees at most one concurrent
//! upstream build per key: concurrent requests for a key that is being
//! built or refreshed are either parked on the object's interest list and
//! served when the build commits (`lock_on_update`), or served the stale
//! body immediately.
//!
//! The cache also honors `Vary`, answers conditional GETs (304/412) from
//! the stored representation, refuses to store responses carrying
//! `Set-Cookie` or no-cache directives, and supports purging.
//!
//! The cluster drives it through three calls:
//!
//! - [`ObjectCache::deliver_active`] before scheduling: either the request
//!   is served/parked ([`CacheLookup::Served`]) or the caller receives a
//!   [`BuildToken`] and must fetch upstream.
//! - [`ObjectCache::commit`] with the upstream
//!   [`ResponseSnapshot`](director_core::ResponseSnapshot) once the build
//!   request completed.
//! - [`ObjectCache::abandon`] when the build request failed; parked waiters
//!   are served stale or handed back for rescheduling.

mod config;
mod entry;
mod store;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::ObjectState;
pub use store::{BuildToken, CacheLookup, CacheStats, CommitOutcome, ObjectCache};
