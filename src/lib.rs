//! Workspace test package.
//!
//! The scenario suite under `tests/` exercises the director crates
//! end-to-end with scriptable mock transports: admission and queueing,
//! backup failover, the retry state machine, queue timeouts, sticky
//! offline handling, single-flight caching, and configuration
//! round-trips.
//!
//! The crate itself just re-exports the workspace members for the tests'
//! convenience.

pub use director;
pub use director_cache;
pub use director_core;
pub use director_health;
pub use director_shaper;
