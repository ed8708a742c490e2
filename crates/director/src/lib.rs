//! Request-scheduling core of an HTTP/FastCGI reverse proxy.
//!
//! A [`Cluster`] sits between an accepted HTTP request and a set of
//! upstream backends and answers three questions for every request: which
//! hierarchical rate-limit bucket governs it, which backend (if any) may
//! serve it right now, and what to do when none can — reject, enqueue,
//! retry elsewhere, or serve a stale cached response.
//!
//! The moving parts:
//!
//! - a hierarchical token shaper ([`director_shaper`]) funds concurrent
//!   in-flight work per bucket, with borrowing up to a ceiling and FIFO
//!   wait queues;
//! - per-role backend pools (`active` first, `backup` on full outage)
//!   with round-robin or storage-order selection;
//! - per-backend admission gated on health, enabled flag, and capacity;
//! - active health monitoring ([`director_health`]) with
//!   success-threshold hysteresis feeding shaper capacity changes;
//! - a per-request retry state machine bounded by `max-retry-count` and
//!   the bucket queue timeout;
//! - an optional single-flight response cache ([`director_cache`]).
//!
//! The HTTP wire handling stays outside: requests appear as
//! `Arc<dyn HttpExchange>` facades, upstream I/O happens in
//! [`BackendTransport`] implementations that call back into
//! [`Cluster::release`] / [`Cluster::reject`].
//!
//! # Example
//!
//! ```rust,no_run
//! use director::{BackendSpec, Cluster, Protocol, SocketSpec, TransportFactory};
//! use director::{BackendTransport, HealthCheckPrototype};
//! use director_core::HttpExchange;
//! use director_health::{HealthProbe, ProbeError};
//! use std::sync::Arc;
//!
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     fn create(
//!         &self,
//!         spec: &BackendSpec,
//!         health: &HealthCheckPrototype,
//!     ) -> (Arc<dyn BackendTransport>, Arc<dyn HealthProbe>) {
//!         // wire up the real HTTP/FastCGI transport here
//!         unimplemented!()
//!     }
//! }
//!
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Cluster::builder("app", Arc::new(MyFactory)).build();
//! cluster.load_file("/var/lib/director/app.db")?;
//! cluster.start();
//!
//! let bucket = cluster.find_bucket("uploads").unwrap_or(cluster.root_bucket());
//! # let request: Arc<dyn HttpExchange> = unimplemented!();
//! cluster.schedule(request, bucket);
//! # Ok(())
//! # }
//! ```

mod backend;
mod cluster;
mod config;
mod error;
mod events;
mod ini;
mod notes;
mod persist;
mod pool;
mod transport;

pub use backend::{Backend, BackendId, BackendRole, InvalidBackendRole};
pub use cluster::{Cluster, ClusterBuilder};
pub use config::ClusterConfig;
pub use error::{BackendError, ConfigError, DropReason};
pub use events::ClusterEvent;
pub use notes::RequestNotes;
pub use pool::{InvalidPolicy, PolicyKind};
pub use transport::{
    BackendSpec, BackendTransport, HealthCheckPrototype, InvalidProtocol, Protocol, SocketSpec,
    TransportFactory,
};

pub use director_core::{
    ClientAbortAction, HealthState, HttpExchange, HttpStatus, ResponseSnapshot, SchedulerStatus,
};
pub use director_health::ProbeMode;
