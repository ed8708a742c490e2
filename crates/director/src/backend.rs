//! One upstream endpoint: capacity-gated admission plus health state.

use crate::transport::{BackendTransport, Protocol, SocketSpec};
use director_core::{Counter, HealthState, HttpExchange, SchedulerStatus};
use director_health::HealthMonitor;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Opaque handle to a backend inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub(crate) usize);

/// Scheduling role of a backend.
///
/// `Active` participates in primary scheduling; `Backup` is tried only
/// when the active pool is fully unavailable; `Terminate` is a drain
/// state: no new work, deleted once the load reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    Active,
    Backup,
    Terminate,
}

impl BackendRole {
    pub(crate) fn index(self) -> usize {
        match self {
            BackendRole::Active => 0,
            BackendRole::Backup => 1,
            BackendRole::Terminate => 2,
        }
    }
}

/// Error returned when parsing a [`BackendRole`] from configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid role value: {0:?}")]
pub struct InvalidBackendRole(pub String);

impl FromStr for BackendRole {
    type Err = InvalidBackendRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BackendRole::Active),
            "backup" => Ok(BackendRole::Backup),
            "terminate" => Ok(BackendRole::Terminate),
            other => Err(InvalidBackendRole(other.to_string())),
        }
    }
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendRole::Active => "active",
            BackendRole::Backup => "backup",
            BackendRole::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

/// One upstream application server.
///
/// Admission (`try_process`) is the only hot path: a short critical
/// section validates health, enabled flag, and capacity and bumps the load
/// counter; the transport's `process` call runs outside the lock and is
/// rolled back under a fresh acquisition if it fails synchronously.
pub struct Backend {
    name: String,
    protocol: Protocol,
    socket: SocketSpec,
    capacity: AtomicUsize,
    enabled: AtomicBool,
    terminate_protection: AtomicBool,
    role: Mutex<BackendRole>,
    load: Counter,
    monitor: HealthMonitor,
    transport: Arc<dyn BackendTransport>,
    admission: Mutex<()>,
}

impl Backend {
    pub(crate) fn new(
        name: String,
        protocol: Protocol,
        socket: SocketSpec,
        capacity: usize,
        role: BackendRole,
        monitor: HealthMonitor,
        transport: Arc<dyn BackendTransport>,
    ) -> Self {
        Self {
            name,
            protocol,
            socket,
            capacity: AtomicUsize::new(capacity),
            enabled: AtomicBool::new(false),
            terminate_protection: AtomicBool::new(false),
            role: Mutex::new(role),
            load: Counter::new(),
            monitor,
            transport,
            admission: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn socket(&self) -> &SocketSpec {
        &self.socket
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub(crate) fn set_capacity(&self, value: usize) {
        self.capacity.store(value, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled_flag(&self, value: bool) -> bool {
        self.enabled.swap(value, Ordering::Relaxed) != value
    }

    pub fn terminate_protection(&self) -> bool {
        self.terminate_protection.load(Ordering::Relaxed)
    }

    pub fn set_terminate_protection(&self, value: bool) {
        self.terminate_protection.store(value, Ordering::Relaxed);
    }

    pub fn role(&self) -> BackendRole {
        *self.role.lock()
    }

    pub(crate) fn set_role(&self, role: BackendRole) {
        *self.role.lock() = role;
    }

    pub fn load(&self) -> &Counter {
        &self.load
    }

    pub fn health_state(&self) -> HealthState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub(crate) fn transport(&self) -> &Arc<dyn BackendTransport> {
        &self.transport
    }

    /// Whether the backend may take new work at all.
    pub fn is_eligible(&self) -> bool {
        self.is_enabled() && self.monitor.is_online()
    }

    /// Attempts to admit one request and initiate upstream processing.
    ///
    /// A zero capacity means unbounded admission; such backends are used
    /// for pass-through proxying and contribute nothing to the shaper.
    pub(crate) fn try_process(&self, exchange: &Arc<dyn HttpExchange>) -> SchedulerStatus {
        {
            let _admission = self.admission.lock();

            if !self.monitor.is_online() {
                return SchedulerStatus::Unavailable;
            }
            if !self.is_enabled() {
                return SchedulerStatus::Unavailable;
            }
            let capacity = self.capacity();
            if capacity > 0 && self.load.current() >= capacity {
                return SchedulerStatus::Overloaded;
            }
            self.load.incr();
        }

        exchange.overwrite_header("X-Director-Backend", &self.name);

        if !self.transport.process(exchange) {
            // synchronous refusal; roll the admission back and flag the
            // backend as broken. The demotion runs outside the admission
            // lock so its callbacks can reach scheduling state.
            {
                let _admission = self.admission.lock();
                self.load.decr();
            }
            self.monitor.set_state(HealthState::Offline);
            return SchedulerStatus::Unavailable;
        }

        SchedulerStatus::Success
    }
}
