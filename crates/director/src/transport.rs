//! The backend transport contract.
//!
//! The core never speaks HTTP or FastCGI itself. A [`BackendTransport`]
//! initiates upstream processing for an admitted request and reports
//! completion back through [`Cluster::release`] / [`Cluster::reject`]; a
//! [`TransportFactory`] builds the transport and health probe pair for a
//! backend from its wire-level coordinates.
//!
//! [`Cluster::release`]: crate::Cluster::release
//! [`Cluster::reject`]: crate::Cluster::reject

use crate::backend::BackendRole;
use director_core::{ClientAbortAction, HttpExchange};
use director_health::{HealthProbe, ProbeMode};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Upstream application protocol of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Fastcgi,
}

/// Error returned when parsing a [`Protocol`] from configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid protocol value: {0:?}")]
pub struct InvalidProtocol(pub String);

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "fastcgi" => Ok(Protocol::Fastcgi),
            other => Err(InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Fastcgi => f.write_str("fastcgi"),
        }
    }
}

/// Where a backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSpec {
    /// TCP endpoint.
    Inet { host: String, port: u16 },
    /// Unix domain socket.
    Local { path: PathBuf },
}

impl SocketSpec {
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        SocketSpec::Inet {
            host: host.into(),
            port,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        SocketSpec::Local { path: path.into() }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SocketSpec::Local { .. })
    }
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSpec::Inet { host, port } => write!(f, "{host}:{port}"),
            SocketSpec::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Strings the cluster hands to transports so they can synthesize health
/// probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPrototype {
    pub host_header: String,
    pub request_path: String,
    pub fcgi_script_filename: String,
}

impl Default for HealthCheckPrototype {
    fn default() -> Self {
        Self {
            host_header: "backend-healthcheck".to_string(),
            request_path: "/".to_string(),
            fcgi_script_filename: String::new(),
        }
    }
}

/// Everything needed to register one backend with a cluster.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub name: String,
    pub protocol: Protocol,
    pub socket: SocketSpec,
    pub capacity: usize,
    pub role: BackendRole,
    pub enabled: bool,
    pub health_interval: Duration,
    pub health_mode: ProbeMode,
}

impl BackendSpec {
    pub fn new(name: impl Into<String>, protocol: Protocol, socket: SocketSpec) -> Self {
        Self {
            name: name.into(),
            protocol,
            socket,
            capacity: 1,
            role: BackendRole::Active,
            enabled: true,
            health_interval: Duration::from_secs(2),
            health_mode: ProbeMode::Paranoid,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn role(mut self, role: BackendRole) -> Self {
        self.role = role;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn health_mode(mut self, mode: ProbeMode) -> Self {
        self.health_mode = mode;
        self
    }
}

/// One upstream connection endpoint, as seen by the scheduling core.
///
/// # Contract
///
/// - [`process`](Self::process) initiates upstream processing and must not
///   block. `true` means the request was accepted and further events are
///   asynchronous; `false` means immediate failure (the core rolls the
///   admission back and flips the backend offline).
/// - For every accepted request the transport calls exactly one of
///   `Cluster::release` (success) or `Cluster::reject` (failure).
/// - After the core invoked [`client_abort`](Self::client_abort) with
///   `Close` or `Notify`, the transport must not call `release`/`reject`
///   for that request anymore; the core has already finished it.
pub trait BackendTransport: Send + Sync {
    fn process(&self, exchange: &Arc<dyn HttpExchange>) -> bool;

    /// Tears down (or notifies) the upstream call for a client that went
    /// away. The default does nothing, which matches
    /// [`ClientAbortAction::Ignore`].
    fn client_abort(&self, exchange: &Arc<dyn HttpExchange>, action: ClientAbortAction) {
        let _ = (exchange, action);
    }
}

/// Builds the transport and health probe for a backend.
///
/// Keeps the wire code outside the core: configuration loading and the
/// admin API create backends through this seam.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        spec: &BackendSpec,
        health: &HealthCheckPrototype,
    ) -> (Arc<dyn BackendTransport>, Arc<dyn HealthProbe>);
}
