//! Shared vocabulary for the director load balancer.
//!
//! This crate carries the types every other director crate speaks:
//! the scheduling status of an admission attempt, backend health states,
//! the client-abort policy, a small HTTP status newtype, load counters,
//! the request facade ([`HttpExchange`]) that decouples the scheduling
//! core from any particular HTTP server, and the event-listener system
//! used for observability callbacks.
//!
//! # Example
//!
//! ```rust
//! use director_core::{HealthState, SchedulerStatus};
//!
//! let state = HealthState::Undefined;
//! assert!(!state.is_online());
//! assert_eq!(SchedulerStatus::Overloaded.to_string(), "overloaded");
//! ```

pub mod counter;
pub mod events;
pub mod request;
pub mod testing;

pub use counter::Counter;
pub use events::{DirectorEvent, EventListener, EventListeners, FnListener};
pub use request::{CustomDataMap, HttpExchange, ResponseSnapshot};

use std::fmt;
use std::str::FromStr;

/// Result of a request scheduling attempt against a backend or a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Not scheduled: every backend is offline and/or disabled.
    Unavailable,
    /// Scheduled: a backend accepted the request.
    Success,
    /// Not scheduled: at least one backend was eligible but all were at capacity.
    Overloaded,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerStatus::Unavailable => "unavailable",
            SchedulerStatus::Success => "success",
            SchedulerStatus::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/// Health state of a backend, as maintained by its monitor.
///
/// `Undefined` is the initial state only; once a probe or a transport
/// failure has been observed the state moves between `Offline` and
/// `Online` and never returns to `Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Undefined,
    Offline,
    Online,
}

impl HealthState {
    pub fn is_online(self) -> bool {
        matches!(self, HealthState::Online)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Undefined => "undefined",
            HealthState::Offline => "offline",
            HealthState::Online => "online",
        };
        f.write_str(s)
    }
}

/// What to do with the upstream call when the client disconnects early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAbortAction {
    /// Continue the upstream call and discard its output.
    Ignore,
    /// Finish the request locally and tear down the upstream call.
    Close,
    /// Notify the upstream transport (e.g. FastCGI AbortRequest), then finish.
    Notify,
}

/// Error returned when parsing a [`ClientAbortAction`] from configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid on-client-abort value: {0:?}")]
pub struct InvalidClientAbortAction(pub String);

impl FromStr for ClientAbortAction {
    type Err = InvalidClientAbortAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(ClientAbortAction::Ignore),
            "close" => Ok(ClientAbortAction::Close),
            "notify" => Ok(ClientAbortAction::Notify),
            other => Err(InvalidClientAbortAction(other.to_string())),
        }
    }
}

impl fmt::Display for ClientAbortAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientAbortAction::Ignore => "ignore",
            ClientAbortAction::Close => "close",
            ClientAbortAction::Notify => "notify",
        };
        f.write_str(s)
    }
}

/// HTTP response status code.
///
/// A thin newtype; only the codes the scheduling core itself produces are
/// named. Anything else flows through untouched from the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpStatus(pub u16);

impl HttpStatus {
    pub const OK: HttpStatus = HttpStatus(200);
    pub const NOT_MODIFIED: HttpStatus = HttpStatus(304);
    pub const NOT_FOUND: HttpStatus = HttpStatus(404);
    pub const PRECONDITION_FAILED: HttpStatus = HttpStatus(412);
    pub const INTERNAL_SERVER_ERROR: HttpStatus = HttpStatus(500);
    pub const BAD_GATEWAY: HttpStatus = HttpStatus(502);
    pub const SERVICE_UNAVAILABLE: HttpStatus = HttpStatus(503);
    pub const GATEWAY_TIMEOUT: HttpStatus = HttpStatus(504);

    pub fn code(self) -> u16 {
        self.0
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
