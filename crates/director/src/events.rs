//! Events emitted by a cluster.

use crate::error::DropReason;
use director_core::{DirectorEvent, HealthState, HttpStatus};
use std::time::Instant;

/// Observability events of the scheduling core.
#[derive(Debug)]
pub enum ClusterEvent {
    /// A request was parked in a bucket queue.
    RequestQueued {
        cluster_name: String,
        bucket: String,
        depth: usize,
        timestamp: Instant,
    },
    /// A request was finished by the cluster with an error status.
    RequestDropped {
        cluster_name: String,
        reason: DropReason,
        status: HttpStatus,
        timestamp: Instant,
    },
    /// A backend's health state changed.
    BackendHealthChanged {
        cluster_name: String,
        backend: String,
        old: HealthState,
        new: HealthState,
        timestamp: Instant,
    },
    /// A backend was enabled or disabled.
    BackendEnabledChanged {
        cluster_name: String,
        backend: String,
        enabled: bool,
        timestamp: Instant,
    },
}

impl DirectorEvent for ClusterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ClusterEvent::RequestQueued { .. } => "request_queued",
            ClusterEvent::RequestDropped { .. } => "request_dropped",
            ClusterEvent::BackendHealthChanged { .. } => "backend_health_changed",
            ClusterEvent::BackendEnabledChanged { .. } => "backend_enabled_changed",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            ClusterEvent::RequestQueued { timestamp, .. }
            | ClusterEvent::RequestDropped { timestamp, .. }
            | ClusterEvent::BackendHealthChanged { timestamp, .. }
            | ClusterEvent::BackendEnabledChanged { timestamp, .. } => *timestamp,
        }
    }

    fn cluster_name(&self) -> &str {
        match self {
            ClusterEvent::RequestQueued { cluster_name, .. }
            | ClusterEvent::RequestDropped { cluster_name, .. }
            | ClusterEvent::BackendHealthChanged { cluster_name, .. }
            | ClusterEvent::BackendEnabledChanged { cluster_name, .. } => cluster_name,
        }
    }
}
