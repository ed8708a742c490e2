//! Per-role backend pools and their selection policies.

use crate::backend::BackendId;
use director_core::SchedulerStatus;
use std::fmt;
use std::str::FromStr;

/// How a pool walks its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Persistent cursor advancing across requests.
    RoundRobin,
    /// Storage order on every attempt. Behaves like round-robin restarted
    /// at index zero; the historical name is kept for config
    /// compatibility.
    Chance,
}

/// Error returned when parsing a [`PolicyKind`] from configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid scheduler value: {0:?}")]
pub struct InvalidPolicy(pub String);

impl FromStr for PolicyKind {
    type Err = InvalidPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rr" => Ok(PolicyKind::RoundRobin),
            "chance" => Ok(PolicyKind::Chance),
            other => Err(InvalidPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::RoundRobin => f.write_str("rr"),
            PolicyKind::Chance => f.write_str("chance"),
        }
    }
}

/// Ordered, non-owning set of backends for one role.
pub(crate) struct BackendPool {
    members: Vec<BackendId>,
    policy: PolicyKind,
    cursor: usize,
}

impl BackendPool {
    pub fn new(policy: PolicyKind) -> Self {
        Self {
            members: Vec::new(),
            policy,
            cursor: 0,
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    pub fn set_policy(&mut self, policy: PolicyKind) {
        self.policy = policy;
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[BackendId] {
        &self.members
    }

    pub fn push(&mut self, id: BackendId) {
        self.members.push(id);
    }

    pub fn remove(&mut self, id: BackendId) {
        self.members.retain(|m| *m != id);
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
    }

    /// The members in the order this attempt should try them.
    pub fn plan(&self) -> Vec<BackendId> {
        match self.policy {
            PolicyKind::Chance => self.members.clone(),
            PolicyKind::RoundRobin => {
                let len = self.members.len();
                if len == 0 {
                    return Vec::new();
                }
                let start = self.cursor % len;
                (0..len).map(|i| self.members[(start + i) % len]).collect()
            }
        }
    }

    /// Advances the round-robin cursor past the backend that accepted.
    pub fn note_success(&mut self, id: BackendId) {
        if self.policy != PolicyKind::RoundRobin {
            return;
        }
        if let Some(pos) = self.members.iter().position(|m| *m == id) {
            self.cursor = (pos + 1) % self.members.len();
        }
    }

    /// Folds per-backend outcomes into the pool-level status: the first
    /// Success wins; otherwise Unavailable only when every member was
    /// unavailable, Overloaded as soon as one eligible member was merely
    /// at capacity.
    pub fn aggregate(total: usize, unavailable: usize) -> SchedulerStatus {
        if total == unavailable {
            SchedulerStatus::Unavailable
        } else {
            SchedulerStatus::Overloaded
        }
    }
}
