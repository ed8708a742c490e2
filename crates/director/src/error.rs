//! Error types of the scheduling core.

use director_shaper::TokenShaperError;

/// Why a request was finished by the cluster instead of a backend.
///
/// Only terminal conditions produce a user-visible response; transport and
/// probe failures feed the retry loop instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Every pool reported Unavailable and enqueueing is disabled.
    AllBackendsUnavailable,
    /// The bucket queue is at its limit.
    QueueFull,
    /// The waiter exceeded the queue timeout.
    QueueTimeout,
    /// The request exceeded the retry budget.
    RetryExhausted,
    /// The cluster's master switch is off.
    ClusterDisabled,
    /// A pinned backend could not take the request.
    PinnedBackendUnavailable,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::AllBackendsUnavailable => "all-backends-unavailable",
            DropReason::QueueFull => "queue-full",
            DropReason::QueueTimeout => "queue-timeout",
            DropReason::RetryExhausted => "retry-exhausted",
            DropReason::ClusterDisabled => "cluster-disabled",
            DropReason::PinnedBackendUnavailable => "pinned-backend-unavailable",
        }
    }
}

/// Errors from backend administration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend name {0:?} already exists")]
    DuplicateName(String),
    #[error("no such backend")]
    NotFound,
    #[error("backend {0:?} is protected against termination")]
    TerminateProtected(String),
}

/// Errors from loading or saving the cluster configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("section [{section}] is missing key {key:?}")]
    MissingKey { section: String, key: String },
    #[error("section [{section}] key {key:?} has invalid value {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
    #[error("invalid configuration section [{0}]")]
    UnknownSection(String),
    #[error("could not create bucket {name:?}: {source}")]
    Bucket {
        name: String,
        source: TokenShaperError,
    },
    #[error("could not create backend {name:?}: {source}")]
    Backend {
        name: String,
        source: BackendError,
    },
    #[error("no storage path configured")]
    NoStoragePath,
}
