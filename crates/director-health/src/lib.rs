//! Active health monitoring for director backends.
//!
//! A [`HealthMonitor`] drives a periodic probe against one backend and
//! keeps a [`HealthState`](director_core::HealthState) with hysteresis: any
//! failed probe demotes the backend to `Offline` immediately, while
//! promotion back to `Online` requires `success_threshold` consecutive
//! successes. Every transition invokes the registered state-change
//! callback with the previous state.
//!
//! Probes never hold shaper tokens and never touch the request queue; they
//! run on their own tokio task, rescheduled `interval` after each probe
//! completes.
//!
//! # Example
//!
//! ```rust,no_run
//! use director_health::HealthMonitor;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let monitor = HealthMonitor::builder(|| async { Ok::<u16, director_health::ProbeError>(200) })
//!     .interval(Duration::from_secs(2))
//!     .success_threshold(2)
//!     .on_state_change(|old, new| {
//!         println!("health: {old} -> {new}");
//!     })
//!     .build();
//!
//! monitor.start();
//! # }
//! ```

mod monitor;
mod probe;

pub use monitor::{HealthMonitor, HealthMonitorBuilder};
pub use probe::{HealthProbe, ProbeError};

use std::fmt;
use std::str::FromStr;

/// When a probe is driven. Outcome interpretation is identical in every
/// mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Probe at every interval, unconditionally.
    Paranoid,
    /// Probe at every interval, but skip while the backend is online and
    /// live traffic has completed since the previous probe.
    Opportunistic,
    /// Probe only while the backend is not online; demotion comes from
    /// transport failures.
    Lazy,
}

/// Error returned when parsing a [`ProbeMode`] from configuration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid health-check-mode value: {0:?}")]
pub struct InvalidProbeMode(pub String);

impl FromStr for ProbeMode {
    type Err = InvalidProbeMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paranoid" => Ok(ProbeMode::Paranoid),
            "opportunistic" => Ok(ProbeMode::Opportunistic),
            "lazy" => Ok(ProbeMode::Lazy),
            other => Err(InvalidProbeMode(other.to_string())),
        }
    }
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeMode::Paranoid => "paranoid",
            ProbeMode::Opportunistic => "opportunistic",
            ProbeMode::Lazy => "lazy",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_mode_round_trip() {
        for s in ["paranoid", "opportunistic", "lazy"] {
            let mode: ProbeMode = s.parse().unwrap();
            assert_eq!(mode.to_string(), s);
        }
        assert!("eager".parse::<ProbeMode>().is_err());
    }
}
