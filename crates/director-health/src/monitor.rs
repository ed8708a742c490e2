//! The health monitor task.

use crate::{HealthProbe, ProbeMode};
use director_core::HealthState;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

type StateChangeFn = Arc<dyn Fn(HealthState, HealthState) + Send + Sync>;

struct MonitorShared {
    probe: Arc<dyn HealthProbe>,
    mode: Mutex<ProbeMode>,
    interval: Mutex<Duration>,
    probe_timeout: Duration,
    expect_code: u16,
    success_threshold: u32,
    state: Mutex<HealthState>,
    success_count: AtomicU32,
    fail_count: AtomicU64,
    traffic_seen: AtomicBool,
    on_state_change: Mutex<Option<StateChangeFn>>,
}

/// Monitors one backend with a periodic probe.
pub struct HealthMonitor {
    shared: Arc<MonitorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn builder<P: HealthProbe + 'static>(probe: P) -> HealthMonitorBuilder {
        HealthMonitorBuilder::new(Arc::new(probe))
    }

    pub fn state(&self) -> HealthState {
        *self.shared.state.lock()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn mode(&self) -> ProbeMode {
        *self.shared.mode.lock()
    }

    pub fn set_mode(&self, mode: ProbeMode) {
        *self.shared.mode.lock() = mode;
    }

    pub fn interval(&self) -> Duration {
        *self.shared.interval.lock()
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.shared.interval.lock() = interval;
    }

    pub fn fail_count(&self) -> u64 {
        self.shared.fail_count.load(Ordering::Relaxed)
    }

    /// Installs the callback invoked with (old, new) on every transition.
    pub fn set_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(HealthState, HealthState) + Send + Sync + 'static,
    {
        *self.shared.on_state_change.lock() = Some(Arc::new(callback));
    }

    /// Tells an `Opportunistic` monitor that live traffic has completed
    /// since the last probe.
    pub fn note_traffic(&self) {
        self.shared.traffic_seen.store(true, Ordering::Relaxed);
    }

    /// Forces a state, bypassing probe accounting. Used when a transport
    /// failure demotes a backend without waiting for the next probe.
    /// `Undefined` is not a forcible state and is ignored.
    pub fn set_state(&self, state: HealthState) {
        if state == HealthState::Undefined {
            debug_assert!(false, "cannot force state to Undefined");
            return;
        }
        if state == HealthState::Offline {
            self.shared.success_count.store(0, Ordering::Relaxed);
        }
        self.shared.transition(state);
    }

    /// Spawns the probe loop. Idempotent: a running loop is left alone.
    pub fn start(&self) {
        let mut slot = self.task.lock();
        if slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            loop {
                let interval = *shared.interval.lock();
                tokio::time::sleep(interval).await;

                if !shared.probe_due() {
                    continue;
                }

                let outcome =
                    tokio::time::timeout(shared.probe_timeout, shared.probe.probe()).await;

                match outcome {
                    Ok(Ok(code)) if code == shared.expect_code => shared.log_success(),
                    Ok(Ok(_code)) => {
                        #[cfg(feature = "tracing")]
                        debug!(code = _code, expected = shared.expect_code, "probe status mismatch");
                        shared.log_failure();
                    }
                    Ok(Err(_err)) => {
                        #[cfg(feature = "tracing")]
                        debug!(error = %_err, "probe failed");
                        shared.log_failure();
                    }
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        debug!("probe timed out");
                        shared.log_failure();
                    }
                }
            }
        }));
    }

    /// Stops the probe loop.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl MonitorShared {
    fn probe_due(&self) -> bool {
        let online = self.state.lock().is_online();
        match *self.mode.lock() {
            ProbeMode::Paranoid => true,
            ProbeMode::Opportunistic => !(online && self.traffic_seen.swap(false, Ordering::Relaxed)),
            ProbeMode::Lazy => !online,
        }
    }

    fn log_success(&self) {
        let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;

        #[cfg(feature = "metrics")]
        metrics::counter!("director_health_probes_total", "outcome" => "success").increment(1);

        if count >= self.success_threshold {
            self.transition(HealthState::Online);
        }
    }

    fn log_failure(&self) {
        self.fail_count.fetch_add(1, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("director_health_probes_total", "outcome" => "failure").increment(1);

        self.transition(HealthState::Offline);
    }

    fn transition(&self, new: HealthState) {
        let old = {
            let mut state = self.state.lock();
            if *state == new {
                return;
            }
            let old = *state;
            *state = new;
            old
        };

        #[cfg(feature = "tracing")]
        info!(from = %old, to = %new, "backend health changed");

        let callback = self.on_state_change.lock().clone();
        if let Some(callback) = callback {
            callback(old, new);
        }
    }
}

/// Builder for [`HealthMonitor`].
pub struct HealthMonitorBuilder {
    probe: Arc<dyn HealthProbe>,
    mode: ProbeMode,
    interval: Duration,
    probe_timeout: Duration,
    expect_code: u16,
    success_threshold: u32,
    on_state_change: Option<StateChangeFn>,
}

impl HealthMonitorBuilder {
    fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            probe,
            mode: ProbeMode::Paranoid,
            interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            expect_code: 200,
            success_threshold: 2,
            on_state_change: None,
        }
    }

    /// Probe scheduling mode. Default: `Paranoid`.
    pub fn mode(mut self, mode: ProbeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Delay between a probe completing and the next one starting.
    /// Default: 2s.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Upper bound on a single probe; exceeding it counts as a failure.
    /// Default: 5s.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Status code that counts as a healthy answer. Default: 200.
    pub fn expect_code(mut self, code: u16) -> Self {
        self.expect_code = code;
        self
    }

    /// Consecutive successes required to flip Offline to Online.
    /// Default: 2.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Callback invoked with (old, new) on every state transition.
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(HealthState, HealthState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> HealthMonitor {
        HealthMonitor {
            shared: Arc::new(MonitorShared {
                probe: self.probe,
                mode: Mutex::new(self.mode),
                interval: Mutex::new(self.interval),
                probe_timeout: self.probe_timeout,
                expect_code: self.expect_code,
                success_threshold: self.success_threshold,
                state: Mutex::new(HealthState::Undefined),
                success_count: AtomicU32::new(0),
                fail_count: AtomicU64::new(0),
                traffic_seen: AtomicBool::new(false),
                on_state_change: Mutex::new(self.on_state_change),
            }),
            task: Mutex::new(None),
        }
    }
}
