//! Idle-reclamation watchdog.
//!
//! Every tick: enumerate running VMs, sample host pressure, bulk-scan
//! remote-session activity, fold the verdicts into the idle tracker,
//! stop the selected victims, publish a status snapshot. A failed tick
//! records its error and the loop keeps going — the watchdog never
//! dies with the host under it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::activity::ActivityDetector;
use crate::config::{IdlePolicy, ResourceThresholds};
use crate::hypervisor::{Hypervisor, VmHandle};
use crate::idle::{IdleState, IdleTracker, Observation};
use crate::pressure::{HostMetrics, PressureMonitor};
use crate::time;

/// Floor for the tick interval: a misconfigured interval must not turn
/// the watchdog into a busy loop.
const MIN_INTERVAL_SECS: u64 = 5;

/// Read-only tick summary published for external observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogStatus {
    pub last_tick_at: Option<f64>,
    pub vm_count: usize,
    pub pressure: bool,
    pub mem_pressure: bool,
    pub cpu_pressure: bool,
    pub cpu_over_ticks: u32,
    pub cpu_required_ticks: u32,
    pub available_mem_gb: Option<f64>,
    pub cpu_used_pct: Option<f64>,
    pub cpu_idle_pct: Option<f64>,
    pub stopped_count: usize,
    pub interval_sec: u64,
    pub last_error: Option<String>,
}

/// State the watchdog writes and request handlers read concurrently.
pub struct WatchdogShared {
    idle: Mutex<IdleTracker>,
    status: Mutex<WatchdogStatus>,
}

impl WatchdogShared {
    fn new() -> Self {
        Self {
            idle: Mutex::new(IdleTracker::new()),
            status: Mutex::new(WatchdogStatus::default()),
        }
    }

    pub async fn status(&self) -> WatchdogStatus {
        self.status.lock().await.clone()
    }

    pub async fn idle_states(&self) -> Vec<IdleState> {
        self.idle.lock().await.snapshot()
    }
}

/// The watchdog itself. Owns the pressure monitor (and its hysteresis
/// counter); everything readable from outside lives in [`WatchdogShared`].
pub struct Watchdog<M: HostMetrics> {
    hv: Hypervisor,
    detector: Arc<ActivityDetector>,
    monitor: PressureMonitor<M>,
    policy: IdlePolicy,
    shared: Arc<WatchdogShared>,
}

impl<M: HostMetrics> Watchdog<M> {
    pub fn new(hv: Hypervisor, detector: Arc<ActivityDetector>, metrics: M) -> Self {
        let policy = hv.settings().idle.clone();
        let thresholds: ResourceThresholds = hv.settings().resources.clone();
        Self {
            hv,
            detector,
            monitor: PressureMonitor::new(metrics, thresholds),
            policy,
            shared: Arc::new(WatchdogShared::new()),
        }
    }

    pub fn shared(&self) -> Arc<WatchdogShared> {
        Arc::clone(&self.shared)
    }

    /// Run forever on the configured interval.
    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.policy.check_interval_sec.max(MIN_INTERVAL_SECS));
        info!(
            interval_sec = interval.as_secs(),
            idle_minutes = self.policy.idle_minutes,
            mode = self.policy.mode.as_str(),
            only_on_pressure = self.policy.only_on_pressure,
            "watchdog started"
        );
        loop {
            self.tick(time::unix_now()).await;
            tokio::time::sleep(interval).await;
        }
    }

    /// One evaluate-and-act cycle. Takes the clock as a parameter so
    /// tests can simulate the passage of time.
    pub async fn tick(&mut self, now: f64) {
        let mut status = WatchdogStatus {
            last_tick_at: Some(now),
            interval_sec: self.policy.check_interval_sec,
            ..WatchdogStatus::default()
        };

        let running = match self.hv.list_running().await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(error = %e, "running-VM enumeration failed");
                status.last_error = Some(e.to_string());
                Vec::new()
            }
        };
        status.vm_count = running.len();

        let snapshot = self.monitor.sample();
        status.pressure = snapshot.pressure;
        status.mem_pressure = snapshot.mem_pressure;
        status.cpu_pressure = snapshot.cpu_pressure;
        status.cpu_over_ticks = snapshot.cpu_over_ticks;
        status.cpu_required_ticks = snapshot.cpu_required_ticks;
        status.available_mem_gb = Some(snapshot.available_mem_gb);
        status.cpu_used_pct = Some(snapshot.cpu_used_pct);
        status.cpu_idle_pct = Some((100.0 - snapshot.cpu_used_pct).max(0.0));

        let active_map = self.scan_activity(&running).await;

        let victims = {
            let mut tracker = self.shared.idle.lock().await;

            let running_keys: HashSet<String> = running.iter().map(VmHandle::key).collect();
            tracker.retain_running(&running_keys);

            let observations: HashMap<String, Observation> = running
                .iter()
                .map(|vm| {
                    let active = active_map.get(&vm.key()).copied().unwrap_or(false);
                    (vm.key(), tracker.observe(vm, active, now))
                })
                .collect();

            if self.policy.only_on_pressure && !snapshot.pressure {
                Vec::new()
            } else {
                // Under live pressure one reclamation per tick is
                // enough; over-correcting costs more than waiting.
                let cap = if snapshot.pressure {
                    1
                } else {
                    self.hv.settings().resources.max_shutdowns_per_tick
                };
                let selected = tracker.select_victims(
                    &observations,
                    self.policy.idle_threshold_secs(),
                    now,
                    cap,
                );
                for key in &selected {
                    tracker.mark_shutting_down(key);
                }
                selected
            }
        };

        for key in &victims {
            let Some(vm) = running.iter().find(|vm| &vm.key() == key) else {
                continue;
            };
            let reason = if snapshot.pressure { "idle+pressure" } else { "idle" };
            warn!(
                vm = %vm.name(),
                vmx = %key,
                reason,
                mem_avail_gb = snapshot.available_mem_gb,
                cpu_used_pct = snapshot.cpu_used_pct,
                "stopping idle VM"
            );
            if let Err(e) = self.hv.stop(vm, self.policy.mode).await {
                // The shutting_down flag stays set: the stop was attempted.
                warn!(vm = %vm.name(), error = %e, "stop command failed");
            }
        }
        status.stopped_count = victims.len();

        let tick_log = format!(
            "watchdog: vms={} mem_avail={:.2}GB cpu_used={:.1}% pressure={} (mem={} cpu={} ticks={}/{}) stopped={}",
            status.vm_count,
            snapshot.available_mem_gb,
            snapshot.cpu_used_pct,
            snapshot.pressure,
            snapshot.mem_pressure,
            snapshot.cpu_pressure,
            snapshot.cpu_over_ticks,
            snapshot.cpu_required_ticks,
            status.stopped_count,
        );
        if status.stopped_count > 0 || snapshot.pressure {
            warn!("{}", tick_log);
        } else {
            info!("{}", tick_log);
        }

        *self.shared.status.lock().await = status;
    }

    /// Fan the fast activity probe across the pool in bounded chunks.
    /// Results are joined before any tracker update, so a tick always
    /// decides on a complete activity snapshot. A probe error counts
    /// as inactive here — the full waterfall's fail-safe semantics are
    /// deliberately not inherited by the bulk path.
    async fn scan_activity(&self, running: &[VmHandle]) -> HashMap<String, bool> {
        let activity = &self.hv.settings().activity;
        let batch = activity.check_batch_size;
        let concurrency = activity.check_concurrency.max(1);

        let targets = if batch > 0 && running.len() > batch {
            &running[..batch]
        } else {
            running
        };
        if targets.len() < running.len() {
            debug!(
                probed = targets.len(),
                running = running.len(),
                "activity scan batch cap applied"
            );
        }

        let mut active_map = HashMap::new();
        for chunk in targets.chunks(concurrency) {
            let mut handles = Vec::with_capacity(chunk.len());
            for vm in chunk {
                let detector = Arc::clone(&self.detector);
                let vm = vm.clone();
                handles.push(tokio::spawn(async move {
                    let active = detector.is_active_fast(&vm).await;
                    (vm.key(), active)
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok((key, active)) => {
                        active_map.insert(key, active);
                    }
                    Err(e) => warn!(error = %e, "activity probe task panicked"),
                }
            }
        }
        active_map
    }
}
