use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use crate::config::ResourceThresholds;

/// Host resource readings. Behind a trait so tests can script samples.
pub trait HostMetrics: Send {
    fn available_mem_gb(&mut self) -> f64;
    fn cpu_used_pct(&mut self) -> f64;
}

/// Live readings via sysinfo. CPU usage is computed against the
/// previous refresh, so with the watchdog's ≥5s tick spacing each
/// sample reflects real utilization since the last tick.
pub struct SysinfoMetrics {
    sys: System,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::nothing().with_ram())
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage()),
        );
        Self { sys }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics for SysinfoMetrics {
    fn available_mem_gb(&mut self) -> f64 {
        self.sys
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
        self.sys.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    fn cpu_used_pct(&mut self) -> f64 {
        self.sys
            .refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
        self.sys.global_cpu_usage() as f64
    }
}

/// One tick's pressure evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PressureSnapshot {
    pub available_mem_gb: f64,
    pub cpu_used_pct: f64,
    pub cpu_over_ticks: u32,
    pub cpu_required_ticks: u32,
    pub mem_pressure: bool,
    pub cpu_pressure: bool,
    pub pressure: bool,
}

/// Samples host metrics and applies hysteresis to CPU readings.
///
/// Memory pressure is instantaneous — exhaustion is immediately
/// actionable. CPU pressure needs `cpu_consecutive_ticks` over-threshold
/// samples in a row; one sample below the threshold resets the counter.
pub struct PressureMonitor<M: HostMetrics> {
    metrics: M,
    thresholds: ResourceThresholds,
    cpu_over_ticks: u32,
}

impl<M: HostMetrics> PressureMonitor<M> {
    pub fn new(metrics: M, thresholds: ResourceThresholds) -> Self {
        Self {
            metrics,
            thresholds,
            cpu_over_ticks: 0,
        }
    }

    pub fn sample(&mut self) -> PressureSnapshot {
        let available_mem_gb = self.metrics.available_mem_gb();
        // Round to one decimal before comparing so a 94.95 reading at a
        // 95 threshold counts as over, matching what operators see in
        // the logs.
        let cpu_used_pct = (self.metrics.cpu_used_pct() * 10.0).round() / 10.0;

        let mem_pressure = available_mem_gb < self.thresholds.min_available_mem_gb;

        if cpu_used_pct >= self.thresholds.cpu_pressure_threshold_pct {
            self.cpu_over_ticks += 1;
        } else {
            self.cpu_over_ticks = 0;
        }
        let cpu_required_ticks = self.thresholds.cpu_consecutive_ticks.max(1);
        let cpu_pressure = self.cpu_over_ticks >= cpu_required_ticks;

        PressureSnapshot {
            available_mem_gb,
            cpu_used_pct,
            cpu_over_ticks: self.cpu_over_ticks,
            cpu_required_ticks,
            mem_pressure,
            cpu_pressure,
            pressure: mem_pressure || cpu_pressure,
        }
    }
}
