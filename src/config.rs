use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::Subnet;

/// Default vmrun location on a stock VMware Workstation install.
#[cfg(windows)]
pub const DEFAULT_VMRUN: &str = r"C:\Program Files (x86)\VMware\VMware Workstation\vmrun.exe";
#[cfg(not(windows))]
pub const DEFAULT_VMRUN: &str = "vmrun";

/// Top-level vmward configuration loaded from TOML.
///
/// Every field has a default so an empty file (or no file at all) yields
/// a working configuration. Guest credentials and tool paths can be
/// overridden from the environment, which takes precedence over the file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Path to the vmrun executable.
    #[serde(default = "default_vmrun_path")]
    pub vmrun_path: PathBuf,

    /// Root directory scanned for `<name>/<anything>.vmx` layouts.
    #[serde(default = "default_vm_root")]
    pub vm_root: PathBuf,

    /// Explicit name → vmx path aliases, checked before vm_root.
    #[serde(default)]
    pub vm_aliases: HashMap<String, PathBuf>,

    /// Account used for in-guest command execution.
    #[serde(default = "default_guest_user")]
    pub guest_user: String,

    #[serde(default)]
    pub guest_pass: String,

    /// Guest-side TCP port the remote desktop service listens on.
    #[serde(default = "default_rdp_port")]
    pub rdp_port: u16,

    /// IP poll cadence and overall deadline for readiness probing.
    #[serde(default = "default_ip_poll_interval_ms")]
    pub ip_poll_interval_ms: u64,
    #[serde(default = "default_ip_poll_timeout_secs")]
    pub ip_poll_timeout_secs: u64,

    /// Bounded wait for the RDP port after an IP is verified.
    #[serde(default = "default_rdp_ready_timeout_secs")]
    pub rdp_ready_timeout_secs: u64,

    /// Skip the guest-tools wait when the hypervisor UI is not attached;
    /// with no UI the tools channel can stay unready forever.
    #[serde(default)]
    pub skip_tools_wait_when_headless: bool,

    /// Subnets a verified guest IP should land in (and must not land in).
    #[serde(default = "default_preferred_subnets")]
    pub preferred_subnets: Vec<Subnet>,
    #[serde(default)]
    pub exclude_subnets: Vec<Subnet>,

    #[serde(default)]
    pub idle: IdlePolicy,

    #[serde(default)]
    pub resources: ResourceThresholds,

    #[serde(default)]
    pub activity: ActivityPolicy,
}

/// Watchdog policy: when an idle VM becomes reclaimable and how it is stopped.
#[derive(Debug, Clone, Deserialize)]
pub struct IdlePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minutes without remote activity before a VM is reclaim-eligible.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,

    /// Watchdog tick interval; the loop clamps this to at least 5s.
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,

    #[serde(default)]
    pub mode: StopMode,

    /// When true, idle VMs are reclaimed only while the host is under
    /// memory or CPU pressure. Idle tracking itself always runs.
    #[serde(default)]
    pub only_on_pressure: bool,
}

/// Host resource thresholds feeding the pressure monitor and victim cap.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceThresholds {
    #[serde(default = "default_min_available_mem_gb")]
    pub min_available_mem_gb: f64,

    #[serde(default = "default_max_shutdowns_per_tick")]
    pub max_shutdowns_per_tick: usize,

    #[serde(default = "default_cpu_pressure_threshold_pct")]
    pub cpu_pressure_threshold_pct: f64,

    /// Consecutive over-threshold ticks required before CPU pressure
    /// is declared. Memory pressure needs no such debounce.
    #[serde(default = "default_cpu_consecutive_ticks")]
    pub cpu_consecutive_ticks: u32,
}

/// Knobs for the remote-session activity detector.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityPolicy {
    /// Fail-safe: an inconclusive waterfall reports "active" so a VM
    /// that might be in use is never stopped.
    #[serde(default = "default_true")]
    pub assume_active_on_inconclusive: bool,

    /// Allow a host-side TCP connect to the RDP port as a last
    /// positive signal before falling back to the fail-safe.
    #[serde(default = "default_true")]
    pub tcp_probe_fallback: bool,

    /// Minimum spacing between opportunistic guest-tools restarts.
    #[serde(default = "default_tools_restart_cooldown_secs")]
    pub tools_restart_cooldown_secs: u64,

    /// Fan-out width for the watchdog's bulk activity scan.
    #[serde(default = "default_check_concurrency")]
    pub check_concurrency: usize,

    /// Max VMs probed per tick (0 = no cap). Bounds guest-channel load.
    #[serde(default)]
    pub check_batch_size: usize,
}

/// Shutdown flavor passed to `vmrun stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    #[default]
    Soft,
    Hard,
}

impl StopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopMode::Soft => "soft",
            StopMode::Hard => "hard",
        }
    }
}

fn default_vmrun_path() -> PathBuf {
    PathBuf::from(DEFAULT_VMRUN)
}
fn default_vm_root() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"C:\VMware")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/lib/vmware")
    }
}
fn default_guest_user() -> String {
    "administrator".to_string()
}
fn default_rdp_port() -> u16 {
    3389
}
fn default_ip_poll_interval_ms() -> u64 {
    200
}
fn default_ip_poll_timeout_secs() -> u64 {
    120
}
fn default_rdp_ready_timeout_secs() -> u64 {
    90
}
fn default_preferred_subnets() -> Vec<Subnet> {
    vec!["192.168.0.0/22".parse().expect("static subnet literal")]
}
fn default_true() -> bool {
    true
}
fn default_idle_minutes() -> u64 {
    5
}
fn default_check_interval_sec() -> u64 {
    60
}
fn default_min_available_mem_gb() -> f64 {
    6.0
}
fn default_max_shutdowns_per_tick() -> usize {
    2
}
fn default_cpu_pressure_threshold_pct() -> f64 {
    95.0
}
fn default_cpu_consecutive_ticks() -> u32 {
    3
}
fn default_tools_restart_cooldown_secs() -> u64 {
    600
}
fn default_check_concurrency() -> usize {
    4
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_minutes: default_idle_minutes(),
            check_interval_sec: default_check_interval_sec(),
            mode: StopMode::default(),
            only_on_pressure: false,
        }
    }
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            min_available_mem_gb: default_min_available_mem_gb(),
            max_shutdowns_per_tick: default_max_shutdowns_per_tick(),
            cpu_pressure_threshold_pct: default_cpu_pressure_threshold_pct(),
            cpu_consecutive_ticks: default_cpu_consecutive_ticks(),
        }
    }
}

impl Default for ActivityPolicy {
    fn default() -> Self {
        Self {
            assume_active_on_inconclusive: true,
            tcp_probe_fallback: true,
            tools_restart_cooldown_secs: default_tools_restart_cooldown_secs(),
            check_concurrency: default_check_concurrency(),
            check_batch_size: 0,
        }
    }
}

impl IdlePolicy {
    /// Idle threshold in seconds. `idle_minutes = 0` means a VM is
    /// eligible on its first post-grace tick.
    pub fn idle_threshold_secs(&self) -> f64 {
        (self.idle_minutes * 60) as f64
    }
}

impl Settings {
    /// Load settings: file (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::parse("")?,
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let settings: Self = toml::from_str(s).with_context(|| "Failed to parse config TOML")?;
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VMRUN_PATH")
            && !v.trim().is_empty()
        {
            self.vmrun_path = PathBuf::from(v.trim());
        }
        if let Ok(v) = std::env::var("VM_ROOT")
            && !v.trim().is_empty()
        {
            self.vm_root = PathBuf::from(v.trim());
        }
        if let Ok(v) = std::env::var("GUEST_USER")
            && !v.trim().is_empty()
        {
            self.guest_user = v.trim().to_string();
        }
        if let Ok(v) = std::env::var("GUEST_PASS")
            && !v.trim().is_empty()
        {
            self.guest_pass = v.trim().to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.resources.max_shutdowns_per_tick == 0 {
            anyhow::bail!("resources.max_shutdowns_per_tick must be at least 1");
        }
        if self.resources.cpu_pressure_threshold_pct <= 0.0
            || self.resources.cpu_pressure_threshold_pct > 100.0
        {
            anyhow::bail!("resources.cpu_pressure_threshold_pct must be in (0, 100]");
        }
        if self.activity.check_concurrency == 0 {
            anyhow::bail!("activity.check_concurrency must be at least 1");
        }
        Ok(())
    }
}
