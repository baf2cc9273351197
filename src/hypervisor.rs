use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::config::{Settings, StopMode};
use crate::error::{Error, Result};
use crate::infra::shell;

/// A resolved VM: logical name plus the `.vmx` path vmrun addresses it by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VmHandle {
    name: String,
    vmx: PathBuf,
}

impl VmHandle {
    /// Build a handle from a vmx path, deriving the name from the
    /// enclosing directory (the Workstation convention).
    pub fn from_vmx(path: impl Into<PathBuf>) -> Self {
        let vmx = path.into();
        let name = vmx
            .parent()
            .and_then(|p| p.file_name())
            .or_else(|| vmx.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| vmx.to_string_lossy().into_owned());
        Self { name, vmx }
    }

    /// Resolve a logical name: explicit alias first, then a
    /// `vm_root/<name>/*.vmx` scan. Unknown names are a hard failure.
    pub fn resolve(settings: &Settings, name: &str) -> Result<Self> {
        if let Some(vmx) = settings.vm_aliases.get(name) {
            return Ok(Self {
                name: name.to_string(),
                vmx: vmx.clone(),
            });
        }

        let dir = settings.vm_root.join(name);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            let mut vmx_files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("vmx"))
                })
                .collect();
            vmx_files.sort();
            if let Some(vmx) = vmx_files.into_iter().next() {
                return Ok(Self {
                    name: name.to_string(),
                    vmx,
                });
            }
        }

        Err(Error::hard(format!("Unknown VM '{}'", name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vmx(&self) -> &Path {
        &self.vmx
    }

    /// Stable map key for idle tracking and activity maps.
    pub fn key(&self) -> String {
        self.vmx.to_string_lossy().into_owned()
    }
}

/// Typed adapter over the vmrun CLI. Every invocation carries a bounded
/// timeout; a non-zero exit surfaces as a transient error with stderr
/// attached, except where a stage demands a hard failure.
#[derive(Clone)]
pub struct Hypervisor {
    settings: Arc<Settings>,
}

impl Hypervisor {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run vmrun with the Workstation host type prefix.
    pub(crate) async fn vmrun(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let mut full: Vec<&str> = vec!["-T", "ws"];
        full.extend_from_slice(args);
        shell::run_host_checked(&self.settings.vmrun_path, &full, timeout).await
    }

    /// Currently running VMs. The first output line is a count header;
    /// the rest are vmx paths.
    pub async fn list_running(&self) -> Result<Vec<VmHandle>> {
        let raw = self.vmrun(&["list"], Duration::from_secs(10)).await?;
        Ok(raw
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| line.to_ascii_lowercase().ends_with(".vmx"))
            .map(VmHandle::from_vmx)
            .collect())
    }

    pub async fn is_running(&self, vm: &VmHandle) -> bool {
        match self.list_running().await {
            Ok(running) => running.iter().any(|r| r.vmx == vm.vmx),
            Err(_) => false,
        }
    }

    /// Revert to a named snapshot. Failure aborts the whole operation.
    pub async fn revert_snapshot(&self, vm: &VmHandle, snapshot: &str) -> Result<()> {
        let vmx = vm.key();
        self.vmrun(
            &["revertToSnapshot", &vmx, snapshot],
            Duration::from_secs(60),
        )
        .await
        .map_err(|e| {
            Error::hard(format!(
                "snapshot revert failed for '{}' → '{}': {}",
                vm.name(),
                snapshot,
                e
            ))
        })?;
        Ok(())
    }

    /// Snapshot names, header line skipped.
    pub async fn list_snapshots(&self, vm: &VmHandle) -> Result<Vec<String>> {
        let vmx = vm.key();
        let raw = self
            .vmrun(&["listSnapshots", &vmx], Duration::from_secs(30))
            .await?;
        Ok(raw
            .lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Fire-and-forget headless power-on. Spawn errors are logged and
    /// swallowed; readiness probing discovers the actual outcome.
    pub fn power_on_detached(&self, vm: &VmHandle) {
        let vmx = vm.key();
        let args = ["-T", "ws", "start", vmx.as_str(), "nogui"];
        if let Err(e) = shell::spawn_detached(&self.settings.vmrun_path, &args) {
            warn!(vm = %vm.name(), error = %e, "power-on spawn failed");
        }
    }

    /// Stop a VM. Soft stops go through the guest and get more time.
    pub async fn stop(&self, vm: &VmHandle, mode: StopMode) -> Result<()> {
        let vmx = vm.key();
        let timeout = match mode {
            StopMode::Soft => Duration::from_secs(60),
            StopMode::Hard => Duration::from_secs(30),
        };
        self.vmrun(&["stop", &vmx, mode.as_str()], timeout).await?;
        Ok(())
    }

    /// Raw guest address query; callers validate the dotted-quad shape.
    pub async fn guest_ip(&self, vm: &VmHandle) -> Result<String> {
        let vmx = vm.key();
        self.vmrun(&["getGuestIPAddress", &vmx], Duration::from_secs(10))
            .await
    }

    pub async fn tools_state(&self, vm: &VmHandle) -> Result<String> {
        let vmx = vm.key();
        self.vmrun(&["checkToolsState", &vmx], Duration::from_secs(10))
            .await
    }

    pub async fn tools_ready(&self, vm: &VmHandle) -> bool {
        match self.tools_state(vm).await {
            Ok(state) => state.to_ascii_lowercase().contains("running"),
            Err(_) => false,
        }
    }
}
