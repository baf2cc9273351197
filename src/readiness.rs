//! Drives a VM from "reverted or powered off" to "reachable over the
//! RDP port".
//!
//! Each stage measures elapsed time from its own start, never from the
//! start of the whole operation. Timeouts abort; individual command
//! failures are logged and the stage falls back or retries.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, VmHandle};
use crate::net;
use crate::progress::ProgressSink;

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Revert { snapshot: String },
    Connect,
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Revert { .. } => "revert",
            Operation::Connect => "connect",
        }
    }
}

/// Result of a successful provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub ip: String,
    /// Whether the VM was already powered on when the operation began.
    pub was_running: bool,
}

/// Readiness prober: snapshot precondition, power-on, tools wait, IP
/// acquisition with renegotiation retries, RDP port verification.
#[derive(Clone)]
pub struct ReadinessProber {
    hv: Hypervisor,
}

impl ReadinessProber {
    pub fn new(hv: Hypervisor) -> Self {
        Self { hv }
    }

    fn settings(&self) -> &Settings {
        self.hv.settings()
    }

    /// Run the full provisioning sequence for one VM.
    pub async fn provision(
        &self,
        vm: &VmHandle,
        op: &Operation,
        progress: &dyn ProgressSink,
    ) -> Result<ProvisionOutcome> {
        let s = self.settings();
        let rdp_port = s.rdp_port;

        if let Operation::Revert { snapshot } = op {
            progress.report("Checking snapshot");
            let snapshots = self
                .hv
                .list_snapshots(vm)
                .await
                .map_err(|e| Error::hard(format!("cannot list snapshots: {}", e)))?;
            if !snapshots.iter().any(|name| name == snapshot) {
                return Err(Error::hard(format!("Snapshot '{}' not found", snapshot)));
            }
            progress.report("Reverting snapshot");
            self.hv.revert_snapshot(vm, snapshot).await?;
        }

        let was_running = self.hv.is_running(vm).await;
        if !was_running {
            progress.report("Powering on");
            self.hv.power_on_detached(vm);
        }

        // With no hypervisor UI attached the tools channel may never
        // come up, so this wait is skippable and its timeout tolerated.
        if !s.skip_tools_wait_when_headless {
            progress.report("Waiting for guest tools");
            if let Err(e) = self.wait_for_tools(vm, Duration::from_secs(60)).await {
                debug!(vm = %vm.name(), error = %e, "tools wait gave up, continuing");
            } else {
                progress.report("Guest tools ready");
            }
        }

        progress.report("Acquiring IP");
        let candidate = self.fast_wait_for_ip(vm, progress).await?;
        if matches!(op, Operation::Revert { .. }) {
            // A restored snapshot usually carries a stale DHCP lease.
            progress.report(&format!("IP candidate {}, renegotiating", candidate));
            net::renew_network(&self.hv, vm, progress).await;
        }

        progress.report("Verifying IP");
        let mut ip = self.wait_for_vm_ready(vm, progress).await?;

        progress.report("Waiting for RDP");
        if !self.wait_for_rdp_ready(vm, &ip, progress).await {
            progress.report("RDP wait exceeded, renegotiating");
            net::renew_network(&self.hv, vm, progress).await;
            progress.report("Waiting for RDP again");
            self.wait_for_rdp_ready(vm, &ip, progress).await;
        }

        // Final sanity connect; one more renegotiate-and-repoll cycle
        // before declaring the port unreachable.
        if !net::port_open(&ip, rdp_port, Duration::from_secs(3)).await {
            progress.report("RDP port closed, renegotiating");
            net::renew_network(&self.hv, vm, progress).await;
            ip = self.wait_for_vm_ready(vm, progress).await?;
            if !net::port_open(&ip, rdp_port, Duration::from_secs(3)).await {
                return Err(Error::timeout(
                    format!("RDP port {} on {}", rdp_port, ip),
                    Duration::from_secs(s.rdp_ready_timeout_secs),
                ));
            }
        }

        if *op == Operation::Connect
            && !net::is_preferred_ip(&ip, &s.preferred_subnets, &s.exclude_subnets)
        {
            progress.report(&format!("Unexpected IP {}, renegotiating", ip));
            net::renew_network(&self.hv, vm, progress).await;
            ip = self.wait_for_vm_ready(vm, progress).await?;
        }

        progress.report("Ready");
        Ok(ProvisionOutcome { ip, was_running })
    }

    /// Poll until the guest tools channel reports running.
    async fn wait_for_tools(&self, vm: &VmHandle, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.hv.tools_ready(vm).await {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(Error::timeout("guest tools", timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// First IP pass: accept any dotted-quad, no reachability check.
    async fn fast_wait_for_ip(&self, vm: &VmHandle, progress: &dyn ProgressSink) -> Result<String> {
        let s = self.settings();
        let timeout = Duration::from_secs(s.ip_poll_timeout_secs);
        let interval = Duration::from_millis(s.ip_poll_interval_ms);
        let start = Instant::now();
        let mut last_reported = String::new();

        loop {
            if start.elapsed() > timeout {
                return Err(Error::timeout("guest IP acquisition", timeout));
            }
            match self.hv.guest_ip(vm).await {
                Ok(raw) if net::looks_like_ipv4(&raw) => {
                    if raw != last_reported {
                        progress.report(&format!("IP found: {}", raw));
                        last_reported = raw.clone();
                    }
                    return Ok(raw);
                }
                Ok(_) => {}
                Err(e) => debug!(vm = %vm.name(), error = %e, "IP query failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Verified IP pass: the address must answer a ping. A failed ping
    /// triggers one renegotiation sequence, then polling resumes.
    async fn wait_for_vm_ready(&self, vm: &VmHandle, progress: &dyn ProgressSink) -> Result<String> {
        let s = self.settings();
        let timeout = Duration::from_secs(s.ip_poll_timeout_secs);
        let interval = Duration::from_millis(s.ip_poll_interval_ms);
        let start = Instant::now();
        let mut last_reported = String::new();

        loop {
            if start.elapsed() > timeout {
                return Err(Error::timeout("verified guest IP", timeout));
            }
            match self.hv.guest_ip(vm).await {
                Ok(raw) if net::looks_like_ipv4(&raw) => {
                    if raw != last_reported {
                        progress.report(&format!("Checking IP: {}", raw));
                        last_reported = raw.clone();
                    }
                    if net::ping_ok(&raw).await {
                        progress.report("IP verified");
                        return Ok(raw);
                    }
                    progress.report("No ping reply, renegotiating");
                    net::renew_network(&self.hv, vm, progress).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => debug!(vm = %vm.name(), error = %e, "IP query failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Bounded wait for the RDP port. Re-triggers power-on if the VM is
    /// found off mid-wait. Returns false on window expiry — the caller
    /// decides whether to renegotiate and retry.
    async fn wait_for_rdp_ready(
        &self,
        vm: &VmHandle,
        ip: &str,
        progress: &dyn ProgressSink,
    ) -> bool {
        let timeout = Duration::from_secs(self.settings().rdp_ready_timeout_secs);
        let rdp_port = self.settings().rdp_port;
        let start = Instant::now();

        loop {
            if net::port_open(ip, rdp_port, Duration::from_secs(2)).await {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            if !self.hv.is_running(vm).await {
                progress.report("VM powered off mid-wait, powering on again");
                self.hv.power_on_detached(vm);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::infra::shell_mock::{self, MockResponse};
    use crate::progress::test_support::RecordingSink;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn vm() -> VmHandle {
        VmHandle::from_vmx("/vms/init/init.vmx")
    }

    fn prober(toml: &str) -> ReadinessProber {
        ReadinessProber::new(Hypervisor::new(Arc::new(Settings::parse(toml).unwrap())))
    }

    async fn rdp_listener() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        port
    }

    fn base_config(port: u16) -> String {
        format!(
            "rdp_port = {}\n\
             ip_poll_timeout_secs = 5\n\
             ip_poll_interval_ms = 10\n\
             rdp_ready_timeout_secs = 2\n\
             preferred_subnets = [\"127.0.0.0/8\"]\n",
            port
        )
    }

    #[tokio::test]
    async fn test_connect_success_returns_verified_ip() {
        let port = rdp_listener().await;
        let p = prober(&base_config(port));

        let _guard = shell_mock::install(|cmd| {
            if cmd.ends_with("list") {
                return MockResponse::ok("Total running VMs: 1\n/vms/init/init.vmx\n");
            }
            if cmd.contains("checkToolsState") {
                return MockResponse::ok("running");
            }
            if cmd.contains("getGuestIPAddress") {
                return MockResponse::ok("127.0.0.1");
            }
            if cmd.contains("ping") {
                return MockResponse::ok("reply");
            }
            MockResponse::empty()
        });

        let sink = RecordingSink::new();
        let outcome = p.provision(&vm(), &Operation::Connect, &sink).await.unwrap();
        assert_eq!(outcome.ip, "127.0.0.1");
        assert!(outcome.was_running);
        let messages = sink.collected();
        assert!(messages.iter().any(|m| m == "Ready"));
    }

    #[tokio::test]
    async fn test_revert_missing_snapshot_is_hard_failure() {
        let p = prober("");
        let _guard = shell_mock::install(|cmd| {
            if cmd.contains("listSnapshots") {
                return MockResponse::ok("Total snapshots: 1\nbase\n");
            }
            panic!("revert must abort before any other command: {}", cmd);
        });

        let err = p
            .provision(
                &vm(),
                &Operation::Revert {
                    snapshot: "missing".to_string(),
                },
                &crate::progress::NullSink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Hard(_)));
        assert!(format!("{}", err).contains("missing"));
    }

    #[tokio::test]
    async fn test_revert_full_flow_renegotiates_after_fast_ip() {
        let port = rdp_listener().await;
        let p = prober(&base_config(port));

        let renew_steps = Arc::new(Mutex::new(0u32));
        let renew2 = Arc::clone(&renew_steps);
        let _guard = shell_mock::install(move |cmd| {
            if cmd.contains("listSnapshots") {
                return MockResponse::ok("Total snapshots: 1\nbase\n");
            }
            if cmd.contains("revertToSnapshot") {
                return MockResponse::empty();
            }
            if cmd.ends_with("list") {
                return MockResponse::ok("Total running VMs: 1\n/vms/init/init.vmx\n");
            }
            if cmd.contains("checkToolsState") {
                return MockResponse::ok("running");
            }
            if cmd.contains("getGuestIPAddress") {
                return MockResponse::ok("127.0.0.1");
            }
            if cmd.contains("ipconfig.exe") {
                *renew2.lock().unwrap() += 1;
                return MockResponse::empty();
            }
            if cmd.contains("ping") {
                return MockResponse::ok("reply");
            }
            MockResponse::empty()
        });

        let sink = RecordingSink::new();
        let outcome = p
            .provision(
                &vm(),
                &Operation::Revert {
                    snapshot: "base".to_string(),
                },
                &sink,
            )
            .await
            .unwrap();
        assert_eq!(outcome.ip, "127.0.0.1");
        // The post-snapshot renegotiation ran exactly once: three steps
        assert_eq!(*renew_steps.lock().unwrap(), 3);
        assert!(sink.collected().iter().any(|m| m == "Reverting snapshot"));
    }

    #[tokio::test]
    async fn test_failed_ping_triggers_single_renegotiation() {
        let port = rdp_listener().await;
        let p = prober(&base_config(port));

        let pings = Arc::new(Mutex::new(0u32));
        let renew_steps = Arc::new(Mutex::new(0u32));
        let pings2 = Arc::clone(&pings);
        let renew2 = Arc::clone(&renew_steps);
        let _guard = shell_mock::install(move |cmd| {
            if cmd.contains("getGuestIPAddress") {
                return MockResponse::ok("127.0.0.1");
            }
            if cmd.contains("ipconfig.exe") {
                *renew2.lock().unwrap() += 1;
                return MockResponse::empty();
            }
            if cmd.contains("ping") {
                let mut count = pings2.lock().unwrap();
                *count += 1;
                if *count == 1 {
                    return MockResponse::fail(1, "");
                }
                return MockResponse::ok("reply");
            }
            MockResponse::empty()
        });

        let sink = RecordingSink::new();
        let ip = p.wait_for_vm_ready(&vm(), &sink).await.unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(*pings.lock().unwrap(), 2);
        // Exactly one renegotiation sequence (release, renew, flush)
        assert_eq!(*renew_steps.lock().unwrap(), 3);
        assert!(
            sink.collected()
                .iter()
                .any(|m| m == "No ping reply, renegotiating")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_acquisition_timeout() {
        let p = prober("ip_poll_timeout_secs = 1\nip_poll_interval_ms = 100\n");
        let _guard = shell_mock::install(|cmd| {
            if cmd.contains("getGuestIPAddress") {
                return MockResponse::ok("unknown");
            }
            MockResponse::empty()
        });

        let err = p
            .fast_wait_for_ip(&vm(), &crate::progress::NullSink)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(format!("{}", err).contains("guest IP acquisition"));
    }

    #[tokio::test]
    async fn test_rdp_wait_repowers_when_vm_found_off() {
        let p = prober(
            "rdp_port = 1\n\
             rdp_ready_timeout_secs = 1\n\
             ip_poll_timeout_secs = 1\n\
             ip_poll_interval_ms = 10\n",
        );

        let power_ons = Arc::new(Mutex::new(0u32));
        let power2 = Arc::clone(&power_ons);
        let _guard = shell_mock::install(move |cmd| {
            if cmd.ends_with("list") {
                // VM not in the running list
                return MockResponse::ok("Total running VMs: 0\n");
            }
            if cmd.contains("start") && cmd.contains("nogui") {
                *power2.lock().unwrap() += 1;
                return MockResponse::empty();
            }
            MockResponse::empty()
        });

        let sink = RecordingSink::new();
        // Port 1 never answers, so the wait expires after re-powering
        let ready = p.wait_for_rdp_ready(&vm(), "127.0.0.1", &sink).await;
        assert!(!ready);
        assert!(*power_ons.lock().unwrap() >= 1);
    }
}
