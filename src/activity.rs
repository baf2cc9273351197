//! Remote-session activity detection.
//!
//! A VM with someone connected over RDP must never be reclaimed, so the
//! detector is built as a waterfall of probes that stops at the first
//! conclusive verdict and resolves the leftover inconclusive case by
//! policy (fail-safe default: assume active).
//!
//! Two variants exist and serve different callers:
//! - [`ActivityDetector::is_active`] — full waterfall, used where a
//!   wrong "inactive" is expensive.
//! - [`ActivityDetector::is_active_fast`] — process heuristic plus a
//!   short TCP probe, used by the watchdog's bulk scan where per-VM
//!   latency matters more than recall.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ActivityPolicy;
use crate::guest::GuestRunOpts;
use crate::hypervisor::{Hypervisor, VmHandle};
use crate::net;

const POWERSHELL: &str = r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe";
const QUSER: &str = r"C:\Windows\System32\quser.exe";
const QUERY: &str = r"C:\Windows\System32\query.exe";
const QWINSTA: &str = r"C:\Windows\System32\qwinsta.exe";
const NETSTAT: &str = r"C:\Windows\System32\netstat.exe";
const CMD: &str = r"C:\Windows\System32\cmd.exe";

/// Guest-side scratch file the script probe writes its verdict into.
const GUEST_PROBE_FILE: &str = r"C:\Windows\Temp\vmward_rdp_check.txt";

/// Session-state spellings that count as "active" across guest locales.
const ACTIVE_KEYWORDS: &[&str] = &["active", "aktiv", "actif", "활성"];

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Active,
    Inactive,
    Inconclusive,
}

/// Waterfall detector for active RDP sessions inside a guest.
pub struct ActivityDetector {
    hv: Hypervisor,
    last_tools_restart: Mutex<HashMap<String, Instant>>,
}

impl ActivityDetector {
    pub fn new(hv: Hypervisor) -> Self {
        Self {
            hv,
            last_tools_restart: Mutex::new(HashMap::new()),
        }
    }

    fn policy(&self) -> &ActivityPolicy {
        &self.hv.settings().activity
    }

    fn rdp_port(&self) -> u16 {
        self.hv.settings().rdp_port
    }

    /// Full waterfall. Bounded latency: every probe has its own timeout.
    pub async fn is_active(&self, vm: &VmHandle) -> bool {
        // Tools gate: without a live tools channel none of the in-guest
        // probes can answer, so the whole waterfall is inconclusive.
        if !self.hv.tools_ready(vm).await {
            debug!(vm = %vm.name(), "tools not running, activity inconclusive");
            return self.resolve_inconclusive(vm).await;
        }

        match self.script_probe(vm).await {
            Verdict::Active => return true,
            Verdict::Inactive => return false,
            Verdict::Inconclusive => {}
        }
        match self.process_probe(vm).await {
            Verdict::Active => return true,
            Verdict::Inactive => return false,
            Verdict::Inconclusive => {}
        }
        match self.session_probe(vm).await {
            Verdict::Active => return true,
            Verdict::Inactive => return false,
            Verdict::Inconclusive => {}
        }
        match self.conn_table_probe(vm).await {
            Verdict::Active => return true,
            Verdict::Inactive => return false,
            Verdict::Inconclusive => {}
        }
        self.resolve_inconclusive(vm).await
    }

    /// Bulk-scan variant: the clipboard-redirector heuristic and a short
    /// host-side connect probe, both of which must agree. Cheap enough
    /// to run against the whole pool every tick; misses sessions the
    /// full waterfall would find, which the fail-safe tick cadence
    /// tolerates.
    pub async fn is_active_fast(&self, vm: &VmHandle) -> bool {
        let processes = match self.hv.list_guest_processes(vm, Duration::from_secs(10)).await {
            Ok(out) => out,
            Err(e) => {
                debug!(vm = %vm.name(), error = %e, "fast scan: process list failed");
                return false;
            }
        };
        if !processes.to_lowercase().contains("rdpclip") {
            return false;
        }

        let Ok(ip) = self.hv.guest_ip(vm).await else {
            return false;
        };
        if !net::looks_like_ipv4(&ip) {
            return false;
        }
        net::port_open(&ip, self.rdp_port(), Duration::from_secs(1)).await
    }

    /// Remote endpoints of established RDP connections, for diagnostics.
    pub async fn active_remote_ips(&self, vm: &VmHandle) -> Vec<String> {
        let Ok(out) = self
            .hv
            .run_in_guest_capture(vm, NETSTAT, &["-ano"], Duration::from_secs(20))
            .await
        else {
            return Vec::new();
        };
        let mut ips: Vec<String> = established_rdp_remotes(&out, self.rdp_port())
            .into_iter()
            .filter(|ip| ip != "0.0.0.0")
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// Usernames of active remote sessions, for diagnostics.
    pub async fn active_usernames(&self, vm: &VmHandle) -> Vec<String> {
        for (program, args) in [(QUSER, &[][..]), (QUERY, &["user"][..]), (QWINSTA, &[][..])] {
            if let Ok(out) = self
                .hv
                .run_in_guest_capture(vm, program, args, Duration::from_secs(15))
                .await
                && !out.trim().is_empty()
            {
                let mut users: Vec<String> = out
                    .lines()
                    .filter(|line| session_line_is_remote_active(line))
                    .filter_map(|line| line.split_whitespace().next())
                    .map(|user| user.trim_start_matches('>').to_string())
                    .collect();
                users.sort();
                users.dedup();
                return users;
            }
        }
        Vec::new()
    }

    /// In-guest script probe: PowerShell checks for an established
    /// connection on the RDP port and writes YES/NO to a guest file,
    /// which we copy back to the host. The file hop sidesteps vmrun's
    /// truncated/unreliable captured output for script invocations.
    async fn script_probe(&self, vm: &VmHandle) -> Verdict {
        let script = format!(
            "$c=(Get-NetTCPConnection -LocalPort {port} -State Established -ErrorAction SilentlyContinue); \
             $v = if ($c) {{ 'YES' }} else {{ 'NO' }}; \
             Set-Content -Path '{file}' -Value $v -Encoding ascii",
            port = self.rdp_port(),
            file = GUEST_PROBE_FILE,
        );
        if let Err(e) = self
            .hv
            .run_script_in_guest(vm, POWERSHELL, &script, Duration::from_secs(20))
            .await
        {
            debug!(vm = %vm.name(), error = %e, "script probe failed");
            return Verdict::Inconclusive;
        }

        let host_file = match tempfile::Builder::new()
            .prefix("vmward-rdp-")
            .suffix(".txt")
            .tempfile()
        {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "script probe: temp file failed");
                return Verdict::Inconclusive;
            }
        };
        let host_path = host_file.path().to_string_lossy().into_owned();
        if let Err(e) = self.hv.copy_from_guest(vm, GUEST_PROBE_FILE, &host_path).await {
            debug!(vm = %vm.name(), error = %e, "script probe: copy-back failed");
            return Verdict::Inconclusive;
        }

        match std::fs::read_to_string(host_file.path()) {
            Ok(content) if content.contains("YES") => Verdict::Active,
            Ok(content) if content.contains("NO") => Verdict::Inactive,
            _ => Verdict::Inconclusive,
        }
    }

    /// rdpclip.exe runs per active RDP session with clipboard
    /// redirection. Positive-only: its absence proves nothing.
    async fn process_probe(&self, vm: &VmHandle) -> Verdict {
        match self.hv.list_guest_processes(vm, Duration::from_secs(15)).await {
            Ok(out) if out.to_lowercase().contains("rdpclip") => Verdict::Active,
            Ok(_) => Verdict::Inconclusive,
            Err(e) => {
                debug!(vm = %vm.name(), error = %e, "process probe failed");
                Verdict::Inconclusive
            }
        }
    }

    /// Session listing: the first enumerator with output decides. Only
    /// remote sessions count — a logged-in console user must not keep
    /// the VM alive.
    async fn session_probe(&self, vm: &VmHandle) -> Verdict {
        for (program, args) in [(QUSER, &[][..]), (QUERY, &["user"][..]), (QWINSTA, &[][..])] {
            match self
                .hv
                .run_in_guest_capture(vm, program, args, Duration::from_secs(15))
                .await
            {
                Ok(out) if !out.trim().is_empty() => {
                    if out.lines().any(session_line_is_remote_active) {
                        return Verdict::Active;
                    }
                    return Verdict::Inactive;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(vm = %vm.name(), program, error = %e, "session probe failed");
                }
            }
        }
        Verdict::Inconclusive
    }

    /// Guest connection-table fallback.
    async fn conn_table_probe(&self, vm: &VmHandle) -> Verdict {
        match self
            .hv
            .run_in_guest_capture(vm, NETSTAT, &["-ano"], Duration::from_secs(20))
            .await
        {
            Ok(out) if !out.trim().is_empty() => {
                if established_rdp_remotes(&out, self.rdp_port()).is_empty() {
                    Verdict::Inactive
                } else {
                    Verdict::Active
                }
            }
            Ok(_) => Verdict::Inconclusive,
            Err(e) => {
                debug!(vm = %vm.name(), error = %e, "connection table probe failed");
                Verdict::Inconclusive
            }
        }
    }

    /// Policy resolution when every probe came back inconclusive.
    async fn resolve_inconclusive(&self, vm: &VmHandle) -> bool {
        let policy = self.policy();

        if policy.tcp_probe_fallback
            && let Ok(ip) = self.hv.guest_ip(vm).await
            && net::looks_like_ipv4(&ip)
            && net::port_open(&ip, self.rdp_port(), Duration::from_secs(2)).await
        {
            return true;
        }

        if policy.assume_active_on_inconclusive {
            self.maybe_restart_tools(vm).await;
            return true;
        }
        false
    }

    /// A dead tools channel keeps every future probe inconclusive, so
    /// kick the guest service — at most once per cooldown window per VM.
    async fn maybe_restart_tools(&self, vm: &VmHandle) {
        let cooldown = Duration::from_secs(self.policy().tools_restart_cooldown_secs);
        {
            let mut map = self.last_tools_restart.lock().await;
            let now = Instant::now();
            if let Some(last) = map.get(&vm.key())
                && now.duration_since(*last) < cooldown
            {
                return;
            }
            map.insert(vm.key(), now);
        }

        debug!(vm = %vm.name(), "restarting guest tools service");
        let opts = GuestRunOpts {
            timeout: Duration::from_secs(60),
            retries: 1,
            success_codes: &[0, 1, 2],
        };
        if let Err(e) = self
            .hv
            .run_in_guest(vm, CMD, &["/c", "net stop VMTools & net start VMTools"], opts)
            .await
        {
            debug!(vm = %vm.name(), error = %e, "tools restart failed");
        }
    }
}

/// Whether a session-listing line describes an *active remote* session.
/// Requires an `rdp-` session name (excludes the console) and an active
/// keyword in any supported locale spelling.
pub(crate) fn session_line_is_remote_active(line: &str) -> bool {
    let lower = line.to_lowercase();
    if !lower.contains("rdp-") {
        return false;
    }
    lower
        .split_whitespace()
        .any(|token| ACTIVE_KEYWORDS.contains(&token))
}

/// Remote addresses (port stripped) of established connections whose
/// local side is the RDP port.
pub(crate) fn established_rdp_remotes(netstat_out: &str, rdp_port: u16) -> Vec<String> {
    let local_suffix = format!(":{}", rdp_port);
    netstat_out
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let (local, remote, state) = (fields[1], fields[2], fields[3]);
            if !local.ends_with(&local_suffix) {
                return None;
            }
            if !state.eq_ignore_ascii_case("ESTABLISHED") {
                return None;
            }
            let remote_ip = remote.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(remote);
            Some(remote_ip.to_string())
        })
        .collect()
}
