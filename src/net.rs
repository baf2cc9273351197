use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::guest::GuestRunOpts;
use crate::hypervisor::{Hypervisor, VmHandle};
use crate::infra::shell;
use crate::progress::ProgressSink;

const IPCONFIG: &str = r"C:\Windows\System32\ipconfig.exe";

/// IPv4 CIDR block, e.g. `192.168.0.0/22`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Subnet {
    network: u32,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };
        (addr & mask) == (self.network & mask)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid subnet '{}': missing prefix", s))?;
        let network: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid subnet '{}': {}", s, e))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|e| format!("invalid subnet '{}': {}", s, e))?;
        if prefix > 32 {
            return Err(format!("invalid subnet '{}': prefix > 32", s));
        }
        Ok(Subnet {
            network: u32::from(network),
            prefix,
        })
    }
}

impl TryFrom<String> for Subnet {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Whether a string is a bare dotted-quad address. vmrun's
/// `getGuestIPAddress` can print `unknown` or diagnostic text instead
/// of an address; this is the gate readiness polling applies.
pub fn looks_like_ipv4(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").expect("static regex"));
    re.is_match(s)
}

/// Whether an acquired guest IP lands in a preferred subnet and outside
/// every excluded one. Unparseable addresses never qualify.
pub fn is_preferred_ip(ip: &str, preferred: &[Subnet], excluded: &[Subnet]) -> bool {
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return false;
    };
    if excluded.iter().any(|net| net.contains(addr)) {
        return false;
    }
    preferred.iter().any(|net| net.contains(addr))
}

/// Single bounded ICMP echo via the platform ping binary.
pub async fn ping_ok(host: &str) -> bool {
    let args: Vec<&str> = if cfg!(windows) {
        vec!["-n", "1", "-w", "600", host]
    } else {
        vec!["-c", "1", "-W", "1", host]
    };
    match shell::run_host(Path::new("ping"), &args, Duration::from_secs(2)).await {
        Ok(output) => {
            if cfg!(windows) {
                // Windows ping can exit 0 on "destination unreachable";
                // a TTL in the reply is the reliable success marker.
                String::from_utf8_lossy(&output.stdout).contains("TTL=")
            } else {
                output.status.success()
            }
        }
        Err(e) => {
            debug!(host, error = %e, "ping failed");
            false
        }
    }
}

/// Bounded TCP connect probe against `host:port`.
pub async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Renegotiate guest networking: release the address, renew the DHCP
/// lease, flush DNS. Each step is best-effort; a failed step is logged
/// and the sequence continues.
pub async fn renew_network(hv: &Hypervisor, vm: &VmHandle, progress: &dyn ProgressSink) {
    let steps: [(&str, &[&str]); 3] = [
        ("Releasing address", &["/release"]),
        ("Renewing DHCP lease", &["/renew"]),
        ("Flushing DNS cache", &["/flushdns"]),
    ];

    progress.report("Renegotiating network");
    for (title, args) in steps {
        progress.report(title);
        let opts = GuestRunOpts {
            timeout: Duration::from_secs(60),
            retries: 2,
            // ipconfig exits 1 on adapters with no lease to release
            success_codes: &[0, 1],
        };
        if let Err(e) = hv.run_in_guest(vm, IPCONFIG, args, opts).await {
            debug!(vm = %vm.name(), step = title, error = %e, "renegotiation step failed");
            progress.report(&format!("{} failed, continuing", title));
        }
    }
    progress.report("Network renegotiation finished");
}
