//! In-guest command execution over the vmrun guest-ops channel.
//!
//! Everything here is best-effort: a failed guest command comes back as
//! [`Error::Transient`] and callers decide whether to fall through to
//! the next strategy. Nothing in this module aborts an operation.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, VmHandle};

/// Options for [`Hypervisor::run_in_guest`].
#[derive(Debug, Clone, Copy)]
pub struct GuestRunOpts<'a> {
    pub timeout: Duration,
    pub retries: u32,
    /// Guest exit codes accepted as success besides a clean vmrun exit.
    pub success_codes: &'a [i32],
}

impl Default for GuestRunOpts<'_> {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 3,
            success_codes: &[0],
        }
    }
}

/// Pull the guest program's exit code out of a vmrun error message.
fn guest_exit_code(message: &str) -> Option<i32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"exit code:\s*(-?\d+)").expect("static regex"));
    re.captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl Hypervisor {
    fn guest_auth(&self) -> [String; 4] {
        [
            "-gu".to_string(),
            self.settings().guest_user.clone(),
            "-gp".to_string(),
            self.settings().guest_pass.clone(),
        ]
    }

    /// Run a program inside the guest, retrying transient failures.
    ///
    /// A vmrun failure whose reported guest exit code is listed in
    /// `success_codes` counts as success immediately. Exhausted retries
    /// yield the last transient error.
    pub async fn run_in_guest(
        &self,
        vm: &VmHandle,
        program: &str,
        args: &[&str],
        opts: GuestRunOpts<'_>,
    ) -> Result<()> {
        let vmx = vm.key();
        let auth = self.guest_auth();
        let mut argv: Vec<&str> = auth.iter().map(String::as_str).collect();
        argv.extend(["runProgramInGuest", &vmx, program]);
        argv.extend_from_slice(args);

        let attempts = opts.retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.vmrun(&argv, opts.timeout).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if let Some(code) = guest_exit_code(&e.to_string())
                        && opts.success_codes.contains(&code)
                    {
                        return Ok(());
                    }
                    debug!(
                        vm = %vm.name(),
                        program,
                        attempt,
                        attempts,
                        error = %e,
                        "guest command failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::transient("guest command failed")))
    }

    /// Run a program inside the guest and capture its stdout.
    pub async fn run_in_guest_capture(
        &self,
        vm: &VmHandle,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String> {
        let vmx = vm.key();
        let auth = self.guest_auth();
        let mut argv: Vec<&str> = auth.iter().map(String::as_str).collect();
        argv.extend(["runProgramInGuest", &vmx, program]);
        argv.extend_from_slice(args);
        self.vmrun(&argv, timeout).await
    }

    /// Run a script through a guest-side interpreter and capture stdout.
    pub async fn run_script_in_guest(
        &self,
        vm: &VmHandle,
        interpreter: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<String> {
        let vmx = vm.key();
        let auth = self.guest_auth();
        let mut argv: Vec<&str> = auth.iter().map(String::as_str).collect();
        argv.extend(["runScriptInGuest", &vmx, interpreter, script]);
        self.vmrun(&argv, timeout).await
    }

    /// Guest process listing via the tools channel.
    pub async fn list_guest_processes(&self, vm: &VmHandle, timeout: Duration) -> Result<String> {
        let vmx = vm.key();
        let auth = self.guest_auth();
        let mut argv: Vec<&str> = auth.iter().map(String::as_str).collect();
        argv.extend(["listProcessesInGuest", &vmx]);
        self.vmrun(&argv, timeout).await
    }

    /// Copy a file out of the guest onto the host.
    pub async fn copy_from_guest(
        &self,
        vm: &VmHandle,
        guest_path: &str,
        host_path: &str,
    ) -> Result<()> {
        let vmx = vm.key();
        let auth = self.guest_auth();
        let mut argv: Vec<&str> = auth.iter().map(String::as_str).collect();
        argv.extend(["CopyFileFromGuestToHost", &vmx, guest_path, host_path]);
        self.vmrun(&argv, Duration::from_secs(30)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::infra::shell_mock::{self, MockResponse};
    use std::sync::{Arc, Mutex};

    fn test_hv() -> Hypervisor {
        Hypervisor::new(Arc::new(Settings::parse("").unwrap()))
    }

    fn vm() -> VmHandle {
        VmHandle::from_vmx("/vms/a/a.vmx")
    }

    #[test]
    fn test_guest_exit_code_extraction() {
        assert_eq!(
            guest_exit_code("Error: The program exited with a non-zero exit code: 1"),
            Some(1)
        );
        assert_eq!(guest_exit_code("vmrun failed, exit code: 255"), Some(255));
        assert_eq!(guest_exit_code("some other error"), None);
    }

    #[tokio::test]
    async fn test_run_in_guest_accepts_listed_exit_code() {
        let calls = Arc::new(Mutex::new(0u32));
        let calls2 = Arc::clone(&calls);
        let _guard = shell_mock::install(move |_| {
            *calls2.lock().unwrap() += 1;
            MockResponse::fail(255, "Error: program exited with exit code: 1")
        });

        let opts = GuestRunOpts {
            timeout: Duration::from_secs(5),
            retries: 3,
            success_codes: &[0, 1],
        };
        test_hv()
            .run_in_guest(&vm(), "ipconfig.exe", &["/release"], opts)
            .await
            .unwrap();
        // exit code 1 is accepted, so no retries happen
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_in_guest_exhausts_retries() {
        let calls = Arc::new(Mutex::new(0u32));
        let calls2 = Arc::clone(&calls);
        let _guard = shell_mock::install(move |_| {
            *calls2.lock().unwrap() += 1;
            MockResponse::fail(255, "Error: cannot connect to guest")
        });

        let opts = GuestRunOpts {
            timeout: Duration::from_secs(5),
            retries: 2,
            success_codes: &[0],
        };
        let err = test_hv()
            .run_in_guest(&vm(), "cmd.exe", &["/c", "dir"], opts)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_capture_passes_credentials() {
        let _guard = shell_mock::install(|cmd| {
            assert!(cmd.contains("-gu administrator"));
            assert!(cmd.contains("runProgramInGuest"));
            MockResponse::ok("YES")
        });
        let out = test_hv()
            .run_in_guest_capture(&vm(), "powershell.exe", &["-Command", "x"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "YES");
    }

    #[tokio::test]
    async fn test_copy_from_guest_failure_is_transient() {
        let _guard = shell_mock::install(|_| MockResponse::fail(255, "Error: file not found"));
        let err = test_hv()
            .copy_from_guest(&vm(), r"C:\Windows\Temp\out.txt", "/tmp/out.txt")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
