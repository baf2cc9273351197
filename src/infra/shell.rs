use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Run an external command on the host, capturing output, with a hard
/// deadline. The child is killed if the deadline passes.
pub async fn run_host(program: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
    #[cfg(test)]
    if let Some(output) = super::shell_mock::intercept(&render(program, args)) {
        return Ok(output);
    }

    let future = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(Error::transient(format!(
            "failed to run {}: {}",
            render(program, args),
            e
        ))),
        Err(_) => Err(Error::timeout(render(program, args), timeout)),
    }
}

/// Like [`run_host`], but requires a zero exit status and returns
/// trimmed stdout. Non-zero exit surfaces stderr as a transient error.
pub async fn run_host_checked(program: &Path, args: &[&str], timeout: Duration) -> Result<String> {
    let output = run_host(program, args, timeout).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(Error::transient(format!(
            "{} failed (exit {}): {}",
            render(program, args),
            output.status.code().unwrap_or(-1),
            detail
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Spawn a command detached from the caller: output discarded, exit
/// status unobserved. Used for fire-and-forget power-on.
pub fn spawn_detached(program: &Path, args: &[&str]) -> Result<()> {
    #[cfg(test)]
    if super::shell_mock::intercept(&render(program, args)).is_some() {
        return Ok(());
    }

    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|e| Error::transient(format!("failed to spawn {}: {}", render(program, args), e)))
}

fn render(program: &Path, args: &[&str]) -> String {
    format!("{} {}", program.display(), args.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::shell_mock::{self, MockResponse};
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_mock_intercepts_run_host() {
        let _guard = shell_mock::install(|cmd| {
            assert!(cmd.contains("list"));
            MockResponse::ok("Total running VMs: 0")
        });
        let out = run_host(&PathBuf::from("vmrun"), &["list"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "Total running VMs: 0");
    }

    #[tokio::test]
    async fn test_checked_surfaces_nonzero_exit() {
        let _guard = shell_mock::install(|_| MockResponse::fail(255, "Error: no such VM"));
        let err = run_host_checked(&PathBuf::from("vmrun"), &["list"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(format!("{}", err).contains("no such VM"));
    }

    #[tokio::test]
    async fn test_checked_trims_stdout() {
        let _guard = shell_mock::install(|_| MockResponse::ok("  192.168.1.10\n"));
        let out = run_host_checked(
            &PathBuf::from("vmrun"),
            &["getGuestIPAddress", "x.vmx"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out, "192.168.1.10");
    }
}
