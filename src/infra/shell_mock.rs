//! Test mock for `shell::run_host` and friends.
//!
//! Installs a thread-local handler that intercepts external commands
//! during tests. The handler receives the rendered command line
//! (`program arg1 arg2 ...`) and returns a canned response.

use std::cell::RefCell;
use std::process::{ExitStatus, Output};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
#[cfg(windows)]
use std::os::windows::process::ExitStatusExt;

/// Canned response for an intercepted command.
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn to_output(&self) -> Output {
        #[cfg(unix)]
        // Unix exit code encoding: status = code << 8
        let status = ExitStatus::from_raw(self.exit_code << 8);
        #[cfg(windows)]
        let status = ExitStatus::from_raw(self.exit_code as u32);
        Output {
            status,
            stdout: self.stdout.as_bytes().to_vec(),
            stderr: self.stderr.as_bytes().to_vec(),
        }
    }
}

type MockHandler = Box<dyn Fn(&str) -> MockResponse>;

thread_local! {
    static HANDLER: RefCell<Option<MockHandler>> = const { RefCell::new(None) };
}

/// Guard that clears the mock handler on drop.
pub struct MockGuard;

impl Drop for MockGuard {
    fn drop(&mut self) {
        HANDLER.with(|h| *h.borrow_mut() = None);
    }
}

/// Install a handler for the current thread. Tests on a current-thread
/// tokio runtime see every command the crate would have executed.
pub fn install<F>(handler: F) -> MockGuard
where
    F: Fn(&str) -> MockResponse + 'static,
{
    HANDLER.with(|h| *h.borrow_mut() = Some(Box::new(handler)));
    MockGuard
}

/// Try to intercept a command via the installed handler.
pub(crate) fn intercept(cmd: &str) -> Option<Output> {
    HANDLER.with(|h| h.borrow().as_ref().map(|f| f(cmd).to_output()))
}
