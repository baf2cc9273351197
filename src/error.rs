use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for provisioning and watchdog operations.
///
/// The three variants carry different propagation rules:
/// - [`Error::Hard`] aborts the whole operation (bad VM name, missing
///   snapshot). Surfaced to the caller verbatim.
/// - [`Error::Timeout`] aborts the current stage and therefore the
///   operation (IP never acquired, RDP port never reachable).
/// - [`Error::Transient`] is a single failed CLI or guest command.
///   Callers log it at debug level and move to the next fallback; it
///   never fails an operation on its own.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Hard(String),

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("{0}")]
    Transient(String),
}

impl Error {
    pub fn hard(msg: impl Into<String>) -> Self {
        Error::Hard(msg.into())
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            secs: elapsed.as_secs(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
