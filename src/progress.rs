use tracing::info;

/// Capability for reporting human-readable stage progress.
///
/// Provisioning stages report through this rather than logging directly
/// so the task runner can surface the same messages to polling clients.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Sink that forwards progress to the tracing subscriber.
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressSink for LogSink {
    fn report(&self, message: &str) {
        info!(vm = %self.label, "{}", message);
    }
}

/// Sink that discards progress.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _message: &str) {}
}
