use std::collections::HashMap;
use std::sync::Mutex;

/// Operation duration history, keyed by `{vm}_{op}` style names.
///
/// The task runner records into this; the API layer reads averages to
/// estimate completion time. Durable storage is a host concern — this
/// crate only ships the in-memory implementation.
pub trait DurationStore: Send + Sync {
    fn record(&self, key: &str, secs: f64);
    fn average(&self, key: &str) -> Option<f64>;
}

/// Keeps a sliding window of the most recent samples per key.
pub struct MemoryDurationStore {
    samples: Mutex<HashMap<String, Vec<f64>>>,
    limit: usize,
}

impl MemoryDurationStore {
    pub fn new() -> Self {
        Self::with_limit(10)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }
}

impl Default for MemoryDurationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurationStore for MemoryDurationStore {
    fn record(&self, key: &str, secs: f64) {
        let mut map = self.samples.lock().expect("duration store poisoned");
        let entry = map.entry(key.to_string()).or_default();
        entry.push(secs);
        if entry.len() > self.limit {
            let drop = entry.len() - self.limit;
            entry.drain(..drop);
        }
    }

    fn average(&self, key: &str) -> Option<f64> {
        let map = self.samples.lock().expect("duration store poisoned");
        let entry = map.get(key)?;
        if entry.is_empty() {
            return None;
        }
        Some(entry.iter().sum::<f64>() / entry.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_of_recorded_samples() {
        let store = MemoryDurationStore::new();
        store.record("init_revert", 10.0);
        store.record("init_revert", 20.0);
        assert_eq!(store.average("init_revert"), Some(15.0));
    }

    #[test]
    fn test_unknown_key_has_no_average() {
        let store = MemoryDurationStore::new();
        assert_eq!(store.average("nope"), None);
    }

    #[test]
    fn test_window_drops_oldest() {
        let store = MemoryDurationStore::with_limit(3);
        for secs in [1.0, 2.0, 3.0, 4.0] {
            store.record("k", secs);
        }
        // 1.0 fell out of the window: (2 + 3 + 4) / 3
        assert_eq!(store.average("k"), Some(3.0));
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryDurationStore::new();
        store.record("init_connect_warm", 5.0);
        store.record("init_connect_cold", 50.0);
        assert_eq!(store.average("init_connect_warm"), Some(5.0));
        assert_eq!(store.average("init_connect_cold"), Some(50.0));
    }
}
