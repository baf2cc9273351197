use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::hypervisor::VmHandle;

/// Per-VM idle bookkeeping, keyed by vmx path.
#[derive(Debug, Clone, Serialize)]
pub struct IdleState {
    pub vm: String,
    pub vmx: String,
    pub last_active_ts: Option<f64>,
    pub shutting_down: bool,
}

/// What a tick learned about one VM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// A remote session is active right now.
    Active,
    /// Inactive, but this is the first time we've seen the VM — it gets
    /// a grace period and can never be reclaimed on this tick.
    FirstIdle,
    /// Inactive with history; `since` is the last recorded activity.
    Idle { since: f64 },
}

/// Tracks last-activity timestamps for running VMs and ranks idle
/// candidates for reclamation.
///
/// The tracker itself is not synchronized — the watchdog owns it behind
/// a shared mutex and is the only writer.
#[derive(Debug, Default)]
pub struct IdleTracker {
    states: HashMap<String, IdleState>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one VM's activity verdict into the tracker.
    pub fn observe(&mut self, vm: &VmHandle, active: bool, now: f64) -> Observation {
        let key = vm.key();
        if active {
            self.states.insert(
                key,
                IdleState {
                    vm: vm.name().to_string(),
                    vmx: vm.key(),
                    last_active_ts: Some(now),
                    shutting_down: false,
                },
            );
            return Observation::Active;
        }

        if let Some(IdleState {
            last_active_ts: Some(since),
            ..
        }) = self.states.get(&key)
        {
            return Observation::Idle { since: *since };
        }

        self.states.insert(
            key,
            IdleState {
                vm: vm.name().to_string(),
                vmx: vm.key(),
                last_active_ts: Some(now),
                shutting_down: false,
            },
        );
        Observation::FirstIdle
    }

    /// Drop entries for VMs that left the running set. A VM that comes
    /// back later starts over with a fresh grace period.
    pub fn retain_running(&mut self, running: &HashSet<String>) {
        self.states.retain(|key, _| running.contains(key));
    }

    pub fn mark_shutting_down(&mut self, key: &str) {
        if let Some(state) = self.states.get_mut(key) {
            state.shutting_down = true;
        }
    }

    pub fn get(&self, key: &str) -> Option<&IdleState> {
        self.states.get(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Snapshot of all tracked states, for external inspection.
    pub fn snapshot(&self) -> Vec<IdleState> {
        let mut states: Vec<IdleState> = self.states.values().cloned().collect();
        states.sort_by(|a, b| a.vmx.cmp(&b.vmx));
        states
    }

    /// Rank reclamation victims from this tick's observations.
    ///
    /// Candidates are the eligible VMs only: idle with history, past the
    /// threshold, not already being shut down. An active or first-seen
    /// VM can never appear here. Oldest activity goes first; ties break
    /// on the lowercased vmx path for determinism.
    pub fn select_victims(
        &self,
        observations: &HashMap<String, Observation>,
        idle_threshold_secs: f64,
        now: f64,
        cap: usize,
    ) -> Vec<String> {
        let mut candidates: Vec<(f64, String)> = observations
            .iter()
            .filter_map(|(key, obs)| match obs {
                Observation::Idle { since } if now - since >= idle_threshold_secs => {
                    let state = self.states.get(key)?;
                    (!state.shutting_down).then(|| (*since, key.clone()))
                }
                _ => None,
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase()))
        });

        candidates
            .into_iter()
            .take(cap.max(1))
            .map(|(_, key)| key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(path: &str) -> VmHandle {
        VmHandle::from_vmx(path)
    }

    fn observe_all(
        tracker: &mut IdleTracker,
        vms: &[(&str, bool)],
        now: f64,
    ) -> HashMap<String, Observation> {
        vms.iter()
            .map(|(path, active)| {
                let handle = vm(path);
                let obs = tracker.observe(&handle, *active, now);
                (handle.key(), obs)
            })
            .collect()
    }

    #[test]
    fn test_first_observation_gets_grace_period() {
        let mut tracker = IdleTracker::new();
        let obs = observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 1000.0);

        assert_eq!(obs["/vms/a/a.vmx"], Observation::FirstIdle);
        // Even a zero threshold cannot reclaim a first-seen VM this tick
        let victims = tracker.select_victims(&obs, 0.0, 1000.0, 10);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_idle_past_threshold_is_selected_next_tick() {
        let mut tracker = IdleTracker::new();
        observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 1000.0);

        let obs = observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 1400.0);
        assert_eq!(
            obs["/vms/a/a.vmx"],
            Observation::Idle { since: 1000.0 }
        );
        let victims = tracker.select_victims(&obs, 300.0, 1400.0, 10);
        assert_eq!(victims, vec!["/vms/a/a.vmx"]);
    }

    #[test]
    fn test_active_vm_is_never_a_victim() {
        let mut tracker = IdleTracker::new();
        observe_all(
            &mut tracker,
            &[("/vms/a/a.vmx", false), ("/vms/b/b.vmx", false)],
            0.0,
        );
        let obs = observe_all(
            &mut tracker,
            &[("/vms/a/a.vmx", false), ("/vms/b/b.vmx", true)],
            10_000.0,
        );

        let victims = tracker.select_victims(&obs, 0.0, 10_000.0, 10);
        assert_eq!(victims, vec!["/vms/a/a.vmx"]);
    }

    #[test]
    fn test_activity_refreshes_timestamp_and_clears_flag() {
        let mut tracker = IdleTracker::new();
        observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 0.0);
        tracker.mark_shutting_down("/vms/a/a.vmx");
        assert!(tracker.get("/vms/a/a.vmx").unwrap().shutting_down);

        tracker.observe(&vm("/vms/a/a.vmx"), true, 500.0);
        let state = tracker.get("/vms/a/a.vmx").unwrap();
        assert_eq!(state.last_active_ts, Some(500.0));
        assert!(!state.shutting_down);
    }

    #[test]
    fn test_oldest_idle_first_with_lexical_tiebreak() {
        let mut tracker = IdleTracker::new();
        observe_all(&mut tracker, &[("/vms/b/b.vmx", false)], 100.0);
        observe_all(&mut tracker, &[("/vms/c/c.vmx", false)], 100.0);
        observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 200.0);

        let obs = observe_all(
            &mut tracker,
            &[
                ("/vms/a/a.vmx", false),
                ("/vms/b/b.vmx", false),
                ("/vms/c/c.vmx", false),
            ],
            10_000.0,
        );

        let victims = tracker.select_victims(&obs, 0.0, 10_000.0, 10);
        assert_eq!(
            victims,
            vec!["/vms/b/b.vmx", "/vms/c/c.vmx", "/vms/a/a.vmx"]
        );
    }

    #[test]
    fn test_cap_limits_victims() {
        let mut tracker = IdleTracker::new();
        for path in ["/vms/a/a.vmx", "/vms/b/b.vmx", "/vms/c/c.vmx"] {
            observe_all(&mut tracker, &[(path, false)], 0.0);
        }
        let obs = observe_all(
            &mut tracker,
            &[
                ("/vms/a/a.vmx", false),
                ("/vms/b/b.vmx", false),
                ("/vms/c/c.vmx", false),
            ],
            1000.0,
        );

        assert_eq!(tracker.select_victims(&obs, 0.0, 1000.0, 2).len(), 2);
        assert_eq!(tracker.select_victims(&obs, 0.0, 1000.0, 1).len(), 1);
        // A zero cap still allows one victim
        assert_eq!(tracker.select_victims(&obs, 0.0, 1000.0, 0).len(), 1);
    }

    #[test]
    fn test_shutting_down_vm_not_reselected() {
        let mut tracker = IdleTracker::new();
        observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 0.0);
        let obs = observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 1000.0);

        tracker.mark_shutting_down("/vms/a/a.vmx");
        let victims = tracker.select_victims(&obs, 0.0, 1000.0, 10);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_below_threshold_not_selected() {
        let mut tracker = IdleTracker::new();
        observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 0.0);
        let obs = observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 100.0);

        let victims = tracker.select_victims(&obs, 300.0, 100.0, 10);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_prune_resets_grace_on_reappearance() {
        let mut tracker = IdleTracker::new();
        observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 0.0);

        // VM leaves the running set
        tracker.retain_running(&HashSet::new());
        assert!(tracker.is_empty());

        // Reappears much later: first observation again, grace applies
        let obs = observe_all(&mut tracker, &[("/vms/a/a.vmx", false)], 99_999.0);
        assert_eq!(obs["/vms/a/a.vmx"], Observation::FirstIdle);
        assert!(tracker.select_victims(&obs, 0.0, 99_999.0, 10).is_empty());
    }
}
