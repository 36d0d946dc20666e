//! Worker liveness tracking keyed by self-reported IP.
//!
//! Callbacks are always invoked after the internal lock is released, so a
//! hook may call back into the tracker without deadlocking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// POSIX seconds as f64, the timestamp unit used on the wire.
pub fn current_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Default)]
pub struct LivenessTracker {
    last_seen: Mutex<HashMap<String, f64>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting of `ip`; `on_new` fires (outside the lock) only
    /// when the IP was not already tracked.
    pub fn add_ip(&self, ip: &str, on_new: impl FnOnce(&str)) {
        let was_new = {
            let mut map = self.lock();
            map.insert(ip.to_string(), current_time()).is_none()
        };
        if was_new {
            on_new(ip);
        }
    }

    /// Evict every IP not seen within `timeout_secs`, firing `on_evict`
    /// (outside the lock) once per evicted entry. Safe to call repeatedly;
    /// a second pass with no intervening sightings evicts nothing.
    pub fn cleanup(&self, timeout_secs: f64, mut on_evict: impl FnMut(&str)) {
        let cutoff = current_time() - timeout_secs;
        let evicted: Vec<String> = {
            let mut map = self.lock();
            let stale: Vec<String> = map
                .iter()
                .filter(|(_, seen)| **seen < cutoff)
                .map(|(ip, _)| ip.clone())
                .collect();
            for ip in &stale {
                map.remove(ip);
            }
            stale
        };
        for ip in &evicted {
            on_evict(ip);
        }
    }

    /// Snapshot of currently-tracked IPs.
    pub fn connected_ips(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.last_seen.lock().expect("liveness lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_ip_fires_connected_callback_once() {
        let tracker = LivenessTracker::new();
        let fired = AtomicUsize::new(0);

        tracker.add_ip("10.0.0.1", |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        tracker.add_ip("10.0.0.1", |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.connected_ips(), vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn cleanup_evicts_stale_entries_exactly_once() {
        let tracker = LivenessTracker::new();
        tracker.add_ip("10.0.0.1", |_| {});
        tracker.add_ip("10.0.0.2", |_| {});

        let mut evicted = Vec::new();
        // Anything is stale against a negative timeout.
        tracker.cleanup(-1.0, |ip| evicted.push(ip.to_string()));
        evicted.sort();
        assert_eq!(evicted, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(tracker.connected_ips().is_empty());

        // Second pass with no sightings: nothing left to evict.
        tracker.cleanup(-1.0, |_| panic!("nothing should be evicted twice"));
    }

    #[test]
    fn fresh_entries_survive_cleanup() {
        let tracker = LivenessTracker::new();
        tracker.add_ip("10.0.0.3", |_| {});
        tracker.cleanup(60.0, |_| panic!("fresh entry must not be evicted"));
        assert_eq!(tracker.connected_ips().len(), 1);
    }

    #[test]
    fn callbacks_may_reenter_the_tracker() {
        let tracker = LivenessTracker::new();
        tracker.add_ip("10.0.0.4", |_| {
            // A hook reading the tracker must not deadlock.
            assert_eq!(tracker.connected_ips().len(), 1);
        });
    }
}
