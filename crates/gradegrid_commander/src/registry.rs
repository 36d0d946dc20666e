//! Assignment registry: who is pending, who finished, how many dispatches
//! each key has consumed, and when the whole run is over.
//!
//! Two locks, never nested: the assignment lock guards the three
//! collections; the completion lock guards the done flag and its waiters.
//! The assignment lock is always released before the completion lock is
//! taken.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Dispatches allowed per key before it is declared a permanent failure.
pub const RETRY_CAP: u8 = 3;

#[derive(Debug, Default)]
struct Assignments {
    not_assigned: BTreeSet<String>,
    finished: HashSet<String>,
    attempts: HashMap<String, u8>,
    total: usize,
}

impl Assignments {
    fn exhausted(&self) -> usize {
        self.attempts
            .iter()
            .filter(|(key, count)| **count >= RETRY_CAP && !self.finished.contains(*key))
            .count()
    }

    fn done(&self) -> bool {
        self.finished.len() + self.exhausted() >= self.total
    }
}

/// Point-in-time view of the registry, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryCounts {
    pub pending: usize,
    pub finished: usize,
    pub exhausted: usize,
    pub total: usize,
}

pub struct AssignmentRegistry {
    assignments: Mutex<Assignments>,
    complete: Mutex<bool>,
    complete_notify: Notify,
}

impl AssignmentRegistry {
    /// Build the registry fully populated, so the termination predicate is
    /// correct from the first evaluation.
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let not_assigned: BTreeSet<String> = keys.into_iter().collect();
        let attempts = not_assigned.iter().map(|key| (key.clone(), 0)).collect();
        let total = not_assigned.len();
        let assignments = Assignments {
            not_assigned,
            finished: HashSet::new(),
            attempts,
            total,
        };
        let complete = assignments.done();
        Self {
            assignments: Mutex::new(assignments),
            complete: Mutex::new(complete),
            complete_notify: Notify::new(),
        }
    }

    /// Take an arbitrary pending key (first in key order). A popped key
    /// that already consumed its retries yields `None` and stays removed:
    /// it is exhausted and must never be dispatched again.
    pub fn pop_next(&self) -> Option<String> {
        let mut state = self.lock_assignments();
        let key = state.not_assigned.pop_first()?;
        if state.attempts.get(&key).copied().unwrap_or(0) >= RETRY_CAP {
            return None;
        }
        Some(key)
    }

    /// Record one dispatch of `key`. Called right after [`Self::pop_next`].
    pub fn mark_assigned(&self, key: &str) {
        let mut state = self.lock_assignments();
        *state.attempts.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Deadline expired for a dispatched key. Re-queues and returns true
    /// only when the key has not finished in the meantime; a finished key
    /// is left alone so a late alarm can never undo its result.
    pub fn on_timeout(&self, key: &str) -> bool {
        let mut state = self.lock_assignments();
        if state.finished.contains(key) {
            return false;
        }
        state.not_assigned.insert(key.to_string());
        true
    }

    /// A result arrived for `key`. Idempotent.
    pub fn on_result(&self, key: &str) {
        {
            let mut state = self.lock_assignments();
            state.not_assigned.remove(key);
            state.finished.insert(key.to_string());
        }
        self.refresh_done();
    }

    /// The termination predicate: every key finished or retry-exhausted.
    /// Monotone; once true it stays true.
    pub fn done(&self) -> bool {
        self.lock_assignments().done()
    }

    /// Re-evaluate the predicate and wake waiters when it first holds.
    /// The assignment lock is released before the completion lock is taken.
    pub fn refresh_done(&self) {
        let done = self.lock_assignments().done();
        if !done {
            return;
        }
        let mut flag = self.complete.lock().expect("completion lock poisoned");
        if !*flag {
            *flag = true;
            self.complete_notify.notify_waiters();
        }
    }

    /// Resolve once the termination predicate holds.
    pub async fn wait_for_done(&self) {
        loop {
            if *self.complete.lock().expect("completion lock poisoned") {
                return;
            }
            let notified = self.complete_notify.notified();
            if *self.complete.lock().expect("completion lock poisoned") {
                return;
            }
            notified.await;
        }
    }

    pub fn counts(&self) -> RegistryCounts {
        let state = self.lock_assignments();
        RegistryCounts {
            pending: state.not_assigned.len(),
            finished: state.finished.len(),
            exhausted: state.exhausted(),
            total: state.total,
        }
    }

    pub fn attempts_for(&self, key: &str) -> u8 {
        self.lock_assignments()
            .attempts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn lock_assignments(&self) -> std::sync::MutexGuard<'_, Assignments> {
        self.assignments.lock().expect("assignment lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(keys: &[&str]) -> AssignmentRegistry {
        AssignmentRegistry::new(keys.iter().map(|k| k.to_string()))
    }

    #[test]
    fn happy_path_marks_done() {
        let reg = registry(&["alice"]);
        assert!(!reg.done());

        let key = reg.pop_next().unwrap();
        assert_eq!(key, "alice");
        reg.mark_assigned(&key);
        assert_eq!(reg.attempts_for("alice"), 1);
        assert!(!reg.done());

        reg.on_result("alice");
        assert!(reg.done());
        assert_eq!(
            reg.counts(),
            RegistryCounts {
                pending: 0,
                finished: 1,
                exhausted: 0,
                total: 1
            }
        );
    }

    #[test]
    fn retry_cap_exhausts_after_three_dispatches() {
        let reg = registry(&["bob"]);
        for attempt in 1..=RETRY_CAP {
            let key = reg.pop_next().expect("key should be dispatchable");
            reg.mark_assigned(&key);
            assert_eq!(reg.attempts_for("bob"), attempt);
            assert!(reg.on_timeout(&key), "unfinished key must re-queue");
        }
        // Third dispatch already counted the key as failed.
        assert!(reg.done());
        // The re-queued exhausted key pops as None and is gone for good.
        assert_eq!(reg.pop_next(), None);
        assert_eq!(reg.pop_next(), None);
        assert_eq!(reg.counts().exhausted, 1);
    }

    #[test]
    fn timeout_after_result_is_a_no_op() {
        let reg = registry(&["carol"]);
        let key = reg.pop_next().unwrap();
        reg.mark_assigned(&key);
        reg.on_result(&key);

        assert!(!reg.on_timeout(&key));
        assert_eq!(reg.counts().pending, 0);
        assert!(reg.done());
    }

    #[test]
    fn on_result_is_idempotent() {
        let reg = registry(&["dave", "erin"]);
        reg.on_result("dave");
        reg.on_result("dave");
        reg.on_result("dave");
        let counts = reg.counts();
        assert_eq!(counts.finished, 1);
        assert!(!reg.done());
    }

    #[test]
    fn done_is_monotone() {
        let reg = registry(&["fay"]);
        reg.on_result("fay");
        assert!(reg.done());
        // A stale timeout after completion must not regress the predicate.
        assert!(!reg.on_timeout("fay"));
        assert!(reg.done());
    }

    #[test]
    fn zero_assignments_is_done_from_the_start() {
        let reg = registry(&[]);
        assert!(reg.done());
        assert_eq!(reg.pop_next(), None);
    }

    #[test]
    fn accounting_invariant_holds_mid_flight() {
        let reg = registry(&["a", "b", "c"]);
        let key = reg.pop_next().unwrap();
        reg.mark_assigned(&key);

        let counts = reg.counts();
        let in_flight = 1;
        assert_eq!(
            counts.pending + in_flight + counts.finished + counts.exhausted,
            counts.total
        );
    }

    #[tokio::test]
    async fn wait_for_done_wakes_on_last_result() {
        use std::sync::Arc;
        let reg = Arc::new(registry(&["gil"]));
        let waiter = Arc::clone(&reg);
        let handle = tokio::spawn(async move { waiter.wait_for_done().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        reg.on_result("gil");
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
