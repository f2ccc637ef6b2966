//! Shared progress and cancellation handle.
//!
//! A [`TaskControl`] sits between the controlling caller and the worker
//! threads of one pack or unpack run. Workers append per-entry results and
//! poll the stop flag; the caller reads snapshots and may request a stop at
//! any time. All fields live under a single mutex and every accessor
//! returns a copy, so readers never hold references into state that a
//! worker may resize concurrently.

use std::sync::Mutex;

use crate::error::{Result, ZipError};

/// Lifecycle of a pack or unpack run. Transitions are monotonic:
/// `NotStarted` → `Running` → `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    NotStarted,
    Running,
    Finished,
}

struct ControlState {
    state: TaskState,
    results: Vec<String>,
    successes: usize,
    failures: usize,
    total: usize,
    stopped: bool,
}

/// Thread-safe progress object shared by the orchestrator, its workers and
/// the caller.
pub struct TaskControl {
    inner: Mutex<ControlState>,
}

impl TaskControl {
    pub fn new() -> Self {
        TaskControl {
            inner: Mutex::new(ControlState {
                state: TaskState::NotStarted,
                results: Vec::new(),
                successes: 0,
                failures: 0,
                total: 0,
                stopped: false,
            }),
        }
    }

    /// Record how many entries the run will process. Only valid before the
    /// run starts.
    pub fn reserve(&self, num_entries: usize) -> Result<()> {
        let mut s = self.inner.lock().unwrap();
        if s.state != TaskState::NotStarted {
            return Err(ZipError::Misuse(
                "reserve called after the task has started".to_string(),
            ));
        }
        s.total = num_entries;
        s.results.reserve(num_entries);
        Ok(())
    }

    /// Advance the lifecycle. Going backwards is a contract violation.
    pub fn set_state(&self, new_state: TaskState) -> Result<()> {
        let mut s = self.inner.lock().unwrap();
        if new_state < s.state {
            return Err(ZipError::Misuse(format!(
                "task state may only move forward (was {:?}, requested {:?})",
                s.state, new_state
            )));
        }
        s.state = new_state;
        Ok(())
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    pub fn successes(&self) -> usize {
        self.inner.lock().unwrap().successes
    }

    pub fn failures(&self) -> usize {
        self.inner.lock().unwrap().failures
    }

    pub fn total(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    /// Number of entries with a recorded result so far.
    pub fn finished(&self) -> usize {
        self.inner.lock().unwrap().results.len()
    }

    /// Copy of the i-th result line, if one has been recorded.
    ///
    /// Returns a copy because the log may be appended to (and thus
    /// reallocated) concurrently.
    pub fn entry(&self, i: usize) -> Option<String> {
        self.inner.lock().unwrap().results.get(i).cloned()
    }

    pub fn add_success(&self, msg: impl Into<String>) {
        let mut s = self.inner.lock().unwrap();
        s.results.push(msg.into());
        s.successes += 1;
    }

    pub fn add_failure(&self, msg: impl Into<String>) {
        let mut s = self.inner.lock().unwrap();
        s.results.push(msg.into());
        s.failures += 1;
    }

    /// Request cancellation. Sticky: once set it stays set.
    pub fn stop(&self) {
        self.inner.lock().unwrap().stopped = true;
    }

    pub fn should_stop(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// Cancellation probe for worker inner loops.
    ///
    /// Workers call this between codec chunks; an `Err(Stopped)` unwinds the
    /// current entry, which the orchestrator records as a failure.
    pub fn check_stopped(&self) -> Result<()> {
        if self.should_stop() {
            Err(ZipError::Stopped)
        } else {
            Ok(())
        }
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_results() {
        let tc = TaskControl::new();
        tc.reserve(3).unwrap();
        tc.add_success("OK: a");
        tc.add_failure("FAIL: b");
        tc.add_success("OK: c");
        assert_eq!(tc.total(), 3);
        assert_eq!(tc.finished(), 3);
        assert_eq!(tc.successes(), 2);
        assert_eq!(tc.failures(), 1);
        assert_eq!(tc.entry(1).as_deref(), Some("FAIL: b"));
        assert_eq!(tc.entry(3), None);
    }

    #[test]
    fn reserve_after_start_is_misuse() {
        let tc = TaskControl::new();
        tc.set_state(TaskState::Running).unwrap();
        assert!(matches!(tc.reserve(1), Err(ZipError::Misuse(_))));
    }

    #[test]
    fn state_only_moves_forward() {
        let tc = TaskControl::new();
        tc.set_state(TaskState::Running).unwrap();
        tc.set_state(TaskState::Finished).unwrap();
        assert!(tc.set_state(TaskState::Running).is_err());
        assert_eq!(tc.state(), TaskState::Finished);
    }

    #[test]
    fn stop_is_sticky() {
        let tc = TaskControl::new();
        assert!(tc.check_stopped().is_ok());
        tc.stop();
        assert!(tc.should_stop());
        assert!(matches!(tc.check_stopped(), Err(ZipError::Stopped)));
        tc.stop();
        assert!(tc.should_stop());
    }
}
