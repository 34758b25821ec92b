//! Bookkeeping of running workers and their faults.

use crate::error::{PipelineError, Result, WorkerFailure};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// What a wait on the tracker ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Watch {
    /// The awaited condition holds
    Done,
    /// At least one worker faulted
    Faulted,
}

#[derive(Debug)]
struct TrackerState {
    running: Vec<usize>,
    failures: Vec<WorkerFailure>,
}

/// Counts live workers per phase and collects the errors they exit with.
///
/// Every worker exit wakes all waiters, so a fault is seen right away; the
/// poll interval only bounds how long a wait sleeps between checks of
/// conditions nobody signals, such as channel occupancy.
#[derive(Debug)]
pub(crate) struct WorkerTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl WorkerTracker {
    pub(crate) fn new(distribution: &[usize]) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                running: distribution.to_vec(),
                failures: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Record that a worker of `phase` exited with `result`
    pub(crate) fn finish(&self, phase: usize, worker: &str, result: Result<u64>) {
        let mut state = self.state.lock();
        state.running[phase] = state.running[phase].saturating_sub(1);
        match result {
            Ok(items) => debug!(worker, items, "worker exited"),
            Err(error) => {
                error!(worker, %error, "worker faulted");
                state.failures.push(WorkerFailure {
                    worker: worker.to_string(),
                    error,
                });
            }
        }
        self.changed.notify_all();
    }

    pub(crate) fn has_failures(&self) -> bool {
        !self.state.lock().failures.is_empty()
    }

    /// Wait until every worker of `phase` has exited
    pub(crate) fn wait_phase(&self, phase: usize, poll: Duration) -> Watch {
        let mut state = self.state.lock();
        loop {
            if !state.failures.is_empty() {
                return Watch::Faulted;
            }
            if state.running[phase] == 0 {
                return Watch::Done;
            }
            self.changed.wait_for(&mut state, poll);
        }
    }

    /// Re-check `done` every `poll` until it holds or a worker faults
    pub(crate) fn wait_until(&self, poll: Duration, mut done: impl FnMut() -> bool) -> Watch {
        loop {
            if self.has_failures() {
                return Watch::Faulted;
            }
            if done() {
                return Watch::Done;
            }
            let mut state = self.state.lock();
            if state.failures.is_empty() {
                self.changed.wait_for(&mut state, poll);
            }
        }
    }

    /// The aggregate of every failure recorded so far
    pub(crate) fn aggregate(&self) -> PipelineError {
        let failures = std::mem::take(&mut self.state.lock().failures);
        PipelineError::RunFailed { failures }
    }
}
