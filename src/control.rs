use crate::gate::PauseGate;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    /// Destination table statements are being issued
    TablePrep,
    /// Every worker is up; the monitor watches the reader
    Running,
    /// Phases are being drained in order; holds the phase index (1-based)
    Draining(usize),
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Created => f.write_str("created"),
            RunState::TablePrep => f.write_str("table prep"),
            RunState::Running => f.write_str("running"),
            RunState::Draining(phase) => write!(f, "draining phase {}", phase),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    gate: Arc<PauseGate>,
    paused: Mutex<bool>,
    state: Mutex<RunState>,
}

/// Handle for pausing a run and watching its state from another thread.
///
/// The paused state lives here rather than being read back from the gate, so
/// toggling twice always lands where it started.
#[derive(Debug, Clone)]
pub struct PipelineControl {
    inner: Arc<Inner>,
}

impl PipelineControl {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Arc::new(PauseGate::new()),
                paused: Mutex::new(false),
                state: Mutex::new(RunState::Created),
            }),
        }
    }

    /// Flip between paused and running, returning whether the run is now paused
    pub fn toggle_pause(&self) -> bool {
        let mut paused = self.inner.paused.lock();
        *paused = !*paused;
        self.apply(*paused);
        *paused
    }

    /// Pause every worker at its next item; no-op when already paused
    pub fn pause(&self) {
        let mut paused = self.inner.paused.lock();
        *paused = true;
        self.apply(true);
    }

    /// Resume every parked worker; no-op when not paused
    pub fn resume(&self) {
        let mut paused = self.inner.paused.lock();
        *paused = false;
        self.apply(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.lock()
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.lock()
    }

    pub(crate) fn set_state(&self, state: RunState) {
        *self.inner.state.lock() = state;
    }

    pub(crate) fn gate(&self) -> Arc<PauseGate> {
        Arc::clone(&self.inner.gate)
    }

    fn apply(&self, paused: bool) {
        if paused {
            self.inner.gate.close();
        } else {
            self.inner.gate.open();
        }
    }
}
