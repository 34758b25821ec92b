use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative pause gate consulted by every worker before each item.
///
/// While the gate is open a check is two atomic loads. Closing it makes
/// workers park on a condition variable; opening it wakes all of them.
/// Aborting opens the gate for good and tells waiters to stop.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
    aborted: AtomicBool,
    lock: Mutex<()>,
    opened: Condvar,
}

impl PauseGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while the gate is closed.
    ///
    /// Returns `false` if the run was aborted, in which case the caller must
    /// stop without touching any more items.
    pub fn wait(&self) -> bool {
        if self.paused.load(Ordering::Acquire) {
            let mut guard = self.lock.lock();
            // flags only flip back under the lock, so a wake-up cannot be missed
            while self.paused.load(Ordering::Acquire) && !self.aborted.load(Ordering::Acquire) {
                self.opened.wait(&mut guard);
            }
        }
        !self.aborted.load(Ordering::Acquire)
    }

    /// Close the gate; workers park at their next check
    pub fn close(&self) {
        let _guard = self.lock.lock();
        self.paused.store(true, Ordering::Release);
    }

    /// Open the gate and wake every parked worker
    pub fn open(&self) {
        let _guard = self.lock.lock();
        self.paused.store(false, Ordering::Release);
        self.opened.notify_all();
    }

    /// Abort the run: wake every parked worker and make all future waits fail
    pub fn abort(&self) {
        let _guard = self.lock.lock();
        self.aborted.store(true, Ordering::Release);
        self.opened.notify_all();
    }

    /// Whether the gate is currently closed
    pub fn is_closed(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether the run was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_open_gate_passes() {
        let gate = PauseGate::new();
        assert!(gate.wait());
        assert!(!gate.is_closed());
    }

    #[test]
    fn test_closed_gate_parks_until_opened() {
        let gate = Arc::new(PauseGate::new());
        gate.close();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        gate.open();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_abort_releases_parked_workers() {
        let gate = Arc::new(PauseGate::new());
        gate.close();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(30));
        gate.abort();

        for waiter in waiters {
            assert!(!waiter.join().unwrap());
        }
        assert!(gate.is_aborted());
    }

    #[test]
    fn test_reopened_gate_passes_without_parking() {
        let gate = PauseGate::new();
        gate.close();
        assert!(gate.is_closed());
        gate.open();

        assert!(!gate.is_closed());
        assert!(gate.wait());
        assert!(!gate.is_aborted());
    }
}
