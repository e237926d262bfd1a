// ChamberSim - Growth-Chamber Peripheral Simulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Suspend request raised by the stepping loop for the duration of a tick.
///
/// The firmware context checks the gate before every memory access and
/// parks while it is closed.
#[derive(Debug, Default)]
pub(crate) struct SuspendGate {
    suspended: AtomicBool,
    state: Mutex<bool>,
    resumed: Condvar,
}

impl SuspendGate {
    pub fn suspend(&self) {
        let mut suspended = lock(&self.state);
        *suspended = true;
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let mut suspended = lock(&self.state);
        *suspended = false;
        self.suspended.store(false, Ordering::SeqCst);
        self.resumed.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn wait_resumed(&self) {
        if !self.is_suspended() {
            return;
        }
        let mut suspended = lock(&self.state);
        while *suspended {
            suspended = self
                .resumed
                .wait(suspended)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Debug, Default)]
struct EpochState {
    tick: u64,
    dispatched: u64,
    stopping: bool,
}

/// Completed-tick counter the firmware context can block on.
#[derive(Debug, Default)]
pub(crate) struct TickEpoch {
    state: Mutex<EpochState>,
    changed: Condvar,
}

impl TickEpoch {
    pub fn tick(&self) -> u64 {
        lock(&self.state).tick
    }

    pub fn dispatched(&self) -> u64 {
        lock(&self.state).dispatched
    }

    pub fn advance(&self, tick: u64, dispatched: u64) {
        let mut state = lock(&self.state);
        state.tick = tick;
        state.dispatched += dispatched;
        self.changed.notify_all();
    }

    pub fn restart(&self) {
        lock(&self.state).stopping = false;
    }

    pub fn stop(&self) {
        lock(&self.state).stopping = true;
        self.changed.notify_all();
    }

    /// Block until at least one interrupt has been dispatched after
    /// `seen` were counted. Returns `false` once shutdown begins.
    pub fn wait_dispatch_after(&self, seen: u64) -> bool {
        let mut state = lock(&self.state);
        while state.dispatched <= seen && !state.stopping {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !state.stopping
    }

    /// Block until tick `target` has completed. Returns `false` once shutdown
    /// begins.
    pub fn wait_tick(&self, target: u64) -> bool {
        let mut state = lock(&self.state);
        while state.tick < target && !state.stopping {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.tick >= target
    }

    /// Like [`TickEpoch::wait_tick`], bounded by `timeout`.
    pub fn wait_tick_timeout(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.tick < target && !state.stopping {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        state.tick >= target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_gate_parks_until_resume() {
        let gate = Arc::new(SuspendGate::default());
        gate.suspend();
        let passed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let gate = gate.clone();
            let passed = passed.clone();
            thread::spawn(move || {
                gate.wait_resumed();
                passed.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!passed.load(Ordering::SeqCst));
        gate.resume();
        waiter.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_epoch_wait_returns_false_on_stop() {
        let epoch = Arc::new(TickEpoch::default());
        let waiter = {
            let epoch = epoch.clone();
            thread::spawn(move || epoch.wait_dispatch_after(0))
        };
        thread::sleep(Duration::from_millis(10));
        epoch.stop();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_epoch_wait_tick() {
        let epoch = TickEpoch::default();
        epoch.advance(3, 0);
        assert!(epoch.wait_tick(2));
        assert!(!epoch.wait_tick_timeout(10, Duration::from_millis(5)));
        assert_eq!(epoch.tick(), 3);
    }
}
