//! Reset rendezvous between the control and bulk threads.
//!
//! A host-initiated device reset must be able to unblock the bulk
//! thread's endpoint I/O at any point and release it exactly once. The
//! control thread re-arms the gate, interrupts the bulk thread, clears
//! the endpoint halts and then posts; the bulk thread, seeing its read
//! or write fail with an interrupt, parks on the gate until that post
//! arrives and then retries the I/O.

use std::sync::{Condvar, Mutex};

struct GateState {
    permits: u32,
    epoch: u64,
}

/// A counting semaphore with an epoch counter.
///
/// The epoch increments on every [`ResetGate::post`], letting the bulk
/// engine observe between transactions that a reset completed and drop
/// its session state.
pub struct ResetGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ResetGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                permits: 0,
                epoch: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Drop any stale permit before starting a new reset cycle.
    pub fn rearm(&self) {
        let mut state = self.lock();
        state.permits = 0;
    }

    /// Release one waiter (or the next thread to wait) and advance the
    /// epoch.
    pub fn post(&self) {
        let mut state = self.lock();
        state.permits += 1;
        state.epoch += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut state = self.lock();
        while state.permits == 0 {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.permits -= 1;
    }

    /// The number of completed resets so far.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ResetGate {
    fn default() -> Self {
        Self::new()
    }
}
