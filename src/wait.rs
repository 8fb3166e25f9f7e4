// src/wait.rs

//! Wait-queue used for drain barriers and poll-style readers.
//!
//! Peers block on their wait-queue while draining in-flight operations,
//! and message commits wake it so poll loops can retry a receive. All
//! waits are explicit; nothing in the engine blocks implicitly.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A wait-queue: a condition variable with its guard lock folded in.
///
/// Wakers take the internal lock before notifying, so a waiter that has
/// checked its condition and is about to park cannot miss a wake-up.
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Wake all waiters.
    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block until `done` returns true.
    ///
    /// The condition is re-checked after every wake-up; spurious wake-ups
    /// are handled by the loop.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut done: F) {
        let mut guard = self.lock.lock();
        while !done() {
            self.cond.wait(&mut guard);
        }
    }

    /// Block until `done` returns true or the timeout expires.
    ///
    /// Returns true if the condition was met, false on timeout.
    pub fn wait_until_timeout<F: FnMut() -> bool>(&self, mut done: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while !done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cond.wait_for(&mut guard, deadline - now);
        }
        true
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
