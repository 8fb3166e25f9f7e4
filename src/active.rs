// src/active.rs

//! Active-gate: a reference-counted lifecycle primitive.
//!
//! A gate moves through NEW -> ACTIVE -> DEACTIVATING -> RELEASED, where
//! DEACTIVATING lasts until every active reference acquired while the gate
//! was ACTIVE has been released. `drain` is the barrier that waits for
//! that, and `cleanup` runs a teardown callback exactly once across all
//! concurrent callers.
//!
//! The whole state machine lives in a single `AtomicI64`:
//!
//! ```text
//!   NEW ...................... i64::MIN
//!   RELEASED ................. i64::MIN + 1
//!   DEACTIVATING + count ..... BIAS + count   (BIAS <= v < 0)
//!   ACTIVE + count ........... count          (v >= 0)
//! ```
//!
//! Acquires succeed only while the value is non-negative, so deactivation
//! (which biases the value into the negative range) atomically shuts the
//! gate while preserving the in-flight count.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::wait::WaitQueue;

const NEW: i64 = i64::MIN;
const RELEASED: i64 = i64::MIN + 1;
const BIAS: i64 = i64::MIN / 2;

/// Reference-counted lifecycle gate.
pub struct ActiveGate {
    state: AtomicI64,
}

impl ActiveGate {
    /// Create a gate in state NEW.
    pub fn new() -> Self {
        Self {
            state: AtomicI64::new(NEW),
        }
    }

    /// Check if the gate has never been activated.
    #[inline]
    pub fn is_new(&self) -> bool {
        self.state.load(Ordering::Acquire) == NEW
    }

    /// Check if the gate is active (acquires can succeed).
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) >= 0
    }

    /// Check if the gate has been deactivated (draining or released).
    #[inline]
    pub fn is_deactivated(&self) -> bool {
        let v = self.state.load(Ordering::Acquire);
        v < 0 && v != NEW
    }

    /// Check if all active references have been released.
    #[inline]
    pub fn is_drained(&self) -> bool {
        let v = self.state.load(Ordering::Acquire);
        v == BIAS || v == RELEASED
    }

    /// Transition NEW -> ACTIVE.
    ///
    /// Only the first call can succeed; returns whether the gate was
    /// activated by this call.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(NEW, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire an active reference.
    ///
    /// Succeeds only while the gate is ACTIVE. Every successful acquire
    /// must be paired with a `release`.
    pub fn acquire(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v >= 0 {
                    Some(v + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Release an active reference.
    ///
    /// If this was the last reference on a deactivated gate, waiters on
    /// `waitq` are woken so `drain` can make progress.
    pub fn release(&self, waitq: &WaitQueue) {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                debug_assert!(v != NEW && v != RELEASED && v != BIAS);
                if v > 0 || (v > BIAS && v < 0) {
                    Some(v - 1)
                } else {
                    None
                }
            });

        if let Ok(prev) = prev {
            if prev == BIAS + 1 {
                waitq.wake_all();
            }
        }
    }

    /// Transition into DEACTIVATING.
    ///
    /// Idempotent: deactivating a NEW gate drains it immediately, and
    /// deactivating an already deactivated gate is a no-op. In-flight
    /// references keep their count; new acquires fail from here on.
    pub fn deactivate(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                if v == NEW {
                    Some(BIAS)
                } else if v >= 0 {
                    Some(BIAS + v)
                } else {
                    None
                }
            });
    }

    /// Block until the active reference count reaches zero.
    ///
    /// The gate must have been deactivated first.
    pub fn drain(&self, waitq: &WaitQueue) {
        debug_assert!(self.is_deactivated());
        waitq.wait_until(|| self.is_drained());
    }

    /// Run the teardown callback exactly once.
    ///
    /// If `waitq` is given, drains first; otherwise the caller must have
    /// drained the gate already (this is the form used while holding locks
    /// the drain would deadlock against). Exactly one concurrent caller
    /// observes `true` and has run `f`; every other caller gets `false`.
    pub fn cleanup<F: FnOnce()>(&self, waitq: Option<&WaitQueue>, f: F) -> bool {
        if let Some(waitq) = waitq {
            self.drain(waitq);
        } else {
            debug_assert!(self.is_drained());
        }

        let won = self
            .state
            .compare_exchange(BIAS, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            f();
        }
        won
    }
}

impl Default for ActiveGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActiveGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.state.load(Ordering::Acquire);
        let (state, count) = match v {
            NEW => ("new", 0),
            RELEASED => ("released", 0),
            v if v >= 0 => ("active", v),
            v => ("deactivating", v - BIAS),
        };
        f.debug_struct("ActiveGate")
            .field("state", &state)
            .field("count", &count)
            .finish()
    }
}
