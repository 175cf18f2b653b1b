//! Cooperative stop signals.
//!
//! Two independent signals can stop an in-flight loop: a connection-scoped
//! cancel flag set by `disconnect`, and an optional caller-owned [`Breaker`]
//! scoped to a single `send_all`/`recv_all` invocation. Neither kills a
//! task; loops observe the signal at their next check point and return a
//! terminal result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Caller-owned early-exit signal for one `send_all`/`recv_all` call.
///
/// Cloning yields another handle to the same signal. Tripping a breaker
/// stops the loop it was handed to without tearing down the connection;
/// the loop reports the bytes moved up to that point.
#[derive(Clone, Debug, Default)]
pub struct Breaker {
    tripped: Arc<AtomicBool>,
}

impl Breaker {
    /// Create an untripped breaker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop holding this breaker to stop at its next iteration.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
    }

    /// Whether the breaker has been tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// Connection-scoped cancel flag.
///
/// A fresh flag is installed per connect session, so loops that belong to a
/// torn-down session keep observing their own, already-set flag and never
/// race against the flag of a newer session.
#[derive(Debug, Default)]
pub(crate) struct CancelFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// Set the flag and wake every waiter.
    pub(crate) fn set(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the flag has been set.
    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve once the flag is set.
    ///
    /// Registers interest before re-checking the flag, so a concurrent
    /// `set` cannot be missed.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
