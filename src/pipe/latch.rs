//! One-shot latch used for close and cancellation signalling.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot, multi-waiter signal.
///
/// A latch starts unset and moves to the set state exactly once; it never
/// resets. Any number of tasks can [`wait`](Latch::wait) on it, and every
/// waiter (current and future) observes the trip. This is the primitive
/// behind connection close, listener close, and dial cancellation: every
/// blocking operation in the crate selects on the latches relevant to it,
/// which is what guarantees that a close becomes visible to all parties in
/// finite time.
#[derive(Debug, Default)]
pub struct Latch {
    tripped: AtomicBool,
    notify: Notify,
}

impl Latch {
    /// Creates an unset latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch, waking every current waiter.
    ///
    /// Idempotent. Returns `true` only for the call that actually performed
    /// the transition, which lets close paths run their one-time teardown
    /// exactly once.
    pub fn trip(&self) -> bool {
        let first = !self.tripped.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Whether the latch has been set.
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Waits until the latch is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        while !self.is_tripped() {
            // The Notified future receives notify_waiters() wakeups from
            // the moment it is created, so the recheck below closes the
            // race with a concurrent trip().
            let notified = self.notify.notified();
            if self.is_tripped() {
                return;
            }
            notified.await;
        }
    }
}
