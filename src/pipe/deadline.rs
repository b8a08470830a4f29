//! Re-armable deadlines for pipe reads and writes.

use tokio::sync::watch;
use tokio::time::Instant;

/// A per-direction deadline that can be installed, replaced, or cleared
/// while operations are blocked on it.
///
/// The deadline is published through a watch channel. A blocked operation
/// holds a [`DeadlineWatch`] and races its [`expired`](DeadlineWatch::expired)
/// future against the data path: re-arming the deadline (including to an
/// instant already in the past) wakes the watcher, which re-evaluates the
/// new instant. `None` means "never".
#[derive(Debug)]
pub(crate) struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    /// Creates a deadline in the "never" state.
    pub(crate) fn unset() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Installs a new deadline, replacing any previous one. Passing `None`
    /// clears the deadline. Blocked operations observe the change.
    pub(crate) fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    /// Whether the deadline has already passed at `now`.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(*self.tx.borrow(), Some(at) if at <= now)
    }

    /// Subscribes a blocked operation to deadline changes.
    pub(crate) fn watch(&self) -> DeadlineWatch {
        DeadlineWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// One operation's view of a [`Deadline`].
#[derive(Debug)]
pub(crate) struct DeadlineWatch {
    rx: watch::Receiver<Option<Instant>>,
}

impl DeadlineWatch {
    /// Resolves when the deadline expires.
    ///
    /// Never resolves while the deadline is unset. Cancel-safe, so it can
    /// sit in a `select!` arm and be recreated across loop iterations.
    pub(crate) async fn expired(&mut self) {
        loop {
            let current = *self.rx.borrow_and_update();
            match current {
                None => {
                    if self.rx.changed().await.is_err() {
                        // The owning endpoint is gone; nothing will ever
                        // re-arm this deadline.
                        std::future::pending::<()>().await;
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = self.rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
            }
        }
    }
}
