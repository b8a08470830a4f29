//! Synchronous in-memory rendezvous pipe with deadlines and close latches.
//!
//! A pipe is a pair of symmetric endpoints wired across two directions.
//! Each direction carries at most one outstanding *offer*: a writer parks
//! its payload in the direction's slot and waits for the reply; a reader
//! claims the offer, copies as much as fits, and replies with the count.
//! One write call corresponds to exactly one (possibly partial) delivery
//! to one read call, and the pipe itself never buffers beyond the single
//! in-flight offer.
//!
//! Every blocking operation is a multi-way wait over the data path, the
//! direction's deadline, the local close latch, and the peer close latch,
//! so closes and re-armed deadlines unblock in-flight operations promptly.

pub(crate) mod deadline;
pub(crate) mod latch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use self::deadline::Deadline;
use self::latch::Latch;

/// Errors produced by raw pipe operations, before address decoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum PipeError {
    /// The local or peer endpoint closed.
    #[error("closed pipe")]
    Closed,
    /// The direction's deadline tripped mid-operation.
    #[error("i/o timeout")]
    Timeout,
}

/// A writer's parked payload, waiting for a reader to claim it.
#[derive(Debug)]
struct Offer {
    /// Identity used by the writer to retract an unclaimed offer.
    id: u64,
    data: Bytes,
    reply: oneshot::Sender<usize>,
}

/// One flow direction: a rendezvous slot plus wakeups for each side.
#[derive(Debug, Default)]
struct Direction {
    slot: Mutex<Option<Offer>>,
    next_offer: AtomicU64,
    /// Signalled when an offer lands in the slot.
    readable: Notify,
    /// Signalled when the slot frees up (claim or retraction).
    writable: Notify,
}

impl Direction {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Offer>> {
        self.slot.lock().expect("pipe direction lock poisoned")
    }
}

/// Retracts an unclaimed offer if the owning write future is dropped.
///
/// A cancelled write must not leave its payload in the slot: a later reader
/// would deliver bytes the writer never acknowledged, and other writers
/// would queue behind a dead offer.
struct OfferGuard<'a> {
    dir: &'a Direction,
    id: u64,
    armed: bool,
}

impl<'a> OfferGuard<'a> {
    fn new(dir: &'a Direction, id: u64) -> Self {
        Self {
            dir,
            id,
            armed: true,
        }
    }

    /// The write completed through the reply channel; the slot is no
    /// longer ours to touch.
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Pulls the offer back out of the slot if no reader claimed it.
    /// Returns `true` when the retraction happened (nothing was delivered).
    fn retract(mut self) -> bool {
        self.armed = false;
        self.dir.take_offer(self.id)
    }
}

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dir.take_offer(self.id);
        }
    }
}

impl Direction {
    /// Removes the offer with the given id, if it is still parked.
    fn take_offer(&self, id: u64) -> bool {
        let mut slot = self.lock_slot();
        match slot.as_ref() {
            Some(offer) if offer.id == id => {
                *slot = None;
                drop(slot);
                self.writable.notify_one();
                true
            }
            _ => false,
        }
    }
}

/// One endpoint of an in-memory pipe.
///
/// Endpoints are symmetric: each one writes into its `tx` direction and
/// reads from its `rx` direction, which are cross-wired with the peer's.
#[derive(Debug)]
pub(crate) struct PipeEnd {
    tx: Arc<Direction>,
    rx: Arc<Direction>,
    local_done: Arc<Latch>,
    peer_done: Arc<Latch>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

/// Creates a connected pair of pipe endpoints.
pub(crate) fn pipe() -> (PipeEnd, PipeEnd) {
    let a_to_b = Arc::new(Direction::default());
    let b_to_a = Arc::new(Direction::default());
    let done_a = Arc::new(Latch::new());
    let done_b = Arc::new(Latch::new());

    let end_a = PipeEnd {
        tx: a_to_b.clone(),
        rx: b_to_a.clone(),
        local_done: done_a.clone(),
        peer_done: done_b.clone(),
        read_deadline: Deadline::unset(),
        write_deadline: Deadline::unset(),
    };
    let end_b = PipeEnd {
        tx: b_to_a,
        rx: a_to_b,
        local_done: done_b,
        peer_done: done_a,
        read_deadline: Deadline::unset(),
        write_deadline: Deadline::unset(),
    };
    (end_a, end_b)
}

impl PipeEnd {
    /// Closes this endpoint. Idempotent.
    ///
    /// Every blocked operation on either end observes the latch: local
    /// reads and writes fail with [`PipeError::Closed`], the peer's reads
    /// drain any in-flight offer and then hit end-of-stream, and the
    /// peer's writes fail with [`PipeError::Closed`].
    pub(crate) fn close(&self) {
        self.local_done.trip();
    }

    /// Whether this endpoint has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.local_done.is_tripped()
    }

    /// This endpoint's close latch, for watchers that need to react to
    /// the endpoint going away.
    pub(crate) fn done(&self) -> &Arc<Latch> {
        &self.local_done
    }

    /// Installs the read deadline. `None` clears it; a past instant trips
    /// any blocked read immediately.
    pub(crate) fn set_read_deadline(&self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    /// Installs the write deadline. Same semantics as the read side.
    pub(crate) fn set_write_deadline(&self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    /// Reads up to `buf.len()` bytes from the peer.
    ///
    /// Resolves with at least one byte unless `buf` is empty; `Ok(0)` on a
    /// non-empty buffer means the peer closed (end-of-stream). An expired
    /// read deadline is reported in preference to a concurrent close, so
    /// tests get a stable error kind out of that race.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize, PipeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut deadline = self.read_deadline.watch();
        loop {
            if self.local_done.is_tripped() {
                return Err(PipeError::Closed);
            }
            // Drain an in-flight offer before reporting timeout or EOF.
            if let Some(n) = self.try_claim(buf) {
                return Ok(n);
            }
            if self.read_deadline.is_expired(Instant::now()) {
                return Err(PipeError::Timeout);
            }
            if self.peer_done.is_tripped() {
                return Ok(0);
            }
            tokio::select! {
                biased;
                _ = deadline.expired() => return Err(PipeError::Timeout),
                _ = self.rx.readable.notified() => {}
                _ = self.local_done.wait() => {}
                _ = self.peer_done.wait() => {}
            }
        }
    }

    /// Claims the parked offer, copies what fits, and replies with the
    /// count. No await between claim and reply: a claimed offer always
    /// produces exactly one reply.
    fn try_claim(&self, buf: &mut [u8]) -> Option<usize> {
        let offer = self.rx.lock_slot().take()?;
        let n = offer.data.len().min(buf.len());
        buf[..n].copy_from_slice(&offer.data[..n]);
        let _ = offer.reply.send(n);
        self.rx.writable.notify_one();
        Some(n)
    }

    /// Hands `buf` to the peer through a single rendezvous.
    ///
    /// Resolves with the number of bytes the matching read actually took,
    /// which is less than `buf.len()` when the reader's buffer was
    /// shorter; the remainder is discarded and the caller reissues it.
    /// A zero-length write resolves immediately without touching the peer.
    pub(crate) async fn write(&self, buf: &[u8]) -> Result<usize, PipeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.write_deadline.is_expired(Instant::now()) {
            return Err(PipeError::Timeout);
        }
        if self.local_done.is_tripped() || self.peer_done.is_tripped() {
            return Err(PipeError::Closed);
        }

        let mut deadline = self.write_deadline.watch();

        // Phase 1: park the offer in the slot.
        let (mut reply, guard) = loop {
            {
                let mut slot = self.tx.lock_slot();
                if slot.is_none() {
                    let id = self.tx.next_offer.fetch_add(1, Ordering::Relaxed);
                    let (reply_tx, reply_rx) = oneshot::channel();
                    *slot = Some(Offer {
                        id,
                        data: Bytes::copy_from_slice(buf),
                        reply: reply_tx,
                    });
                    drop(slot);
                    self.tx.readable.notify_one();
                    break (reply_rx, OfferGuard::new(&self.tx, id));
                }
            }
            tokio::select! {
                biased;
                _ = deadline.expired() => return Err(PipeError::Timeout),
                _ = self.local_done.wait() => return Err(PipeError::Closed),
                _ = self.peer_done.wait() => return Err(PipeError::Closed),
                _ = self.tx.writable.notified() => {}
            }
        };

        // Phase 2: wait for the reader, the deadline, or a close.
        tokio::select! {
            biased;
            _ = deadline.expired() => {
                self.settle_interrupted(guard, reply, PipeError::Timeout).await
            }
            _ = self.local_done.wait() => {
                self.settle_interrupted(guard, reply, PipeError::Closed).await
            }
            _ = self.peer_done.wait() => {
                self.settle_interrupted(guard, reply, PipeError::Closed).await
            }
            res = &mut reply => {
                guard.disarm();
                res.map_err(|_| PipeError::Closed)
            }
        }
    }

    /// A deadline or close interrupted the wait for the reader. If the
    /// offer is still parked nothing was delivered and the interruption
    /// wins; if a reader already claimed it the write is committed and the
    /// (imminent) reply is the result.
    async fn settle_interrupted(
        &self,
        guard: OfferGuard<'_>,
        reply: oneshot::Receiver<usize>,
        err: PipeError,
    ) -> Result<usize, PipeError> {
        if guard.retract() {
            return Err(err);
        }
        reply.await.map_err(|_| PipeError::Closed)
    }
}
