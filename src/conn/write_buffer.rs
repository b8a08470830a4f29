//! Asynchronous bounded write buffering for buffered connections.
//!
//! On the buffered network a write accepts its entire payload up front
//! (subject to back-pressure against the configured limit) and returns;
//! delivery to the peer happens later, chunk by chunk, through background
//! drainer tasks. Drainers run in strict FIFO: each one waits on the latch
//! of the drainer enqueued before it, so bytes reach the pipe in exactly
//! the order the writes accepted them. Failures observed by drainers are
//! reported on an out-of-band error stream instead of failing a write that
//! has already returned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use crate::conn::ConnCore;
use crate::error::{ErrorKind, OpError};
use crate::pipe::latch::Latch;

/// The buffered-write state attached to a connection whose local address
/// is on the buffered network.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    /// Preferred drain granularity in bytes; 0 drains whole payloads.
    chunk: AtomicUsize,
    /// Maximum bytes accepted-but-undelivered; 0 means no limit.
    limit: AtomicUsize,
    /// Bytes accepted by writes but not yet handed to the pipe.
    pending: AtomicUsize,
    /// Admits one caller into the write path at a time.
    serialize: tokio::sync::Mutex<()>,
    /// Signalled whenever `pending` shrinks.
    free: Notify,
    /// Latch of the most recently enqueued drainer; the FIFO chain tail.
    chain: Mutex<Arc<Latch>>,
    err_tx: mpsc::UnboundedSender<OpError>,
    err_rx: Mutex<Option<mpsc::UnboundedReceiver<OpError>>>,
}

impl WriteBuffer {
    pub(crate) fn new() -> Self {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        // The chain starts tripped so the first drainer has no
        // predecessor to wait for.
        let head = Arc::new(Latch::new());
        head.trip();
        Self {
            chunk: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            serialize: tokio::sync::Mutex::new(()),
            free: Notify::new(),
            chain: Mutex::new(head),
            err_tx,
            err_rx: Mutex::new(Some(err_rx)),
        }
    }

    /// Sets the drain granularity.
    pub(crate) fn set_chunk(&self, bytes: usize) {
        self.chunk.store(bytes, Ordering::Release);
    }

    /// Sets the outstanding-bytes limit.
    pub(crate) fn set_limit(&self, bytes: usize) {
        self.limit.store(bytes, Ordering::Release);
    }

    /// Bytes accepted by writes that have not yet reached the pipe.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Hands out the error stream receiver. Only the first call yields it.
    pub(crate) fn take_errors(&self) -> Option<WriteErrors> {
        self.err_rx
            .lock()
            .expect("write buffer error receiver lock poisoned")
            .take()
            .map(|rx| WriteErrors { rx })
    }

    /// The buffered write path.
    ///
    /// Accepts the whole payload (blocking only on back-pressure or the
    /// serialize token) and enqueues one drainer per accepted slice. On
    /// success the returned count equals `payload.len()`.
    pub(crate) async fn write(
        &self,
        core: &Arc<ConnCore>,
        payload: &[u8],
    ) -> Result<usize, OpError> {
        let done = core.done().clone();

        // Admission: one writer at a time, abandoned if the connection
        // closes while waiting.
        let _serialized = tokio::select! {
            biased;
            _ = done.wait() => return Err(core.write_error(ErrorKind::ClosedPipe)),
            guard = self.serialize.lock() => guard,
        };
        if done.is_tripped() {
            return Err(core.write_error(ErrorKind::ClosedPipe));
        }

        let limit = self.limit.load(Ordering::Acquire);
        let chunk_size = self.chunk.load(Ordering::Acquire);
        if limit > 0 && chunk_size > limit {
            return Err(core.write_error(ErrorKind::InvalidWriteBuffer));
        }

        let mut accepted = 0usize;
        let mut rest = payload;
        while !rest.is_empty() {
            let mut take = rest.len();
            if limit > 0 {
                // Wait until the buffer has room, then accept at most the
                // free space so `pending` never exceeds the limit.
                let mut room = limit.saturating_sub(self.pending());
                while room == 0 {
                    tokio::select! {
                        biased;
                        _ = done.wait() => {
                            return Err(core.write_error(ErrorKind::ClosedPipe));
                        }
                        _ = self.free.notified() => {}
                    }
                    room = limit.saturating_sub(self.pending());
                }
                take = take.min(room);
            }

            let slice = Bytes::copy_from_slice(&rest[..take]);
            rest = &rest[take..];
            accepted += take;
            self.pending.fetch_add(take, Ordering::AcqRel);
            self.enqueue(core, slice, chunk_size);
        }

        Ok(accepted)
    }

    /// Links a drainer for `slice` onto the FIFO chain and spawns it.
    fn enqueue(&self, core: &Arc<ConnCore>, slice: Bytes, chunk_size: usize) {
        let my_done = Arc::new(Latch::new());
        let predecessor = {
            let mut tail = self.chain.lock().expect("write buffer chain lock poisoned");
            std::mem::replace(&mut *tail, my_done.clone())
        };
        let core = core.clone();
        tokio::spawn(async move {
            drain(&core, slice, chunk_size, predecessor).await;
            my_done.trip();
        });
    }

    /// Reconciles `pending` for bytes a drainer will never deliver and
    /// reports the fault on the error stream.
    fn abort(&self, undelivered: usize, err: OpError) {
        if undelivered > 0 {
            self.pending.fetch_sub(undelivered, Ordering::AcqRel);
            self.free.notify_one();
        }
        // If the receiver is gone the error is dropped rather than queued
        // forever.
        let _ = self.err_tx.send(err);
    }
}

/// Moves one accepted slice into the pipe, in chunk-sized pieces.
async fn drain(core: &Arc<ConnCore>, slice: Bytes, chunk_size: usize, predecessor: Arc<Latch>) {
    let Some(buffer) = core.write_buffer() else {
        return;
    };
    let done = core.done();

    tokio::select! {
        biased;
        _ = predecessor.wait() => {}
        _ = done.wait() => {
            buffer.abort(slice.len(), core.write_error(ErrorKind::ClosedPipe));
            return;
        }
    }

    let mut remaining = slice;
    while !remaining.is_empty() {
        if done.is_tripped() {
            buffer.abort(remaining.len(), core.write_error(ErrorKind::ClosedPipe));
            return;
        }
        let take = if chunk_size > 0 {
            chunk_size.min(remaining.len())
        } else {
            remaining.len()
        };
        let mut piece = remaining.split_to(take);
        while !piece.is_empty() {
            if done.is_tripped() {
                buffer.abort(
                    piece.len() + remaining.len(),
                    core.write_error(ErrorKind::ClosedPipe),
                );
                return;
            }
            match core.write_sync(&piece).await {
                Ok(n) => {
                    let _ = piece.split_to(n);
                    buffer.pending.fetch_sub(n, Ordering::AcqRel);
                    buffer.free.notify_one();
                }
                Err(err) => {
                    // No retry: one failure, one error-stream entry, and
                    // the rest of this slice is abandoned.
                    buffer.abort(piece.len() + remaining.len(), err);
                    return;
                }
            }
        }
    }
}

/// Receiver half of a buffered connection's error stream.
///
/// Handed out once by [`Conn::write_errs`](crate::Conn::write_errs).
/// Errors observed by background drainers arrive here in the order they
/// occurred. If this handle is dropped, later errors are discarded.
#[derive(Debug)]
pub struct WriteErrors {
    rx: mpsc::UnboundedReceiver<OpError>,
}

impl WriteErrors {
    /// Waits for the next drainer error. Resolves `None` once the
    /// connection (and every drainer) is gone.
    pub async fn recv(&mut self) -> Option<OpError> {
        self.rx.recv().await
    }

    /// Pulls an already-reported error without waiting.
    pub fn try_recv(&mut self) -> Option<OpError> {
        self.rx.try_recv().ok()
    }
}
