//! In-memory connections.
//!
//! A [`Conn`] wraps one end of a rendezvous pipe with its local and remote
//! addresses and decorates every error with those addresses. When the
//! local address is on the buffered network, writes route through the
//! asynchronous write-buffer overlay. `Conn` implements
//! [`AsyncRead`]/[`AsyncWrite`], so anything that drives a
//! `tokio::net::TcpStream` can drive it unchanged.

pub(crate) mod write_buffer;

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::addr::Addr;
use crate::error::{ErrorKind, Op, OpError, Result};
use crate::pipe::latch::Latch;
use crate::pipe::{self, PipeEnd, PipeError};
use self::write_buffer::WriteBuffer;
pub use self::write_buffer::WriteErrors;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Shared state behind a [`Conn`]: the pipe end, the mirrored addresses,
/// and the optional write buffer. Background drainers and listener close
/// watchers hold clones of the `Arc` around this.
pub(crate) struct ConnCore {
    end: PipeEnd,
    laddr: Addr,
    raddr: Addr,
    buf: Option<WriteBuffer>,
    is_remote: bool,
}

impl ConnCore {
    fn new(end: PipeEnd, laddr: Addr, raddr: Addr, is_remote: bool) -> Self {
        let buf = laddr.is_buffered().then(WriteBuffer::new);
        Self {
            end,
            laddr,
            raddr,
            buf,
            is_remote,
        }
    }

    pub(crate) fn done(&self) -> &Arc<Latch> {
        self.end.done()
    }

    pub(crate) fn write_buffer(&self) -> Option<&WriteBuffer> {
        self.buf.as_ref()
    }

    /// Closes the pipe end, waking everything blocked on this connection.
    pub(crate) fn close(&self) {
        if !self.end.is_closed() {
            tracing::debug!(
                laddr = %self.laddr,
                raddr = %self.raddr,
                side = if self.is_remote { "remote" } else { "local" },
                "closing connection"
            );
        }
        self.end.close();
    }

    /// Decorates a write-path fault with this connection's addresses.
    pub(crate) fn write_error(&self, kind: ErrorKind) -> OpError {
        OpError::new(
            Op::Write,
            self.raddr.network().as_str(),
            Some(self.laddr.clone()),
            Some(self.raddr.clone()),
            kind,
        )
    }

    fn read_error(&self, kind: ErrorKind) -> OpError {
        OpError::new(
            Op::Read,
            self.raddr.network().as_str(),
            Some(self.laddr.clone()),
            Some(self.raddr.clone()),
            kind,
        )
    }

    /// Deadline installation is a local affair: both addresses in the
    /// decoration are the local one.
    fn deadline_error(&self, op: Op) -> OpError {
        OpError::new(
            op,
            self.laddr.network().as_str(),
            Some(self.laddr.clone()),
            Some(self.laddr.clone()),
            ErrorKind::ClosedPipe,
        )
    }

    async fn read_impl(&self, buf: &mut [u8]) -> Result<usize> {
        self.end.read(buf).await.map_err(|err| match err {
            PipeError::Closed => self.read_error(ErrorKind::ClosedPipe),
            PipeError::Timeout => self.read_error(ErrorKind::Timeout),
        })
    }

    /// The synchronous (rendezvous) write path; also what drainers use.
    pub(crate) async fn write_sync(&self, buf: &[u8]) -> Result<usize> {
        self.end.write(buf).await.map_err(|err| match err {
            PipeError::Closed => self.write_error(ErrorKind::ClosedPipe),
            PipeError::Timeout => self.write_error(ErrorKind::Timeout),
        })
    }

    async fn write_impl(self: &Arc<Self>, buf: &[u8]) -> Result<usize> {
        match &self.buf {
            Some(buffer) => buffer.write(self, buf).await,
            None => self.write_sync(buf).await,
        }
    }
}

impl fmt::Debug for ConnCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnCore")
            .field("laddr", &self.laddr)
            .field("raddr", &self.raddr)
            .field("buffered", &self.buf.is_some())
            .field("is_remote", &self.is_remote)
            .finish()
    }
}

/// Creates a connected pair of conns with mirrored addresses.
///
/// The first conn is the dialer's ("local") side, the second the side the
/// listener hands to `accept`. A write buffer is attached to exactly the
/// sides whose local address is on the buffered network.
pub(crate) fn pair(laddr: Addr, raddr: Addr) -> (Conn, Conn) {
    let (end_a, end_b) = pipe::pipe();
    let local = Conn::from_core(ConnCore::new(end_a, laddr.clone(), raddr.clone(), false));
    let remote = Conn::from_core(ConnCore::new(end_b, raddr, laddr, true));
    (local, remote)
}

/// One side of a named in-memory connection.
///
/// Obtained from [`Provider::dial`](crate::Provider::dial) or
/// [`Listener::accept`](crate::Listener::accept). Reads and writes go
/// through the rendezvous pipe shared with the peer; on the buffered
/// network, writes are accepted immediately and drained in the background
/// with failures reported through [`write_errs`](Conn::write_errs).
///
/// Dropping a `Conn` closes it. For concurrent reading and writing from
/// separate tasks, use [`tokio::io::split`].
pub struct Conn {
    core: Arc<ConnCore>,
    read_fut: Option<BoxFuture<io::Result<Vec<u8>>>>,
    write_fut: Option<BoxFuture<io::Result<usize>>>,
    /// Bytes produced by a poll-driven read that outgrew the caller's
    /// buffer between polls; drained before anything else.
    spill: Vec<u8>,
}

impl Conn {
    fn from_core(core: ConnCore) -> Self {
        Self {
            core: Arc::new(core),
            read_fut: None,
            write_fut: None,
            spill: Vec::new(),
        }
    }

    pub(crate) fn core_handle(&self) -> Arc<ConnCore> {
        self.core.clone()
    }

    /// The local address of this side of the connection.
    pub fn local_addr(&self) -> Addr {
        self.core.laddr.clone()
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> Addr {
        self.core.raddr.clone()
    }

    /// Whether writes on this side go through the asynchronous buffer.
    pub fn local_buffered(&self) -> bool {
        self.core.laddr.is_buffered()
    }

    /// Whether the peer's writes are buffered.
    pub fn remote_buffered(&self) -> bool {
        self.core.raddr.is_buffered()
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` on a non-empty buffer means
    /// the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.spill.is_empty() && !buf.is_empty() {
            let n = self.spill.len().min(buf.len());
            buf[..n].copy_from_slice(&self.spill[..n]);
            self.spill.drain(..n);
            return Ok(n);
        }
        self.core.read_impl(buf).await
    }

    /// Writes `buf` to the peer.
    ///
    /// On the unbuffered network this is a rendezvous: it resolves once a
    /// peer read takes the bytes, and may report a partial count when the
    /// peer's buffer was shorter. On the buffered network the whole
    /// payload is accepted (blocking only on back-pressure) and delivered
    /// later; failures surface on [`write_errs`](Conn::write_errs).
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.core.write_impl(buf).await
    }

    /// Closes the connection. Idempotent; every blocked operation on
    /// either side observes the close.
    pub fn close(&self) {
        self.core.close();
    }

    /// Installs both deadlines at once.
    pub fn set_deadline(&self, at: Option<Instant>) -> Result<()> {
        self.set_read_deadline(at)?;
        self.set_write_deadline(at)
    }

    /// Installs the read deadline. `None` clears it; an instant in the
    /// past trips any blocked read immediately. Fails once the connection
    /// is closed.
    pub fn set_read_deadline(&self, at: Option<Instant>) -> Result<()> {
        if self.core.end.is_closed() {
            return Err(self.core.deadline_error(Op::SetReadDeadline));
        }
        self.core.end.set_read_deadline(at);
        Ok(())
    }

    /// Installs the write deadline. Same semantics as the read side.
    pub fn set_write_deadline(&self, at: Option<Instant>) -> Result<()> {
        if self.core.end.is_closed() {
            return Err(self.core.deadline_error(Op::SetWriteDeadline));
        }
        self.core.end.set_write_deadline(at);
        Ok(())
    }

    /// Sets the drain granularity for buffered writes: background
    /// drainers hand the pipe at most this many bytes per write. No
    /// effect on unbuffered connections; 0 restores whole-payload drains.
    pub fn set_write_buffer(&self, bytes: usize) {
        if let Some(buffer) = &self.core.buf {
            buffer.set_chunk(bytes);
        }
    }

    /// Caps the bytes a buffered connection may hold accepted-but-
    /// undelivered; writes block once the cap is reached. No effect on
    /// unbuffered connections; 0 removes the cap.
    pub fn set_write_buffer_limit(&self, bytes: usize) {
        if let Some(buffer) = &self.core.buf {
            buffer.set_limit(bytes);
        }
    }

    /// Bytes accepted by buffered writes that have not yet reached the
    /// peer. Always 0 for unbuffered connections.
    pub fn buffered_pending(&self) -> usize {
        self.core.buf.as_ref().map_or(0, WriteBuffer::pending)
    }

    /// Takes the receiver for errors observed by background drainers.
    ///
    /// Yields `Some` exactly once, and only on buffered connections.
    /// Until it is taken, drainer errors accumulate; after the returned
    /// handle is dropped, they are discarded.
    pub fn write_errs(&self) -> Option<WriteErrors> {
        self.core.buf.as_ref().and_then(WriteBuffer::take_errors)
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("laddr", &self.core.laddr)
            .field("raddr", &self.core.raddr)
            .field("buffered", &self.core.buf.is_some())
            .finish()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // Dropping a connection closes it, like dropping a TcpStream.
        self.core.close();
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.spill.is_empty() {
            let n = this.spill.len().min(buf.remaining());
            buf.put_slice(&this.spill[..n]);
            this.spill.drain(..n);
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let fut = this.read_fut.get_or_insert_with(|| {
            let core = this.core.clone();
            // Short reads are legal, so large destination buffers are
            // served in bounded slices rather than allocated wholesale.
            let want = buf.remaining().min(64 * 1024);
            Box::pin(async move {
                let mut tmp = vec![0u8; want];
                let n = core.read_impl(&mut tmp).await.map_err(io::Error::from)?;
                tmp.truncate(n);
                Ok(tmp)
            })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.read_fut = None;
                match result {
                    Ok(data) => {
                        let n = data.len().min(buf.remaining());
                        buf.put_slice(&data[..n]);
                        if n < data.len() {
                            this.spill.extend_from_slice(&data[n..]);
                        }
                        Poll::Ready(Ok(()))
                    }
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.write_fut.get_or_insert_with(|| {
            let core = this.core.clone();
            let data = Bytes::copy_from_slice(buf);
            Box::pin(async move { core.write_impl(&data).await.map_err(io::Error::from) })
        });
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.write_fut = None;
                Poll::Ready(result)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Rendezvous writes are already with the peer when they resolve,
        // and buffered delivery is explicitly asynchronous by contract.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.core.close();
        Poll::Ready(Ok(()))
    }
}
