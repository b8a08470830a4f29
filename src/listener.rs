//! In-memory listeners and the dial/accept rendezvous.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use crate::addr::Addr;
use crate::conn::{self, Conn};
use crate::error::{ErrorKind, Op, OpError, Result};
use crate::pipe::latch::Latch;
use crate::provider::ProviderInner;

/// State shared between a [`Listener`], the provider registry entry for
/// it, and every in-flight dial handshake that resolved to it.
pub(crate) struct ListenerShared {
    pub(crate) addr: Addr,
    pub(crate) id: u64,
    accept_tx: mpsc::Sender<Conn>,
    done: Arc<Latch>,
    provider: Weak<ProviderInner>,
}

impl ListenerShared {
    /// Closes the listener: trips the done latch (waking every pending
    /// accept and every handshake racing it) and removes the registry
    /// entry. Idempotent; the identity check keeps a stale close from
    /// evicting a successor listener announced under the same address.
    pub(crate) fn close(&self) {
        if !self.done.trip() {
            return;
        }
        if let Some(provider) = self.provider.upgrade() {
            provider.unregister(&self.addr, self.id);
        }
        tracing::debug!(addr = %self.addr, net = %self.addr.network(), "listener closed");
    }

    fn closed_error(&self) -> OpError {
        OpError::new(
            Op::Accept,
            self.addr.network().as_str(),
            Some(self.addr.clone()),
            Some(self.addr.clone()),
            ErrorKind::ListenerClosed,
        )
    }

    fn dial_error(&self, laddr: &Addr, raddr: &Addr, kind: ErrorKind) -> OpError {
        OpError::new(
            Op::Dial,
            raddr.network().as_str(),
            Some(laddr.clone()),
            Some(raddr.clone()),
            kind,
        )
    }

    /// The dial handshake.
    ///
    /// Builds the connection pair, arms the close watcher that terminates
    /// the remote side if the listener closes first, and then races
    /// delivery into the accept queue against the listener's done latch
    /// and the dialer's cancellation. Exactly one arm wins; on the losing
    /// arms both conns close (the remote side by being dropped with the
    /// abandoned send future).
    pub(crate) async fn dial(
        self: &Arc<Self>,
        laddr: Addr,
        raddr: Addr,
        cancel: Option<&Latch>,
    ) -> Result<Conn> {
        let (local, remote) = conn::pair(laddr.clone(), raddr.clone());

        // If the listener closes while the remote conn is still queued (or
        // already accepted but unread), this watcher forcibly terminates
        // it, which is how server shutdown reaches orphaned dialers. The
        // watcher also exits when the conn itself dies, so it never
        // outlives the connection.
        let listener_done = self.done.clone();
        let remote_core = remote.core_handle();
        let remote_done = remote_core.done().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = listener_done.wait() => remote_core.close(),
                _ = remote_done.wait() => {}
            }
        });

        let cancelled = async {
            match cancel {
                Some(latch) => latch.wait().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.done.wait() => {
                local.close();
                Err(self.dial_error(&laddr, &raddr, ErrorKind::ListenerClosed))
            }
            _ = cancelled => {
                local.close();
                Err(self.dial_error(&laddr, &raddr, ErrorKind::Cancelled))
            }
            delivered = self.accept_tx.send(remote) => match delivered {
                Ok(()) => {
                    tracing::trace!(laddr = %laddr, raddr = %raddr, "dial rendezvous complete");
                    Ok(local)
                }
                Err(_) => {
                    local.close();
                    Err(self.dial_error(&laddr, &raddr, ErrorKind::ListenerClosed))
                }
            },
        }
    }
}

/// A named in-memory listener.
///
/// Announced by [`Provider::listen`](crate::Provider::listen). Each
/// successful dial against the listener's address parks one connection in
/// the accept queue; [`accept`](Listener::accept) takes them out.
/// Closing (or dropping) the listener unblocks every pending accept,
/// terminates every conn still in the handshake, and frees the address
/// for reuse.
#[derive(Debug)]
pub struct Listener {
    shared: Arc<ListenerShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
}

impl Listener {
    pub(crate) fn announce(
        addr: Addr,
        id: u64,
        provider: Weak<ProviderInner>,
    ) -> (Self, Arc<ListenerShared>) {
        // Capacity 1: the dial side parks at most one undelivered conn and
        // otherwise waits for an accept, mirroring the rendezvous the rest
        // of the transport is built on.
        let (accept_tx, accept_rx) = mpsc::channel(1);
        let shared = Arc::new(ListenerShared {
            addr,
            id,
            accept_tx,
            done: Arc::new(Latch::new()),
            provider,
        });
        let listener = Self {
            shared: shared.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        };
        (listener, shared)
    }

    /// The address this listener is announced on.
    pub fn addr(&self) -> Addr {
        self.shared.addr.clone()
    }

    /// Waits for the next dialed connection.
    ///
    /// Fails with [`ErrorKind::ListenerClosed`] once the listener closes;
    /// the close wins deterministically over connections still sitting in
    /// the queue, since those have already been terminated by their
    /// handshake watchers.
    pub async fn accept(&self) -> Result<Conn> {
        let mut queue = tokio::select! {
            biased;
            _ = self.shared.done.wait() => return Err(self.shared.closed_error()),
            queue = self.accept_rx.lock() => queue,
        };
        tokio::select! {
            biased;
            _ = self.shared.done.wait() => Err(self.shared.closed_error()),
            conn = queue.recv() => match conn {
                Some(conn) => {
                    tracing::trace!(addr = %self.shared.addr, "accepted connection");
                    Ok(conn)
                }
                None => Err(self.shared.closed_error()),
            },
        }
    }

    /// Closes the listener. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for ListenerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerShared")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("closed", &self.done.is_tripped())
            .finish()
    }
}
