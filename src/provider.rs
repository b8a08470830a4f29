//! The named-endpoint registry.
//!
//! A [`Provider`] maps `(network, name)` pairs to listeners, resolves
//! dials to the matching listener's handshake, enforces address
//! uniqueness, and rewrites network names through its alias table. A
//! process-wide default provider backs the crate-level [`listen`],
//! [`dial`], and [`map_network`] functions; tests that need isolation
//! construct their own with [`Provider::new`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use tracing::instrument;

use crate::addr::{Addr, LOCALHOST, Network};
use crate::conn::Conn;
use crate::error::{ErrorKind, Op, OpError, Result};
use crate::listener::{Listener, ListenerShared};
use crate::pipe::latch::Latch;

/// Registry state shared by every clone of a [`Provider`].
pub(crate) struct ProviderInner {
    listeners: RwLock<HashMap<Addr, Arc<ListenerShared>>>,
    aliases: RwLock<HashMap<String, String>>,
    next_listener_id: AtomicU64,
    next_local_name: AtomicU64,
}

impl ProviderInner {
    /// Removes a listener's registry entry, but only if the entry still
    /// belongs to that listener. Called by the listener's own close path,
    /// never with another lock held.
    pub(crate) fn unregister(&self, addr: &Addr, id: u64) {
        let mut listeners = self
            .listeners
            .write()
            .expect("provider listener table poisoned");
        if listeners.get(addr).is_some_and(|entry| entry.id == id) {
            listeners.remove(addr);
        }
    }
}

/// A registry of named in-memory listeners.
///
/// Cloning a provider yields another handle onto the same registry. The
/// registry table takes a read lock for dials and a write lock for
/// listens and removals, so concurrent dial/listen/close traffic against
/// the same names is safe.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Provider {
    /// Creates an empty, private registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                listeners: RwLock::new(HashMap::new()),
                aliases: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(0),
                next_local_name: AtomicU64::new(0),
            }),
        }
    }

    /// Maps dials and listens on the `from` network onto `to` before
    /// lookup, so clients that insist on a canonical network name (an
    /// embedded HTTP client dialing `"tcp"`, say) can be pointed at the
    /// in-memory networks. `None` removes a previous mapping.
    ///
    /// The target is not validated here: a mapping onto an unknown
    /// network surfaces as [`ErrorKind::UnknownNetwork`] at dial or
    /// listen time.
    pub fn map_network(&self, from: impl Into<String>, to: Option<&str>) {
        let mut aliases = self
            .inner
            .aliases
            .write()
            .expect("provider alias table poisoned");
        match to {
            Some(to) => {
                aliases.insert(from.into(), to.to_owned());
            }
            None => {
                aliases.remove(&from.into());
            }
        }
    }

    /// Resolves a network string through the alias table to one of the
    /// reserved networks.
    fn resolve(&self, network: &str) -> Option<Network> {
        let aliases = self
            .inner
            .aliases
            .read()
            .expect("provider alias table poisoned");
        let name = aliases.get(network).map_or(network, String::as_str);
        Network::from_name(name)
    }

    fn resolve_for(
        &self,
        network: &str,
        op: Op,
        source: Option<&Addr>,
        addr: Option<&Addr>,
    ) -> Result<Network> {
        self.resolve(network).ok_or_else(|| {
            OpError::new(
                op,
                network,
                source.cloned(),
                addr.cloned(),
                ErrorKind::UnknownNetwork {
                    network: network.to_owned(),
                },
            )
        })
    }

    /// Announces a listener at `(network, name)`.
    ///
    /// An empty name listens on the reserved `"localhost"` name. Fails
    /// with [`ErrorKind::AddressInUse`] while another listener holds the
    /// same address, and with [`ErrorKind::UnknownNetwork`] for anything
    /// but the reserved networks (after alias resolution).
    #[instrument(skip(self))]
    pub fn listen(&self, network: &str, name: &str) -> Result<Listener> {
        let net = self.resolve_for(network, Op::Listen, None, None)?;
        let name = if name.is_empty() { LOCALHOST } else { name };
        self.listen_resolved(network, Addr::new(net, name))
    }

    /// Announces a listener at an explicit address.
    ///
    /// `None` listens on `"localhost"`. The address's network must agree
    /// with the (alias-resolved) `network` argument.
    #[instrument(skip(self))]
    pub fn listen_addr(&self, network: &str, laddr: Option<Addr>) -> Result<Listener> {
        let net = self.resolve_for(network, Op::Listen, laddr.as_ref(), laddr.as_ref())?;
        let laddr = laddr.unwrap_or_else(|| Addr::new(net, LOCALHOST));
        if laddr.network() != net {
            return Err(OpError::new(
                Op::Listen,
                network,
                Some(laddr.clone()),
                Some(laddr),
                ErrorKind::IncompatibleAddress { side: "local" },
            ));
        }
        self.listen_resolved(network, laddr)
    }

    fn listen_resolved(&self, network: &str, laddr: Addr) -> Result<Listener> {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .expect("provider listener table poisoned");
        if listeners.contains_key(&laddr) {
            return Err(OpError::new(
                Op::Listen,
                network,
                Some(laddr.clone()),
                Some(laddr),
                ErrorKind::AddressInUse,
            ));
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (listener, shared) = Listener::announce(laddr.clone(), id, Arc::downgrade(&self.inner));
        listeners.insert(laddr.clone(), shared);
        drop(listeners);
        tracing::debug!(addr = %laddr, net = %laddr.network(), "listener announced");
        Ok(listener)
    }

    /// Dials the listener at `(network, name)`.
    ///
    /// An empty name dials the reserved `"localhost"` name. The dialer's
    /// local address is synthesized from a monotone counter. Fails with
    /// [`ErrorKind::AddressNotFound`] when no listener holds the address,
    /// and with [`ErrorKind::ListenerClosed`] when the listener closes
    /// mid-handshake. Dropping the returned future aborts the handshake
    /// cleanly.
    #[instrument(skip(self))]
    pub async fn dial(&self, network: &str, name: &str) -> Result<Conn> {
        let net = self.resolve_for(network, Op::Dial, None, None)?;
        let name = if name.is_empty() { LOCALHOST } else { name };
        self.dial_resolved(net, None, Addr::new(net, name), None)
            .await
    }

    /// Dials with explicit addresses.
    ///
    /// `laddr: None` synthesizes a local name; `raddr: None` dials
    /// `"localhost"`. Both addresses must agree with the (alias-resolved)
    /// network.
    #[instrument(skip(self))]
    pub async fn dial_addr(
        &self,
        network: &str,
        laddr: Option<Addr>,
        raddr: Option<Addr>,
    ) -> Result<Conn> {
        let net = self.resolve_for(network, Op::Dial, laddr.as_ref(), raddr.as_ref())?;
        let raddr = raddr.unwrap_or_else(|| Addr::new(net, LOCALHOST));
        self.dial_resolved(net, laddr, raddr, None).await
    }

    /// Dials with an external cancellation latch: tripping `cancel`
    /// aborts the handshake with [`ErrorKind::Cancelled`].
    #[instrument(skip(self, cancel))]
    pub async fn dial_cancel(&self, network: &str, name: &str, cancel: &Latch) -> Result<Conn> {
        let net = self.resolve_for(network, Op::Dial, None, None)?;
        let name = if name.is_empty() { LOCALHOST } else { name };
        self.dial_resolved(net, None, Addr::new(net, name), Some(cancel))
            .await
    }

    async fn dial_resolved(
        &self,
        net: Network,
        laddr: Option<Addr>,
        raddr: Addr,
        cancel: Option<&Latch>,
    ) -> Result<Conn> {
        let laddr = laddr.unwrap_or_else(|| Addr::new(net, self.next_local_name()));
        if laddr.network() != net {
            return Err(OpError::new(
                Op::Dial,
                net.as_str(),
                Some(laddr),
                Some(raddr),
                ErrorKind::IncompatibleAddress { side: "local" },
            ));
        }
        if raddr.network() != net {
            return Err(OpError::new(
                Op::Dial,
                net.as_str(),
                Some(laddr),
                Some(raddr),
                ErrorKind::IncompatibleAddress { side: "remote" },
            ));
        }

        // Clone the handle out and handshake lock-free, so a concurrent
        // close (which takes the write lock) can never deadlock against a
        // dial parked in the rendezvous.
        let listener = {
            let listeners = self
                .inner
                .listeners
                .read()
                .expect("provider listener table poisoned");
            listeners.get(&raddr).cloned()
        };
        match listener {
            Some(listener) => listener.dial(laddr, raddr, cancel).await,
            None => Err(OpError::new(
                Op::Dial,
                net.as_str(),
                Some(laddr),
                Some(raddr),
                ErrorKind::AddressNotFound,
            )),
        }
    }

    /// Synthesizes a dialer-side local name. Monotone within this
    /// provider; uniqueness is a convenience, not a contract.
    fn next_local_name(&self) -> String {
        let n = self.inner.next_local_name.fetch_add(1, Ordering::Relaxed) + 1;
        n.to_string()
    }
}

impl Default for Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self
            .inner
            .listeners
            .read()
            .expect("provider listener table poisoned");
        f.debug_struct("Provider")
            .field("listeners", &listeners.len())
            .finish()
    }
}

static DEFAULT_PROVIDER: LazyLock<Provider> = LazyLock::new(Provider::new);

/// The process-wide default provider behind the crate-level functions.
pub fn default_provider() -> &'static Provider {
    &DEFAULT_PROVIDER
}

/// Announces a listener on the default provider. See [`Provider::listen`].
pub fn listen(network: &str, name: &str) -> Result<Listener> {
    default_provider().listen(network, name)
}

/// Dials through the default provider. See [`Provider::dial`].
pub async fn dial(network: &str, name: &str) -> Result<Conn> {
    default_provider().dial(network, name).await
}

/// Installs a network alias on the default provider. See
/// [`Provider::map_network`].
pub fn map_network(from: impl Into<String>, to: Option<&str>) {
    default_provider().map_network(from, to);
}
