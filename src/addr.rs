//! Address types for in-memory endpoints.
//!
//! An [`Addr`] is the `(network, name)` pair that identifies one side of an
//! in-memory connection. The network decides whether writes on that side go
//! through the asynchronous write buffer; the name is an opaque label used
//! to look listeners up in a [`Provider`](crate::Provider).

use std::fmt;

/// Canonical string form of the unbuffered network.
pub const NETWORK_UNBUFFERED: &str = "memu";

/// Canonical string form of the buffered network.
pub const NETWORK_BUFFERED: &str = "memb";

/// Reserved endpoint name used when a listen or dial call omits the name.
pub const LOCALHOST: &str = "localhost";

/// The two in-memory network flavors.
///
/// `Unbuffered` connections hand bytes to the peer through a synchronous
/// rendezvous: a write blocks until the matching read arrives. `Buffered`
/// connections accept writes immediately and drain them to the peer in the
/// background, reporting failures on an out-of-band error stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Synchronous rendezvous writes (`"memu"`).
    Unbuffered,
    /// Asynchronous buffered writes (`"memb"`).
    Buffered,
}

impl Network {
    /// Returns the canonical string form of this network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Unbuffered => NETWORK_UNBUFFERED,
            Network::Buffered => NETWORK_BUFFERED,
        }
    }

    /// Whether endpoints on this network buffer their writes.
    pub fn is_buffered(&self) -> bool {
        matches!(self, Network::Buffered)
    }

    /// Parses a canonical network string. Anything other than the two
    /// reserved values is unknown.
    pub(crate) fn from_name(name: &str) -> Option<Network> {
        match name {
            NETWORK_UNBUFFERED => Some(Network::Unbuffered),
            NETWORK_BUFFERED => Some(Network::Buffered),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The address of an in-memory endpoint.
///
/// Addresses are plain values: equality and hashing cover both the network
/// and the name, and the registry keys listeners by the full pair. The
/// network is a property of the address itself, not just of the listener
/// that announced it, which is what lets a single dial handshake attach a
/// write buffer to exactly the sides whose address asks for one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    network: Network,
    name: String,
}

impl Addr {
    /// Creates an address on the given network.
    pub fn new(network: Network, name: impl Into<String>) -> Self {
        Self {
            network,
            name: name.into(),
        }
    }

    /// Creates an unbuffered (`"memu"`) address.
    pub fn unbuffered(name: impl Into<String>) -> Self {
        Self::new(Network::Unbuffered, name)
    }

    /// Creates a buffered (`"memb"`) address.
    pub fn buffered(name: impl Into<String>) -> Self {
        Self::new(Network::Buffered, name)
    }

    /// The address's network.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The address's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether endpoints at this address buffer their writes.
    pub fn is_buffered(&self) -> bool {
        self.network.is_buffered()
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
