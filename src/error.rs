//! Error types for in-memory transport operations.
//!
//! Every user-visible failure is an [`OpError`]: the operation that failed,
//! the network it ran on, the source and destination addresses involved,
//! and an [`ErrorKind`] naming the actual fault. The carrier converts into
//! [`std::io::Error`] for the `AsyncRead`/`AsyncWrite` surfaces.

use std::fmt;
use std::io;

use crate::addr::Addr;

/// The operation an [`OpError`] was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Announcing a listener.
    Listen,
    /// Dialing a remote endpoint.
    Dial,
    /// Accepting a connection from a listener.
    Accept,
    /// Reading from a connection.
    Read,
    /// Writing to a connection.
    Write,
    /// Installing a read deadline.
    SetReadDeadline,
    /// Installing a write deadline.
    SetWriteDeadline,
}

impl Op {
    /// The operation's wire-stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Listen => "listen",
            Op::Dial => "dial",
            Op::Accept => "accept",
            Op::Read => "read",
            Op::Write => "write",
            Op::SetReadDeadline => "setReadDeadline",
            Op::SetWriteDeadline => "setWriteDeadline",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fault taxonomy for in-memory transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// The network string is not one of the reserved values, after alias
    /// resolution.
    #[error("unknown network {network}")]
    UnknownNetwork {
        /// The unrecognized network string.
        network: String,
    },

    /// An address's network disagrees with the network the operation was
    /// asked to run on.
    #[error("incompatible network and {side} address")]
    IncompatibleAddress {
        /// Which address disagreed: `"local"` or `"remote"`.
        side: &'static str,
    },

    /// Listen on a `(network, name)` pair that is already registered.
    #[error("address already in use")]
    AddressInUse,

    /// Dial to a `(network, name)` pair with no registered listener.
    #[error("unknown remote address")]
    AddressNotFound,

    /// Accept after the listener closed, or a dial handshake that lost the
    /// race against the listener closing.
    #[error("listener closed")]
    ListenerClosed,

    /// Read or write after the local or peer side of the pipe closed.
    #[error("closed pipe")]
    ClosedPipe,

    /// A deadline tripped while the operation was in flight.
    #[error("i/o timeout")]
    Timeout,

    /// An external cancellation aborted a dial handshake.
    #[error("dial cancelled")]
    Cancelled,

    /// A buffered write was issued with a chunk size larger than the
    /// buffer limit.
    #[error("write buffer chunk exceeds buffer limit")]
    InvalidWriteBuffer,
}

impl ErrorKind {
    /// Whether this kind is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }
}

/// A decorated transport error: which operation failed, on which network,
/// between which addresses, and why.
///
/// `source` and `addr` are optional because some registry-level failures
/// (for example an unknown network) can occur before either address has
/// been resolved.
#[derive(Debug, Clone)]
pub struct OpError {
    /// The operation that failed.
    pub op: Op,
    /// The network the operation ran on.
    pub net: String,
    /// The local address, when known.
    pub source: Option<Addr>,
    /// The remote address (or the listener's own address for accept),
    /// when known.
    pub addr: Option<Addr>,
    /// What actually went wrong.
    pub kind: ErrorKind,
}

impl OpError {
    /// Builds a decorated error.
    pub(crate) fn new(
        op: Op,
        net: impl Into<String>,
        source: Option<Addr>,
        addr: Option<Addr>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            op,
            net: net.into(),
            source,
            addr,
            kind,
        }
    }

    /// The fault behind this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.net)?;
        match (&self.source, &self.addr) {
            (Some(source), Some(addr)) => write!(f, " {source}->{addr}")?,
            (Some(source), None) => write!(f, " {source}")?,
            (None, Some(addr)) => write!(f, " ->{addr}")?,
            (None, None) => {}
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<OpError> for io::Error {
    fn from(err: OpError) -> Self {
        let kind = match err.kind {
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            ErrorKind::ClosedPipe => io::ErrorKind::BrokenPipe,
            ErrorKind::ListenerClosed => io::ErrorKind::ConnectionAborted,
            ErrorKind::Cancelled => io::ErrorKind::Interrupted,
            ErrorKind::AddressInUse => io::ErrorKind::AddrInUse,
            ErrorKind::AddressNotFound => io::ErrorKind::AddrNotAvailable,
            ErrorKind::UnknownNetwork { .. }
            | ErrorKind::IncompatibleAddress { .. }
            | ErrorKind::InvalidWriteBuffer => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}

/// Result alias for in-memory transport operations.
pub type Result<T> = std::result::Result<T, OpError>;
