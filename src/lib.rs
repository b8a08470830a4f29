//! # memnet
//!
//! A named, in-process, full-duplex byte-stream transport.
//!
//! `memnet` lets two participants inside the same process exchange bytes
//! over an interface shaped like a real socket (listeners, dialed
//! connections, deadlines, local and remote addresses) without ever
//! touching the operating system's network stack. Servers under test, embedded
//! HTTP or TLS stacks, and anything else that speaks
//! [`AsyncRead`](tokio::io::AsyncRead)/[`AsyncWrite`](tokio::io::AsyncWrite)
//! can be driven over a synthetic channel with real-socket semantics.
//!
//! ## Networks
//!
//! Two reserved networks exist:
//!
//! | Network | Name | Write semantics |
//! |---------|--------|-----------------|
//! | [`Network::Unbuffered`] | `"memu"` | A write is a rendezvous: it completes when the matching peer read takes the bytes. |
//! | [`Network::Buffered`] | `"memb"` | A write is accepted immediately (subject to a configurable limit) and drained to the peer in the background, in order; failures surface on an out-of-band error stream. |
//!
//! Any other network string is rejected, unless an alias maps it onto one
//! of the two (see [`Provider::map_network`]).
//!
//! ## Example
//!
//! ```no_run
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn demo() -> memnet::Result<()> {
//! let listener = memnet::listen("memu", "greeter")?;
//! tokio::spawn(async move {
//!     while let Ok(mut conn) = listener.accept().await {
//!         tokio::spawn(async move {
//!             let mut buf = [0u8; 64];
//!             if let Ok(n) = conn.read(&mut buf).await {
//!                 let _ = conn.write_all(&buf[..n]).await;
//!             }
//!         });
//!     }
//! });
//!
//! let mut conn = memnet::dial("memu", "greeter").await?;
//! conn.write_all(b"hello").await.expect("write");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Core Modules
// =============================================================================

/// Address and network types.
pub mod addr;

/// Error taxonomy and the decorated error carrier.
pub mod error;

/// Connections and the buffered write overlay.
pub mod conn;

/// Listeners and the dial/accept rendezvous.
pub mod listener;

/// The named-endpoint registry and the default provider.
pub mod provider;

// The rendezvous pipe is internal: connections are only ever created in
// pairs through the dial handshake.
mod pipe;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use addr::{Addr, LOCALHOST, NETWORK_BUFFERED, NETWORK_UNBUFFERED, Network};
pub use conn::{Conn, WriteErrors};
pub use error::{ErrorKind, Op, OpError, Result};
pub use listener::Listener;
pub use pipe::latch::Latch;
pub use provider::{Provider, default_provider, dial, listen, map_network};
