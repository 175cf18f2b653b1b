//! Tether Transport - resilient point-to-point TCP/UDP links
//!
//! This crate provides a socket abstraction stronger than raw sockets but
//! lighter than an RPC framework: symmetric [`Client`] and [`Server`]
//! roles over stream (TCP) or datagram (UDP) endpoints, automatic
//! (re)connection with bounded retries, and transfer primitives that
//! guarantee "all requested bytes or a definitive failure".
//!
//! # Overview
//!
//! - **One connection slot per instance.** A client or server talks to
//!   exactly one peer; connecting again implicitly disconnects first, and
//!   a pending attempt rejects a second `connect`.
//! - **Bounded reconnection.** Failed attempts re-resolve the endpoint and
//!   retry after a configurable delay, up to a configurable limit.
//! - **All-or-shortfall transfers.** `send_all`/`recv_all` loop over
//!   partial OS results; transient errors are retried up to the limit,
//!   a zero result is surfaced as [`Transfer::PeerClosed`], and fatal
//!   errors carry their cause.
//! - **Blocking and background forms.** Every transfer operation can be
//!   awaited in place or spawned on its own task, with the result
//!   delivered through a [`TaskHandle`].
//! - **Cooperative cancellation.** `disconnect` stops in-flight loops via
//!   the connection's cancel flag; a caller-owned [`Breaker`] stops one
//!   "all" loop without tearing the connection down.
//!
//! No framing, no encryption, no multiplexing: the transport moves raw
//! bytes between exactly two endpoints.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_transport::{Client, Server, SocketKind, Transfer};
//!
//! let server = Server::new();
//! server.connect_in_background("0.0.0.0", 1313, SocketKind::Stream)?;
//!
//! let client = Client::new();
//! client.connect("127.0.0.1", 1313, SocketKind::Stream).await?;
//!
//! match client.send_all(b"payload", None).await? {
//!     Transfer::Complete(sent) => println!("sent {sent} bytes"),
//!     Transfer::PeerClosed => println!("peer went away"),
//!     Transfer::Interrupted(sent) => println!("stopped after {sent} bytes"),
//! }
//! ```

mod cancel;
mod client;
mod conn;
mod engine;
mod error;
mod link;
mod server;
mod task;

pub use cancel::Breaker;
pub use client::Client;
pub use engine::{Received, Transfer};
pub use error::{Error, Result};
pub use server::Server;
pub use task::TaskHandle;

// Re-export the endpoint vocabulary so callers rarely need tether-resolve
// directly.
pub use tether_resolve::{Endpoint, ResolveError, SocketKind};
