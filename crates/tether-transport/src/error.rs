//! Error types for tether-transport.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for tether-transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or using a connection.
#[derive(Debug, Error)]
pub enum Error {
    /// A connection attempt is already in flight on this instance.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    /// `reconnect` was called before any endpoint was configured.
    #[error("no endpoint configured; connect must be called first")]
    EndpointNotSet,

    /// The backlog for a listening socket must be positive.
    #[error("backlog must be positive")]
    InvalidBacklog,

    /// Name or service lookup failed.
    #[error(transparent)]
    Resolve(#[from] tether_resolve::ResolveError),

    /// Every resolved candidate failed socket creation, bind or connect.
    #[error("no reachable candidate for {0}")]
    NoReachableCandidate(String),

    /// The bounded reconnection loop gave up.
    #[error("gave up after {attempts} connection attempts")]
    MaxRetriesReached { attempts: u32 },

    /// Applying a socket option failed.
    #[error("failed to set socket option: {0}")]
    SocketOption(#[source] std::io::Error),

    /// Putting the bound socket into listening mode failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for a peer (stream accept, or the datagram identification
    /// step) failed.
    #[error("failed to accept a peer: {0}")]
    Accept(#[source] std::io::Error),

    /// The first datagram from a peer was not the expected handshake.
    #[error("datagram handshake rejected")]
    HandshakeRejected,

    /// A transfer was requested while no connection is established.
    #[error("not connected")]
    NotConnected,

    /// The operation was cancelled by `disconnect`.
    #[error("cancelled by disconnect")]
    Cancelled,

    /// A transfer loop exhausted its transient-failure budget.
    #[error("transfer failed after {attempts} attempts: {source}")]
    TransferFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
