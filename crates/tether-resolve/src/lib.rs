//! Endpoint description and address resolution for the Tether transport.
//!
//! An [`Endpoint`] is the (host, port, socket kind) tuple a connection is
//! configured with. [`resolve`] turns it into a finite, ordered list of
//! concrete socket addresses; the connection state machine walks that list
//! and keeps the first candidate that actually binds or connects.
//!
//! Resolution is cheap and is redone on every connection attempt, so there
//! is no caching here. Lookup failures are reported through a dedicated
//! error type so callers can tell a name-service problem apart from a
//! socket-level one.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while resolving an endpoint.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The name or service lookup itself failed.
    #[error("lookup failed for {host}:{port}: {source}")]
    Lookup {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Transport flavour of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    /// Connection-oriented byte stream (TCP).
    Stream,
    /// Connectionless datagrams (UDP).
    Datagram,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Stream => write!(f, "tcp"),
            SocketKind::Datagram => write!(f, "udp"),
        }
    }
}

/// A network destination: host, port and socket kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or literal address.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Stream or datagram transport.
    pub kind: SocketKind,
}

impl Endpoint {
    /// Create an endpoint description.
    pub fn new(host: impl Into<String>, port: u16, kind: SocketKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.kind)
    }
}

/// Resolve an endpoint into its candidate addresses, in resolver order.
///
/// The list is finite and may legitimately be empty; the caller decides how
/// to report "nothing resolved" versus "nothing reachable" after trying the
/// candidates in order.
pub async fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, ResolveError> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|source| ResolveError::Lookup {
            host: endpoint.host.clone(),
            port: endpoint.port,
            source,
        })?
        .collect();

    tracing::debug!(
        "resolved {} into {} candidate(s)",
        endpoint,
        candidates.len()
    );
    Ok(candidates)
}
