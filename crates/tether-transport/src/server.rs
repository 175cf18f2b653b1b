//! The listening side of a tether link.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tether_resolve::{Endpoint, SocketKind};

use crate::cancel::Breaker;
use crate::conn::{Conn, Role};
use crate::engine::{Received, Transfer};
use crate::error::Result;
use crate::task::TaskHandle;

/// A resilient point-to-point server.
///
/// A `Server` composes the same connection core as [`crate::Client`]; only
/// the establishment sequence differs. For stream endpoints `connect`
/// binds, listens and waits for one accepted peer, keeping the listening
/// socket alongside the peer socket. For datagram endpoints it binds and
/// waits for the 11-byte identification handshake, after which the peer
/// address is fixed; a datagram with any other content is rejected and the
/// server stays unconnected.
///
/// One connection slot, one peer at a time. Transfer operations and their
/// caller obligations are identical to the client's.
pub struct Server {
    conn: Arc<Conn>,
}

impl Server {
    /// Create an idle server with default settings.
    pub fn new() -> Self {
        Self {
            conn: Conn::new(Role::Listen),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind to `host:port` and wait for one peer, retrying failed binds
    /// with the configured delay up to the retry limit. Blocks until a
    /// peer is connected or the attempt fails terminally.
    ///
    /// Port 0 asks the OS for a free port; [`Server::local_addr`] reports
    /// the bound address as soon as the listener is up.
    pub async fn connect(&self, host: &str, port: u16, kind: SocketKind) -> Result<()> {
        self.conn.connect(Endpoint::new(host, port, kind)).await
    }

    /// Like [`Server::connect`], but binding and waiting for the peer run
    /// on a background task and this call returns immediately.
    pub fn connect_in_background(&self, host: &str, port: u16, kind: SocketKind) -> Result<()> {
        Arc::clone(&self.conn).connect_in_background(Endpoint::new(host, port, kind))
    }

    /// Disconnect from the peer and close the listening socket.
    /// Idempotent.
    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    /// Disconnect, then bind and await a peer again on the previously
    /// configured endpoint.
    pub async fn reconnect(&self) -> Result<()> {
        self.conn.reconnect().await
    }

    /// Background form of [`Server::reconnect`].
    pub fn reconnect_in_background(&self) -> Result<()> {
        Arc::clone(&self.conn).reconnect_in_background()
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Send once: a single underlying call, no retry loop.
    pub async fn send(&self, buf: &[u8]) -> Result<Transfer> {
        self.conn.send(buf).await
    }

    /// Send every byte of `buf`, or report a definitive shortfall.
    pub async fn send_all(&self, buf: &[u8], breaker: Option<&Breaker>) -> Result<Transfer> {
        self.conn.send_all(buf, breaker).await
    }

    /// Receive once: a single underlying call, no retry loop.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Transfer> {
        self.conn.recv(buf).await
    }

    /// Fill every byte of `buf`, or report a definitive shortfall.
    pub async fn recv_all(&self, buf: &mut [u8], breaker: Option<&Breaker>) -> Result<Transfer> {
        self.conn.recv_all(buf, breaker).await
    }

    /// Receive once without consuming the queued data.
    pub async fn peek(&self, buf: &mut [u8]) -> Result<Transfer> {
        self.conn.peek(buf).await
    }

    /// Background single-shot send.
    pub fn send_in_background(&self, payload: Bytes) -> Result<TaskHandle<Transfer>> {
        self.conn.send_in_background(payload)
    }

    /// Background form of [`Server::send_all`].
    pub fn send_all_in_background(
        &self,
        payload: Bytes,
        breaker: Option<Breaker>,
    ) -> Result<TaskHandle<Transfer>> {
        self.conn.send_all_in_background(payload, breaker)
    }

    /// Background single-shot receive of up to `len` bytes.
    pub fn recv_in_background(&self, len: usize) -> Result<TaskHandle<Received>> {
        self.conn.recv_in_background(len)
    }

    /// Background form of [`Server::recv_all`].
    pub fn recv_all_in_background(
        &self,
        len: usize,
        breaker: Option<Breaker>,
    ) -> Result<TaskHandle<Received>> {
        self.conn.recv_all_in_background(len, breaker)
    }

    // ------------------------------------------------------------------
    // Status and configuration
    // ------------------------------------------------------------------

    /// Whether a peer is currently connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Whether the server is currently binding or waiting for a peer.
    pub fn is_connecting(&self) -> bool {
        self.conn.is_connecting()
    }

    /// Host of the configured endpoint, if any.
    pub fn host(&self) -> Option<String> {
        self.conn.endpoint().map(|endpoint| endpoint.host)
    }

    /// Port of the configured endpoint, if any.
    pub fn port(&self) -> Option<u16> {
        self.conn.endpoint().map(|endpoint| endpoint.port)
    }

    /// Bound local address, available from the moment the listener is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    /// Address of the connected (or identified) peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Maximum pending connections on the listening socket. Default 10.
    pub fn backlog(&self) -> u32 {
        self.conn.backlog()
    }

    /// Set the listen backlog; must be positive. Takes effect on the next
    /// connect session.
    pub fn set_backlog(&self, backlog: u32) -> Result<()> {
        self.conn.set_backlog(backlog)
    }

    /// Bound on consecutive failed attempts, shared with the transfer
    /// engine. Default 10.
    pub fn retry_limit(&self) -> u32 {
        self.conn.retry_limit()
    }

    /// Set the retry limit.
    pub fn set_retry_limit(&self, limit: u32) {
        self.conn.set_retry_limit(limit);
    }

    /// Wait between bind/accept retries. Default 5 seconds.
    pub fn retry_delay(&self) -> Duration {
        self.conn.retry_delay()
    }

    /// Set the retry delay. Zero is silently ignored.
    pub fn set_retry_delay(&self, delay: Duration) {
        self.conn.set_retry_delay(delay);
    }

    /// Optional per-call I/O timeout; an elapse counts as a transient
    /// transfer failure. Default none.
    pub fn io_timeout(&self) -> Option<Duration> {
        self.conn.io_timeout()
    }

    /// Set or clear the I/O timeout.
    pub fn set_io_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_io_timeout(timeout);
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
