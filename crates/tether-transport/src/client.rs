//! The connecting side of a tether link.

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

/// A resilient point-to-point client.
///
/// One `Client` owns one connection slot. `connect` resolves the endpoint
/// and dials the first reachable candidate, retrying with a configurable
/// delay up to a configurable limit; for datagram endpoints it also sends
/// the identification handshake so the server learns our address.
///
/// Every transfer operation comes in a blocking (awaited) and a background
/// form. Background operations each run on their own task and deliver
/// their result through a [`TaskHandle`]. The engine does not serialize
/// overlapping background calls: issuing two concurrent background sends
/// (or two concurrent background receives) on the same connection is a
/// caller error and interleaves unpredictably.
///
/// # Example
///
/// ```rust,ignore
/// use tether_transport::{Client, SocketKind};
///
/// let client = Client::new();
/// client.connect("198.51.100.7", 1313, SocketKind::Stream).await?;
/// client.send_all(b"hello", None).await?;
/// client.disconnect().await;
/// ```
pub struct Client {
    conn: Arc<Conn>,
}

impl Client {
    /// Create an idle client with default settings.
    pub fn new() -> Self {
        Self {
            conn: Conn::new(Role::Connect),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect to a peer, waiting until the connection is established or
    /// the retry budget is exhausted.
    ///
    /// Fails with [`crate::Error::AlreadyConnecting`] while an attempt is
    /// pending; an established connection is implicitly disconnected
    /// first.
    pub async fn connect(&self, host: &str, port: u16, kind: SocketKind) -> Result<()> {
        self.conn.connect(Endpoint::new(host, port, kind)).await
    }

    /// Like [`Client::connect`], but the attempt (including retries) runs
    /// on a background task and this call returns immediately.
    pub fn connect_in_background(&self, host: &str, port: u16, kind: SocketKind) -> Result<()> {
        Arc::clone(&self.conn).connect_in_background(Endpoint::new(host, port, kind))
    }

    /// Disconnect from the peer. Idempotent; stops in-flight connect and
    /// transfer loops and awaits outstanding background tasks.
    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    /// Disconnect, then connect again to the previously configured
    /// endpoint.
    pub async fn reconnect(&self) -> Result<()> {
        self.conn.reconnect().await
    }

    /// Background form of [`Client::reconnect`].
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

    /// Send every byte of `buf`, or report a definitive shortfall. An
    /// optional [`Breaker`] stops the loop early without disconnecting.
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

    /// Background single-shot send. Fails immediately with
    /// [`crate::Error::NotConnected`] (spawning nothing) if there is no
    /// connection.
    pub fn send_in_background(&self, payload: Bytes) -> Result<TaskHandle<Transfer>> {
        self.conn.send_in_background(payload)
    }

    /// Background form of [`Client::send_all`]. The payload is owned by
    /// the task until the result is delivered.
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

    /// Background form of [`Client::recv_all`]; the filled buffer comes
    /// back through the handle.
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

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Whether a connect attempt is currently pending.
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

    /// Local address of the live connection, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    /// Peer address of the live connection, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Bound on consecutive failed (re)connection attempts, and on
    /// consecutive transient transfer failures. Default 10.
    pub fn retry_limit(&self) -> u32 {
        self.conn.retry_limit()
    }

    /// Set the retry limit. Takes effect on the next connect session and
    /// on subsequently issued transfer calls.
    pub fn set_retry_limit(&self, limit: u32) {
        self.conn.set_retry_limit(limit);
    }

    /// Wait between reconnection attempts. Default 5 seconds.
    pub fn retry_delay(&self) -> Duration {
        self.conn.retry_delay()
    }

    /// Set the reconnection delay. Zero is silently ignored.
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

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
