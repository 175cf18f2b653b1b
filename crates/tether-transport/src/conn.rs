//! Connection lifecycle state machine shared by the client and server roles.
//!
//! A connection owns exactly one slot: `Idle`, `Connecting` or `Connected`.
//! All transitions happen under one mutex, so two tasks can never both
//! observe `Idle` and both start connecting. Establishment runs a bounded
//! retry loop: each attempt re-resolves the endpoint, walks the candidate
//! addresses in order and keeps the first that binds or connects; a failed
//! attempt sleeps for the retry delay and tries again until the retry limit
//! is exceeded.
//!
//! Every connect session installs a fresh cancel flag. In-flight loops hold
//! the flag of their own session, so `disconnect` (which sets the current
//! flag) stops exactly the loops that belong to the connection being torn
//! down, and a subsequent connect cannot be cancelled retroactively.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use tether_resolve::{Endpoint, SocketKind};

use crate::cancel::{Breaker, CancelFlag};
use crate::engine::{self, Policy, Received, Transfer};
use crate::error::{Error, Result};
use crate::link::Link;
use crate::task::{self, TaskHandle};

/// Default bound on consecutive failed (re)connection attempts.
pub(crate) const DEFAULT_RETRY_LIMIT: u32 = 10;
/// Default wait between reconnection attempts.
pub(crate) const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);
/// Default backlog for listening sockets.
pub(crate) const DEFAULT_BACKLOG: u32 = 10;

/// Which establishment sequence this instance runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    /// Resolve and connect out to a peer.
    Connect,
    /// Bind locally and wait for a peer (accept, or datagram handshake).
    Listen,
}

/// The single connection slot.
#[derive(Debug)]
enum SlotState {
    Idle,
    Connecting,
    Connected {
        link: Arc<Link>,
        /// Stream servers keep the listening socket alongside the accepted
        /// peer socket for the lifetime of the connection.
        listener: Option<Arc<TcpListener>>,
    },
}

/// Everything guarded by the connection mutex.
#[derive(Debug)]
struct Shared {
    slot: SlotState,
    endpoint: Option<Endpoint>,
    cancel: Arc<CancelFlag>,
    retry_limit: u32,
    retry_delay: Duration,
    backlog: u32,
    io_timeout: Option<Duration>,
    local_addr: Option<SocketAddr>,
}

/// Settings snapshot taken when a connect session begins. Later setter
/// calls affect the next session, not one already in flight.
struct Session {
    endpoint: Endpoint,
    cancel: Arc<CancelFlag>,
    retry_limit: u32,
    retry_delay: Duration,
    backlog: u32,
}

/// Handles of a connection being replaced or torn down.
struct Teardown {
    link: Arc<Link>,
    #[allow(dead_code)]
    listener: Option<Arc<TcpListener>>,
}

/// Result of one successful establishment attempt.
struct Established {
    link: Arc<Link>,
    listener: Option<Arc<TcpListener>>,
    local_addr: SocketAddr,
}

/// How one bind-candidate attempt failed.
enum BindFailure {
    /// This candidate is unusable; try the next one.
    TryNext(std::io::Error),
    /// Stop walking candidates and surface the error.
    Abort(Error),
}

/// The connection core composed by both [`crate::Client`] and
/// [`crate::Server`].
pub(crate) struct Conn {
    role: Role,
    shared: Mutex<Shared>,
    /// Join handles of outstanding background tasks, awaited by
    /// `disconnect` so termination is positively confirmed.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Conn {
    pub(crate) fn new(role: Role) -> Arc<Self> {
        Arc::new(Self {
            role,
            shared: Mutex::new(Shared {
                slot: SlotState::Idle,
                endpoint: None,
                cancel: Arc::new(CancelFlag::default()),
                retry_limit: DEFAULT_RETRY_LIMIT,
                retry_delay: DEFAULT_RETRY_DELAY,
                backlog: DEFAULT_BACKLOG,
                io_timeout: None,
                local_addr: None,
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Establish a connection, blocking the caller until terminal success
    /// or terminal failure.
    pub(crate) async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        let (session, teardown) = self.begin(endpoint)?;
        finish_teardown(teardown).await;
        self.run_attempts(&session).await
    }

    /// Establish a connection on a background task; returns as soon as the
    /// slot has transitioned to `Connecting`.
    pub(crate) fn connect_in_background(self: Arc<Self>, endpoint: Endpoint) -> Result<()> {
        let (session, teardown) = self.begin(endpoint)?;
        let conn = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            finish_teardown(teardown).await;
            match conn.run_attempts(&session).await {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    tracing::debug!("background connect cancelled");
                }
                Err(err) => {
                    tracing::warn!("background connect failed: {}", err);
                }
            }
        });
        self.register_task(handle);
        Ok(())
    }

    /// Disconnect and connect again using the stored endpoint.
    pub(crate) async fn reconnect(&self) -> Result<()> {
        let endpoint = self.stored_endpoint()?;
        self.connect(endpoint).await
    }

    /// Background form of [`Conn::reconnect`].
    pub(crate) fn reconnect_in_background(self: Arc<Self>) -> Result<()> {
        let endpoint = self.stored_endpoint()?;
        self.connect_in_background(endpoint)
    }

    /// Tear the connection down. Idempotent: signals the current session's
    /// cancel flag, performs a best-effort shutdown, drops the handles and
    /// awaits outstanding background tasks.
    pub(crate) async fn disconnect(&self) {
        let teardown = {
            let mut shared = self.shared.lock().unwrap();
            shared.cancel.set();
            shared.local_addr = None;
            match std::mem::replace(&mut shared.slot, SlotState::Idle) {
                SlotState::Connected { link, listener } => Some(Teardown { link, listener }),
                _ => None,
            }
        };
        finish_teardown(teardown).await;
        self.await_tasks().await;
        tracing::debug!("connection is idle");
    }

    fn stored_endpoint(&self) -> Result<Endpoint> {
        self.shared
            .lock()
            .unwrap()
            .endpoint
            .clone()
            .ok_or(Error::EndpointNotSet)
    }

    /// Decide-to-connect transition, atomic under the slot mutex.
    fn begin(&self, endpoint: Endpoint) -> Result<(Session, Option<Teardown>)> {
        let mut shared = self.shared.lock().unwrap();

        let teardown = match &shared.slot {
            SlotState::Connecting => return Err(Error::AlreadyConnecting),
            SlotState::Connected { .. } => {
                // Implicit disconnect: stop loops bound to the old session
                // before replacing it.
                shared.cancel.set();
                match std::mem::replace(&mut shared.slot, SlotState::Connecting) {
                    SlotState::Connected { link, listener } => Some(Teardown { link, listener }),
                    _ => None,
                }
            }
            SlotState::Idle => {
                shared.slot = SlotState::Connecting;
                None
            }
        };

        shared.endpoint = Some(endpoint.clone());
        shared.cancel = Arc::new(CancelFlag::default());
        shared.local_addr = None;

        let session = Session {
            endpoint,
            cancel: Arc::clone(&shared.cancel),
            retry_limit: shared.retry_limit,
            retry_delay: shared.retry_delay,
            backlog: shared.backlog,
        };
        Ok((session, teardown))
    }

    /// The bounded retry loop.
    async fn run_attempts(&self, session: &Session) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            let result = tokio::select! {
                result = self.attempt(session) => result,
                _ = session.cancel.cancelled() => {
                    self.settle_idle(session);
                    return Err(Error::Cancelled);
                }
            };

            let err = match result {
                Ok(established) => match self.publish(session, established) {
                    Ok(()) => {
                        tracing::info!("connected: {}", session.endpoint);
                        return Ok(());
                    }
                    Err(err) => {
                        self.settle_idle(session);
                        return Err(err);
                    }
                },
                Err(err) => err,
            };

            if is_terminal(&err) {
                self.settle_idle(session);
                return Err(err);
            }

            attempts += 1;
            if attempts > session.retry_limit {
                self.settle_idle(session);
                tracing::error!(
                    "giving up on {} after {} attempts",
                    session.endpoint,
                    attempts
                );
                return Err(Error::MaxRetriesReached { attempts });
            }

            tracing::info!(
                "attempt {} for {} failed ({}); retrying in {:?}",
                attempts,
                session.endpoint,
                err,
                session.retry_delay
            );
            tokio::select! {
                _ = tokio::time::sleep(session.retry_delay) => {}
                _ = session.cancel.cancelled() => {
                    self.settle_idle(session);
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// One establishment attempt: resolve, then run the role sequence.
    async fn attempt(&self, session: &Session) -> Result<Established> {
        let candidates = tether_resolve::resolve(&session.endpoint).await?;
        match (self.role, session.endpoint.kind) {
            (Role::Connect, SocketKind::Stream) => self.connect_stream(session, &candidates).await,
            (Role::Connect, SocketKind::Datagram) => {
                self.connect_datagram(session, &candidates).await
            }
            (Role::Listen, SocketKind::Stream) => self.listen_stream(session, &candidates).await,
            (Role::Listen, SocketKind::Datagram) => {
                self.listen_datagram(session, &candidates).await
            }
        }
    }

    async fn connect_stream(
        &self,
        session: &Session,
        candidates: &[SocketAddr],
    ) -> Result<Established> {
        for &addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let link = Link::from_stream(stream)?;
                    return Ok(Established {
                        local_addr: link.local_addr(),
                        link: Arc::new(link),
                        listener: None,
                    });
                }
                Err(err) => tracing::debug!("candidate {} unreachable: {}", addr, err),
            }
        }
        Err(Error::NoReachableCandidate(session.endpoint.to_string()))
    }

    async fn connect_datagram(
        &self,
        session: &Session,
        candidates: &[SocketAddr],
    ) -> Result<Established> {
        for &addr in candidates {
            let bind_addr = unspecified_for(addr);
            let socket = match UdpSocket::bind(bind_addr).await {
                Ok(socket) => socket,
                Err(err) => {
                    tracing::debug!("cannot bind datagram socket for {}: {}", addr, err);
                    continue;
                }
            };
            if let Err(err) = socket.connect(addr).await {
                tracing::debug!("candidate {} unreachable: {}", addr, err);
                continue;
            }
            // Identify ourselves so the listening side learns our address.
            if let Err(err) = socket.send(&tether_wire::HANDSHAKE).await {
                tracing::debug!("handshake to {} failed: {}", addr, err);
                continue;
            }
            let link = Link::from_datagram(socket)?;
            return Ok(Established {
                local_addr: link.local_addr(),
                link: Arc::new(link),
                listener: None,
            });
        }
        Err(Error::NoReachableCandidate(session.endpoint.to_string()))
    }

    async fn listen_stream(
        &self,
        session: &Session,
        candidates: &[SocketAddr],
    ) -> Result<Established> {
        let mut bound = None;
        for &addr in candidates {
            match bind_stream_listener(addr, session.backlog) {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(BindFailure::TryNext(err)) => {
                    tracing::debug!("cannot bind {}: {}", addr, err);
                }
                Err(BindFailure::Abort(err)) => return Err(err),
            }
        }
        let listener =
            bound.ok_or_else(|| Error::NoReachableCandidate(session.endpoint.to_string()))?;

        let local_addr = listener.local_addr()?;
        self.note_local_addr(session, local_addr);
        tracing::info!(
            "listening on {} (backlog {})",
            local_addr,
            session.backlog
        );

        let (stream, peer) = listener.accept().await.map_err(Error::Accept)?;
        tracing::info!("accepted peer {}", peer);

        let link = Link::from_stream(stream)?;
        Ok(Established {
            local_addr,
            link: Arc::new(link),
            listener: Some(Arc::new(listener)),
        })
    }

    async fn listen_datagram(
        &self,
        session: &Session,
        candidates: &[SocketAddr],
    ) -> Result<Established> {
        let mut bound = None;
        for &addr in candidates {
            match bind_datagram_socket(addr) {
                Ok(socket) => {
                    bound = Some(socket);
                    break;
                }
                Err(BindFailure::TryNext(err)) => {
                    tracing::debug!("cannot bind {}: {}", addr, err);
                }
                Err(BindFailure::Abort(err)) => return Err(err),
            }
        }
        let socket =
            bound.ok_or_else(|| Error::NoReachableCandidate(session.endpoint.to_string()))?;

        let local_addr = socket.local_addr()?;
        self.note_local_addr(session, local_addr);
        tracing::info!("awaiting datagram handshake on {}", local_addr);

        let mut buf = [0u8; 32];
        let (len, peer) = socket.recv_from(&mut buf).await.map_err(Error::Accept)?;
        if !tether_wire::is_handshake(&buf[..len]) {
            tracing::warn!("rejected handshake from {} ({} bytes)", peer, len);
            return Err(Error::HandshakeRejected);
        }

        // The peer address is fixed here, once; ordinary receives can never
        // rebind the connection to a different sender.
        socket.connect(peer).await.map_err(Error::Accept)?;
        tracing::info!("datagram peer identified: {}", peer);

        let link = Link::from_datagram(socket)?;
        Ok(Established {
            local_addr,
            link: Arc::new(link),
            listener: None,
        })
    }

    /// Publish a freshly established link, unless this session was
    /// cancelled or superseded while the attempt was in flight.
    fn publish(&self, session: &Session, established: Established) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if !Arc::ptr_eq(&shared.cancel, &session.cancel) || session.cancel.is_set() {
            // Dropping the established handles closes them.
            return Err(Error::Cancelled);
        }
        shared.local_addr = Some(established.local_addr);
        shared.slot = SlotState::Connected {
            link: established.link,
            listener: established.listener,
        };
        Ok(())
    }

    /// Return the slot to `Idle`, unless a newer session owns it.
    fn settle_idle(&self, session: &Session) {
        let mut shared = self.shared.lock().unwrap();
        if Arc::ptr_eq(&shared.cancel, &session.cancel) {
            shared.slot = SlotState::Idle;
            shared.local_addr = None;
        }
    }

    fn note_local_addr(&self, session: &Session, addr: SocketAddr) {
        let mut shared = self.shared.lock().unwrap();
        if Arc::ptr_eq(&shared.cancel, &session.cancel) {
            shared.local_addr = Some(addr);
        }
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Snapshot the live link, the session cancel flag and the transfer
    /// policy, or fail if not connected.
    fn current_link(&self) -> Result<(Arc<Link>, Arc<CancelFlag>, Policy)> {
        let shared = self.shared.lock().unwrap();
        match &shared.slot {
            SlotState::Connected { link, .. } => Ok((
                Arc::clone(link),
                Arc::clone(&shared.cancel),
                Policy {
                    retry_limit: shared.retry_limit,
                    io_timeout: shared.io_timeout,
                },
            )),
            _ => Err(Error::NotConnected),
        }
    }

    pub(crate) async fn send(&self, buf: &[u8]) -> Result<Transfer> {
        let (link, cancel, policy) = self.current_link()?;
        engine::send_one(link.as_ref(), buf, &cancel, policy).await
    }

    pub(crate) async fn recv(&self, buf: &mut [u8]) -> Result<Transfer> {
        let (link, cancel, policy) = self.current_link()?;
        engine::recv_one(link.as_ref(), buf, &cancel, policy).await
    }

    pub(crate) async fn peek(&self, buf: &mut [u8]) -> Result<Transfer> {
        let (link, cancel, policy) = self.current_link()?;
        engine::peek_one(link.as_ref(), buf, &cancel, policy).await
    }

    pub(crate) async fn send_all(&self, buf: &[u8], breaker: Option<&Breaker>) -> Result<Transfer> {
        let (link, cancel, policy) = self.current_link()?;
        engine::send_all(link.as_ref(), buf, breaker, &cancel, policy).await
    }

    pub(crate) async fn recv_all(
        &self,
        buf: &mut [u8],
        breaker: Option<&Breaker>,
    ) -> Result<Transfer> {
        let (link, cancel, policy) = self.current_link()?;
        engine::recv_all(link.as_ref(), buf, breaker, &cancel, policy).await
    }

    pub(crate) fn send_in_background(&self, payload: Bytes) -> Result<TaskHandle<Transfer>> {
        let (link, cancel, policy) = self.current_link()?;
        let (handle, completer) = task::slot();
        let join = tokio::spawn(async move {
            let result = engine::send_one(link.as_ref(), &payload, &cancel, policy).await;
            completer.complete(result);
        });
        self.register_task(join);
        Ok(handle)
    }

    pub(crate) fn send_all_in_background(
        &self,
        payload: Bytes,
        breaker: Option<Breaker>,
    ) -> Result<TaskHandle<Transfer>> {
        let (link, cancel, policy) = self.current_link()?;
        let (handle, completer) = task::slot();
        let join = tokio::spawn(async move {
            let result =
                engine::send_all(link.as_ref(), &payload, breaker.as_ref(), &cancel, policy).await;
            completer.complete(result);
        });
        self.register_task(join);
        Ok(handle)
    }

    pub(crate) fn recv_in_background(&self, len: usize) -> Result<TaskHandle<Received>> {
        let (link, cancel, policy) = self.current_link()?;
        let (handle, completer) = task::slot();
        let join = tokio::spawn(async move {
            let mut data = BytesMut::zeroed(len);
            let result = engine::recv_one(link.as_ref(), &mut data, &cancel, policy)
                .await
                .map(|transfer| {
                    data.truncate(transfer.bytes());
                    Received { data, transfer }
                });
            completer.complete(result);
        });
        self.register_task(join);
        Ok(handle)
    }

    pub(crate) fn recv_all_in_background(
        &self,
        len: usize,
        breaker: Option<Breaker>,
    ) -> Result<TaskHandle<Received>> {
        let (link, cancel, policy) = self.current_link()?;
        let (handle, completer) = task::slot();
        let join = tokio::spawn(async move {
            let mut data = BytesMut::zeroed(len);
            let result =
                engine::recv_all(link.as_ref(), &mut data, breaker.as_ref(), &cancel, policy)
                    .await
                    .map(|transfer| {
                        data.truncate(transfer.bytes());
                        Received { data, transfer }
                    });
            completer.complete(result);
        });
        self.register_task(join);
        Ok(handle)
    }

    fn register_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn await_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!("background task panicked");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Status and configuration
    // ------------------------------------------------------------------

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.shared.lock().unwrap().slot, SlotState::Connected { .. })
    }

    pub(crate) fn is_connecting(&self) -> bool {
        matches!(self.shared.lock().unwrap().slot, SlotState::Connecting)
    }

    pub(crate) fn endpoint(&self) -> Option<Endpoint> {
        self.shared.lock().unwrap().endpoint.clone()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().unwrap().local_addr
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.shared.lock().unwrap().slot {
            SlotState::Connected { link, .. } => Some(link.peer_addr()),
            _ => None,
        }
    }

    pub(crate) fn retry_limit(&self) -> u32 {
        self.shared.lock().unwrap().retry_limit
    }

    pub(crate) fn set_retry_limit(&self, limit: u32) {
        self.shared.lock().unwrap().retry_limit = limit;
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        self.shared.lock().unwrap().retry_delay
    }

    /// Zero is silently ignored, keeping the previous value.
    pub(crate) fn set_retry_delay(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.shared.lock().unwrap().retry_delay = delay;
    }

    pub(crate) fn backlog(&self) -> u32 {
        self.shared.lock().unwrap().backlog
    }

    pub(crate) fn set_backlog(&self, backlog: u32) -> Result<()> {
        if backlog == 0 {
            return Err(Error::InvalidBacklog);
        }
        self.shared.lock().unwrap().backlog = backlog;
        Ok(())
    }

    pub(crate) fn io_timeout(&self) -> Option<Duration> {
        self.shared.lock().unwrap().io_timeout
    }

    pub(crate) fn set_io_timeout(&self, timeout: Option<Duration>) {
        self.shared.lock().unwrap().io_timeout = timeout;
    }
}

/// Best-effort shutdown of a connection being replaced or torn down.
async fn finish_teardown(teardown: Option<Teardown>) {
    if let Some(Teardown { link, .. }) = teardown {
        if let Err(err) = link.shutdown().await {
            tracing::debug!("socket shutdown failed: {}", err);
        }
    }
}

/// Terminal failures are surfaced immediately instead of being retried.
fn is_terminal(err: &Error) -> bool {
    matches!(
        err,
        Error::Resolve(_) | Error::HandshakeRejected | Error::SocketOption(_)
    )
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    if addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

fn socket_domain(addr: SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Bind a listening stream socket with reuse-address set, socket2 first so
/// the options land before the bind.
fn bind_stream_listener(
    addr: SocketAddr,
    backlog: u32,
) -> std::result::Result<TcpListener, BindFailure> {
    let socket = Socket::new(socket_domain(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(BindFailure::TryNext)?;
    socket
        .set_reuse_address(true)
        .map_err(|err| BindFailure::Abort(Error::SocketOption(err)))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| BindFailure::Abort(Error::SocketOption(err)))?;
    socket.bind(&addr.into()).map_err(BindFailure::TryNext)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(|source| BindFailure::Abort(Error::Listen { addr, source }))?;
    TcpListener::from_std(socket.into())
        .map_err(|source| BindFailure::Abort(Error::Listen { addr, source }))
}

/// Bind a datagram socket with reuse-address set.
fn bind_datagram_socket(addr: SocketAddr) -> std::result::Result<UdpSocket, BindFailure> {
    let socket = Socket::new(socket_domain(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(BindFailure::TryNext)?;
    socket
        .set_reuse_address(true)
        .map_err(|err| BindFailure::Abort(Error::SocketOption(err)))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| BindFailure::Abort(Error::SocketOption(err)))?;
    socket.bind(&addr.into()).map_err(BindFailure::TryNext)?;
    UdpSocket::from_std(socket.into()).map_err(|err| BindFailure::Abort(Error::Io(err)))
}
