//! The established-socket abstraction shared by both transport flavours.
//!
//! A [`Link`] is one live peer connection: either the two halves of a TCP
//! stream, or a UDP socket connected to the peer address learned during the
//! handshake. The transfer engine only talks to the [`LinkIo`] trait, which
//! keeps it independent of the flavour and lets the unit tests drive it
//! with a scripted fake.
//!
//! The datagram peer address is fixed once, by `UdpSocket::connect`, when
//! the link is built; ordinary transfers can never rebind the link to a
//! different sender.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;

/// One raw I/O operation against an established link.
///
/// Implementations perform exactly one underlying send/receive; chunking,
/// retries and cancellation live in the transfer engine.
pub(crate) trait LinkIo {
    /// Send once; resolves with the bytes the OS accepted.
    async fn send_once(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive once; resolves with the bytes the OS delivered, 0 meaning
    /// the peer performed an orderly shutdown.
    async fn recv_once(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Receive once without consuming the data.
    async fn peek_once(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug)]
enum LinkKind {
    Stream {
        // Each half behind its own lock so one in-flight send and one
        // in-flight receive can make progress concurrently.
        reader: AsyncMutex<OwnedReadHalf>,
        writer: AsyncMutex<OwnedWriteHalf>,
    },
    Datagram {
        socket: UdpSocket,
    },
}

/// An established connection to one peer.
#[derive(Debug)]
pub(crate) struct Link {
    kind: LinkKind,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Link {
    /// Wrap a connected TCP stream.
    pub(crate) fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            kind: LinkKind::Stream {
                reader: AsyncMutex::new(read_half),
                writer: AsyncMutex::new(write_half),
            },
            local_addr,
            peer_addr,
        })
    }

    /// Wrap a UDP socket already connected to its peer.
    pub(crate) fn from_datagram(socket: UdpSocket) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;

        Ok(Self {
            kind: LinkKind::Datagram { socket },
            local_addr,
            peer_addr,
        })
    }

    /// Local address the link is bound to.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address, fixed when the link was established.
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Best-effort shutdown of the outgoing direction. Datagram links have
    /// nothing to flush, so this is a no-op for them.
    pub(crate) async fn shutdown(&self) -> io::Result<()> {
        match &self.kind {
            LinkKind::Stream { writer, .. } => writer.lock().await.shutdown().await,
            LinkKind::Datagram { .. } => Ok(()),
        }
    }
}

impl LinkIo for Link {
    async fn send_once(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.kind {
            LinkKind::Stream { writer, .. } => writer.lock().await.write(buf).await,
            LinkKind::Datagram { socket } => socket.send(buf).await,
        }
    }

    async fn recv_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.kind {
            LinkKind::Stream { reader, .. } => reader.lock().await.read(buf).await,
            LinkKind::Datagram { socket } => socket.recv(buf).await,
        }
    }

    async fn peek_once(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.kind {
            LinkKind::Stream { reader, .. } => reader.lock().await.peek(buf).await,
            LinkKind::Datagram { socket } => socket.peek_from(buf).await.map(|(len, _)| len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (Link, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Link::from_stream(client).unwrap(), server)
    }

    #[tokio::test]
    async fn test_stream_link_round_trip() {
        let (link, mut peer) = tcp_pair().await;

        assert_eq!(link.send_once(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(link.recv_once(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_stream_link_peek_does_not_consume() {
        let (link, mut peer) = tcp_pair().await;
        peer.write_all(b"data").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(link.peek_once(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"data");

        let mut buf = [0u8; 4];
        assert_eq!(link.recv_once(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_datagram_link_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let link = Link::from_datagram(client).unwrap();

        assert_eq!(link.peer_addr(), server_addr);
        assert_eq!(link.send_once(b"hello").await.unwrap(), 5);

        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, client_addr);

        server.send_to(b"world", from).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(link.recv_once(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
    }

    #[tokio::test]
    async fn test_stream_recv_zero_after_peer_close() {
        let (link, peer) = tcp_pair().await;
        drop(peer);

        let mut buf = [0u8; 8];
        assert_eq!(link.recv_once(&mut buf).await.unwrap(), 0);
    }
}
