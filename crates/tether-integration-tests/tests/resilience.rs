//! Failure, cancellation, and reconnection scenarios over real sockets.

use std::time::{Duration, Instant};

use tether_integration_tests::{free_port, wait_until};
use tether_transport::{Breaker, Client, Error, Server, SocketKind, Transfer};

async fn tcp_pair() -> (Client, Server) {
    let server = Server::new();
    server
        .connect_in_background("127.0.0.1", 0, SocketKind::Stream)
        .unwrap();
    wait_until("server to bind", || server.local_addr().is_some()).await;
    let port = server.local_addr().unwrap().port();

    let client = Client::new();
    client
        .connect("127.0.0.1", port, SocketKind::Stream)
        .await
        .unwrap();
    wait_until("server to accept", || server.is_connected()).await;
    (client, server)
}

#[tokio::test]
async fn test_refused_connect_exhausts_retries() {
    let client = Client::new();
    client.set_retry_limit(2);
    client.set_retry_delay(Duration::from_millis(10));

    let start = Instant::now();
    let err = client
        .connect("127.0.0.1", free_port(), SocketKind::Stream)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRetriesReached { attempts: 3 }));
    // Two pauses between three attempts.
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(!client.is_connected());
    assert!(!client.is_connecting());
}

#[tokio::test]
async fn test_occupied_port_exhausts_server_retries() {
    let squatter = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = squatter.local_addr().unwrap().port();

    let server = Server::new();
    server.set_retry_limit(1);
    server.set_retry_delay(Duration::from_millis(10));

    let err = server
        .connect("127.0.0.1", port, SocketKind::Stream)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRetriesReached { attempts: 2 }));
}

#[tokio::test]
async fn test_bad_handshake_leaves_server_unconnected() {
    let server = Server::new();
    server
        .connect_in_background("127.0.0.1", 0, SocketKind::Datagram)
        .unwrap();
    wait_until("server to bind", || server.local_addr().is_some()).await;
    let addr = server.local_addr().unwrap();

    let rogue = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    rogue.send_to(b"not the greeting", addr).await.unwrap();

    wait_until("rejection to settle", || !server.is_connecting()).await;
    assert!(!server.is_connected());

    server.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_interrupts_background_receive() {
    let (client, server) = tcp_pair().await;

    let handle = client.recv_all_in_background(1024, None).unwrap();
    // Let the task reach its first blocking read.
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.disconnect().await;

    let received = handle.wait().await.unwrap();
    assert_eq!(received.transfer, Transfer::Interrupted(0));
    assert!(received.data.is_empty());

    server.disconnect().await;
}

#[tokio::test]
async fn test_breaker_interrupts_full_receive() {
    let (client, server) = tcp_pair().await;

    let breaker = Breaker::new();
    let handle = client
        .recv_all_in_background(1024, Some(breaker.clone()))
        .unwrap();

    server.send_all(b"partial", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    breaker.trip();
    // One more byte wakes the blocked read so the loop can observe the trip.
    server.send_all(b"!", None).await.unwrap();

    let received = handle.wait().await.unwrap();
    match received.transfer {
        Transfer::Interrupted(n) => {
            assert!(n >= 1 && n <= 8, "kept {n} bytes");
            assert_eq!(received.data.len(), n);
        }
        other => panic!("expected an interrupted transfer, got {other:?}"),
    }

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_peer_close_surfaces_as_peer_closed() {
    let (client, server) = tcp_pair().await;

    server.disconnect().await;

    let mut buf = [0u8; 8];
    let transfer = client.recv_all(&mut buf, None).await.unwrap();
    assert_eq!(transfer, Transfer::PeerClosed);

    client.disconnect().await;
}

#[tokio::test]
async fn test_transfer_without_connection_is_rejected() {
    let client = Client::new();
    let mut buf = [0u8; 4];
    assert!(matches!(
        client.recv(&mut buf).await.unwrap_err(),
        Error::NotConnected
    ));
    assert!(matches!(
        client.send_in_background(bytes::Bytes::from_static(b"x")),
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let port = free_port();
    let server = Server::new();
    server
        .connect_in_background("127.0.0.1", port, SocketKind::Stream)
        .unwrap();
    wait_until("server to bind", || server.local_addr().is_some()).await;

    let client = Client::new();
    client
        .connect("127.0.0.1", port, SocketKind::Stream)
        .await
        .unwrap();
    wait_until("server to accept", || server.is_connected()).await;

    client.disconnect().await;
    server.disconnect().await;
    assert!(!client.is_connected());

    server.reconnect_in_background().unwrap();
    wait_until("server to listen again", || server.local_addr().is_some()).await;
    client.reconnect().await.unwrap();
    wait_until("server to accept again", || server.is_connected()).await;

    client.send_all(b"again", None).await.unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(
        server.recv_all(&mut buf, None).await.unwrap(),
        Transfer::Complete(5)
    );
    assert_eq!(&buf, b"again");

    client.disconnect().await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_new_connect_replaces_previous_connection() {
    let (client, first_server) = tcp_pair().await;
    let first_peer = client.peer_addr().unwrap();

    let second_server = Server::new();
    second_server
        .connect_in_background("127.0.0.1", 0, SocketKind::Stream)
        .unwrap();
    wait_until("second server to bind", || {
        second_server.local_addr().is_some()
    })
    .await;
    let port = second_server.local_addr().unwrap().port();

    client
        .connect("127.0.0.1", port, SocketKind::Stream)
        .await
        .unwrap();
    wait_until("second server to accept", || second_server.is_connected()).await;
    assert_ne!(client.peer_addr().unwrap(), first_peer);

    // The first peer sees an orderly close.
    let mut buf = [0u8; 4];
    assert_eq!(
        first_server.recv_all(&mut buf, None).await.unwrap(),
        Transfer::PeerClosed
    );

    client.disconnect().await;
    first_server.disconnect().await;
    second_server.disconnect().await;
}
