//! Shared helpers for the loopback integration tests.

use std::net::TcpListener;
use std::time::{Duration, Instant};

/// Polls `cond` until it returns true, panicking after five seconds.
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Grabs a port the OS considers free right now. The listener is dropped
/// before returning, so the port may be reused by the caller.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}
