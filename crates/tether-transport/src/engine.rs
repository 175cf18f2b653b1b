//! Chunked transfer loops and the shared error-classification policy.
//!
//! Every transfer variant classifies the result of one underlying I/O call
//! the same way:
//!
//! - `Ok(0)` — the peer performed an orderly shutdown. Not an error; the
//!   loop ends immediately with [`Transfer::PeerClosed`], discarding any
//!   partial total.
//! - `Err(_)` — transient. The loop pauses briefly and retries the same
//!   chunk; after `retry_limit` consecutive failures the error becomes
//!   fatal and no further call is attempted.
//! - `Ok(n)` — progress. The "all" loops accumulate until the requested
//!   size is moved.
//!
//! A zero-sized request is always a no-op: it succeeds with zero bytes and
//! never touches the OS.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;

use crate::cancel::{Breaker, CancelFlag};
use crate::error::{Error, Result};
use crate::link::LinkIo;

/// Pause between transient-failure retries.
const RETRY_PAUSE: Duration = Duration::from_millis(5);

/// Terminal outcome of a transfer call that did not fail fatally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// The call moved this many bytes. For the "all" variants this equals
    /// the requested size; for single-shot calls it is whatever the one
    /// underlying call moved.
    Complete(usize),
    /// The peer performed an orderly shutdown. Reported instead of any
    /// partial total.
    PeerClosed,
    /// A breaker or `disconnect` stopped the loop early; carries the bytes
    /// moved before the stop was observed.
    Interrupted(usize),
}

impl Transfer {
    /// Bytes moved by the call. `PeerClosed` counts as zero.
    pub fn bytes(&self) -> usize {
        match self {
            Transfer::Complete(count) | Transfer::Interrupted(count) => *count,
            Transfer::PeerClosed => 0,
        }
    }

    /// Whether the call moved everything it set out to move.
    pub fn is_complete(&self) -> bool {
        matches!(self, Transfer::Complete(_))
    }
}

/// Buffer handed back by a background receive once its task completes.
#[derive(Debug)]
pub struct Received {
    /// The received bytes, truncated to what was actually delivered.
    pub data: BytesMut,
    /// How the receive ended.
    pub transfer: Transfer,
}

/// Retry and timeout knobs, snapshotted per call from the connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Policy {
    pub(crate) retry_limit: u32,
    pub(crate) io_timeout: Option<Duration>,
}

/// Result of one guarded underlying call.
enum Step {
    Done(usize),
    Cancelled,
    Failed(io::Error),
}

/// Run one underlying call, guarded by the optional I/O timeout and raced
/// against the session cancel flag. A timeout elapse is a transient I/O
/// failure like any other.
async fn one_call<F>(io: F, cancel: &CancelFlag, io_timeout: Option<Duration>) -> Step
where
    F: Future<Output = io::Result<usize>>,
{
    let guarded = async {
        match io_timeout {
            Some(limit) => match tokio::time::timeout(limit, io).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout elapsed")),
            },
            None => io.await,
        }
    };

    tokio::select! {
        result = guarded => match result {
            Ok(moved) => Step::Done(moved),
            Err(err) => Step::Failed(err),
        },
        _ = cancel.cancelled() => Step::Cancelled,
    }
}

/// Single-shot send: one underlying call, no retry loop.
pub(crate) async fn send_one<L: LinkIo>(
    link: &L,
    buf: &[u8],
    cancel: &CancelFlag,
    policy: Policy,
) -> Result<Transfer> {
    if buf.is_empty() {
        return Ok(Transfer::Complete(0));
    }
    match one_call(link.send_once(buf), cancel, policy.io_timeout).await {
        Step::Done(0) => Ok(Transfer::PeerClosed),
        Step::Done(sent) => Ok(Transfer::Complete(sent)),
        Step::Cancelled => Ok(Transfer::Interrupted(0)),
        Step::Failed(err) => Err(Error::Io(err)),
    }
}

/// Single-shot receive: one underlying call, no retry loop.
pub(crate) async fn recv_one<L: LinkIo>(
    link: &L,
    buf: &mut [u8],
    cancel: &CancelFlag,
    policy: Policy,
) -> Result<Transfer> {
    if buf.is_empty() {
        return Ok(Transfer::Complete(0));
    }
    match one_call(link.recv_once(buf), cancel, policy.io_timeout).await {
        Step::Done(0) => Ok(Transfer::PeerClosed),
        Step::Done(received) => Ok(Transfer::Complete(received)),
        Step::Cancelled => Ok(Transfer::Interrupted(0)),
        Step::Failed(err) => Err(Error::Io(err)),
    }
}

/// Single-shot receive that leaves the data queued.
pub(crate) async fn peek_one<L: LinkIo>(
    link: &L,
    buf: &mut [u8],
    cancel: &CancelFlag,
    policy: Policy,
) -> Result<Transfer> {
    if buf.is_empty() {
        return Ok(Transfer::Complete(0));
    }
    match one_call(link.peek_once(buf), cancel, policy.io_timeout).await {
        Step::Done(0) => Ok(Transfer::PeerClosed),
        Step::Done(received) => Ok(Transfer::Complete(received)),
        Step::Cancelled => Ok(Transfer::Interrupted(0)),
        Step::Failed(err) => Err(Error::Io(err)),
    }
}

/// Send every byte of `buf`, or report a definitive shortfall.
pub(crate) async fn send_all<L: LinkIo>(
    link: &L,
    buf: &[u8],
    breaker: Option<&Breaker>,
    cancel: &CancelFlag,
    policy: Policy,
) -> Result<Transfer> {
    if buf.is_empty() {
        return Ok(Transfer::Complete(0));
    }

    let mut total = 0usize;
    let mut failures = 0u32;

    while total < buf.len() {
        if breaker.is_some_and(|b| b.is_tripped()) || cancel.is_set() {
            return Ok(Transfer::Interrupted(total));
        }

        match one_call(link.send_once(&buf[total..]), cancel, policy.io_timeout).await {
            Step::Done(0) => return Ok(Transfer::PeerClosed),
            Step::Done(sent) => {
                total += sent;
                failures = 0;
            }
            Step::Cancelled => return Ok(Transfer::Interrupted(total)),
            Step::Failed(err) => {
                failures += 1;
                tracing::warn!(
                    "send failed ({}/{} consecutive): {}",
                    failures,
                    policy.retry_limit,
                    err
                );
                if failures >= policy.retry_limit {
                    return Err(Error::TransferFailed {
                        attempts: failures,
                        source: err,
                    });
                }
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }
    Ok(Transfer::Complete(total))
}

/// Fill every byte of `buf`, or report a definitive shortfall.
///
/// A zero-byte result always yields [`Transfer::PeerClosed`], never a
/// partial total, no matter how much was accumulated before it.
pub(crate) async fn recv_all<L: LinkIo>(
    link: &L,
    buf: &mut [u8],
    breaker: Option<&Breaker>,
    cancel: &CancelFlag,
    policy: Policy,
) -> Result<Transfer> {
    if buf.is_empty() {
        return Ok(Transfer::Complete(0));
    }

    let len = buf.len();
    let mut total = 0usize;
    let mut failures = 0u32;

    while total < len {
        if breaker.is_some_and(|b| b.is_tripped()) || cancel.is_set() {
            return Ok(Transfer::Interrupted(total));
        }

        match one_call(link.recv_once(&mut buf[total..]), cancel, policy.io_timeout).await {
            Step::Done(0) => return Ok(Transfer::PeerClosed),
            Step::Done(received) => {
                total += received;
                failures = 0;
            }
            Step::Cancelled => return Ok(Transfer::Interrupted(total)),
            Step::Failed(err) => {
                failures += 1;
                tracing::warn!(
                    "receive failed ({}/{} consecutive): {}",
                    failures,
                    policy.retry_limit,
                    err
                );
                if failures >= policy.retry_limit {
                    return Err(Error::TransferFailed {
                        attempts: failures,
                        source: err,
                    });
                }
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }
    Ok(Transfer::Complete(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const TEST_POLICY: Policy = Policy {
        retry_limit: 10,
        io_timeout: None,
    };

    /// One scripted response from the fake link.
    enum Action {
        /// Return `Ok(n)` (capped at the chunk the engine asked for).
        Give(usize),
        /// Return a transient error.
        Fail,
        /// Return `Ok(n)` and trip the link's breaker afterwards.
        GiveThenTrip(usize),
        /// Never resolve; only an I/O timeout can unblock the engine.
        Hang,
    }

    struct ScriptedLink {
        script: Mutex<VecDeque<Action>>,
        calls: AtomicUsize,
        breaker: Breaker,
    }

    impl ScriptedLink {
        fn new(script: Vec<Action>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                breaker: Breaker::new(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn next(&self, cap: usize) -> io::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let action = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted: engine made an unexpected call");
            match action {
                Action::Give(count) => Ok(count.min(cap)),
                Action::Fail => Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "scripted failure",
                )),
                Action::GiveThenTrip(count) => {
                    self.breaker.trip();
                    Ok(count.min(cap))
                }
                Action::Hang => std::future::pending().await,
            }
        }
    }

    impl LinkIo for ScriptedLink {
        async fn send_once(&self, buf: &[u8]) -> io::Result<usize> {
            self.next(buf.len()).await
        }

        async fn recv_once(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.next(buf.len()).await
        }

        async fn peek_once(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.next(buf.len()).await
        }
    }

    #[tokio::test]
    async fn test_zero_size_is_a_no_op() {
        let link = ScriptedLink::new(vec![]);
        let cancel = CancelFlag::default();

        let sent = send_all(&link, &[], None, &cancel, TEST_POLICY).await.unwrap();
        assert_eq!(sent, Transfer::Complete(0));

        let mut buf = [0u8; 0];
        let received = recv_all(&link, &mut buf, None, &cancel, TEST_POLICY)
            .await
            .unwrap();
        assert_eq!(received, Transfer::Complete(0));

        let single = send_one(&link, &[], &cancel, TEST_POLICY).await.unwrap();
        assert_eq!(single, Transfer::Complete(0));

        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn test_send_all_aggregates_partial_transfers() {
        let link = ScriptedLink::new(vec![Action::Give(300), Action::Give(400), Action::Give(300)]);
        let cancel = CancelFlag::default();
        let buf = vec![0u8; 1000];

        let sent = send_all(&link, &buf, None, &cancel, TEST_POLICY).await.unwrap();

        assert_eq!(sent, Transfer::Complete(1000));
        assert_eq!(link.calls(), 3);
    }

    #[tokio::test]
    async fn test_recv_all_zero_result_discards_partial_total() {
        let link = ScriptedLink::new(vec![Action::Give(300), Action::Give(0)]);
        let cancel = CancelFlag::default();
        let mut buf = vec![0u8; 1000];

        let received = recv_all(&link, &mut buf, None, &cancel, TEST_POLICY)
            .await
            .unwrap();

        assert_eq!(received, Transfer::PeerClosed);
        assert_eq!(received.bytes(), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_stops_calling() {
        let link = ScriptedLink::new(vec![Action::Fail, Action::Fail, Action::Fail]);
        let cancel = CancelFlag::default();
        let policy = Policy {
            retry_limit: 3,
            io_timeout: None,
        };
        let buf = vec![0u8; 100];

        let err = send_all(&link, &buf, None, &cancel, policy).await.unwrap_err();

        assert!(matches!(err, Error::TransferFailed { attempts: 3, .. }));
        // Exactly retry_limit calls; no further syscall after the budget.
        assert_eq!(link.calls(), 3);
    }

    #[tokio::test]
    async fn test_progress_resets_the_failure_counter() {
        let link = ScriptedLink::new(vec![
            Action::Fail,
            Action::Give(1),
            Action::Fail,
            Action::Give(1),
        ]);
        let cancel = CancelFlag::default();
        let policy = Policy {
            retry_limit: 2,
            io_timeout: None,
        };
        let buf = vec![0u8; 2];

        let sent = send_all(&link, &buf, None, &cancel, policy).await.unwrap();

        assert_eq!(sent, Transfer::Complete(2));
        assert_eq!(link.calls(), 4);
    }

    #[tokio::test]
    async fn test_pre_tripped_breaker_prevents_any_call() {
        let link = ScriptedLink::new(vec![]);
        let cancel = CancelFlag::default();
        let breaker = Breaker::new();
        breaker.trip();
        let buf = vec![0u8; 100];

        let sent = send_all(&link, &buf, Some(&breaker), &cancel, TEST_POLICY)
            .await
            .unwrap();

        assert_eq!(sent, Transfer::Interrupted(0));
        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn test_breaker_tripped_mid_loop_reports_partial_total() {
        let link = ScriptedLink::new(vec![Action::GiveThenTrip(100)]);
        let cancel = CancelFlag::default();
        let breaker = link.breaker.clone();
        let buf = vec![0u8; 1000];

        let sent = send_all(&link, &buf, Some(&breaker), &cancel, TEST_POLICY)
            .await
            .unwrap();

        assert_eq!(sent, Transfer::Interrupted(100));
        assert_eq!(link.calls(), 1);
    }

    #[tokio::test]
    async fn test_set_cancel_flag_interrupts_before_calling() {
        let link = ScriptedLink::new(vec![]);
        let cancel = CancelFlag::default();
        cancel.set();
        let mut buf = vec![0u8; 64];

        let received = recv_all(&link, &mut buf, None, &cancel, TEST_POLICY)
            .await
            .unwrap();

        assert_eq!(received, Transfer::Interrupted(0));
        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_shot_does_not_retry() {
        let link = ScriptedLink::new(vec![Action::Fail]);
        let cancel = CancelFlag::default();
        let buf = vec![0u8; 10];

        let err = send_one(&link, &buf, &cancel, TEST_POLICY).await.unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(link.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_shot_zero_means_peer_closed() {
        let link = ScriptedLink::new(vec![Action::Give(0)]);
        let cancel = CancelFlag::default();
        let mut buf = vec![0u8; 10];

        let received = recv_one(&link, &mut buf, &cancel, TEST_POLICY).await.unwrap();

        assert_eq!(received, Transfer::PeerClosed);
    }

    #[tokio::test]
    async fn test_io_timeout_counts_as_transient_failure() {
        let link = ScriptedLink::new(vec![Action::Hang]);
        let cancel = CancelFlag::default();
        let policy = Policy {
            retry_limit: 1,
            io_timeout: Some(Duration::from_millis(20)),
        };
        let mut buf = vec![0u8; 10];

        let err = recv_all(&link, &mut buf, None, &cancel, policy).await.unwrap_err();

        match err {
            Error::TransferFailed { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
