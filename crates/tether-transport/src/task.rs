//! Output slots for background operations.
//!
//! Background variants return immediately; the eventual result is delivered
//! through a [`TaskHandle`]. Dropping the handle does not stop the task
//! (background operations are fire-and-forget), but the connection keeps its
//! own join handle so `disconnect` can positively await termination.

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Handle to the result slot of one background operation.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Producer side of the slot, held by the spawned task.
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

/// Create a connected handle/completer pair.
pub(crate) fn slot<T>() -> (TaskHandle<T>, Completer<T>) {
    let (tx, rx) = oneshot::channel();
    (TaskHandle { rx }, Completer { tx })
}

impl<T> TaskHandle<T> {
    /// Await the task and take its result.
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            // The task was torn down before it could deliver a result.
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Take the result if the task has finished, without blocking.
    ///
    /// Returns `None` while the task is still running; once it completes,
    /// the next call yields `Some` with the result (which can be taken
    /// exactly once).
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Cancelled)),
        }
    }
}

impl<T> Completer<T> {
    /// Deliver the result. Ignored if the caller dropped its handle.
    pub(crate) fn complete(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_delivers_result() {
        let (handle, completer) = slot::<usize>();

        tokio::spawn(async move {
            completer.complete(Ok(42));
        });

        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_try_take_before_and_after_completion() {
        let (mut handle, completer) = slot::<usize>();

        assert!(handle.try_take().is_none());
        completer.complete(Ok(7));
        assert_eq!(handle.try_take().unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_completer_reports_cancelled() {
        let (handle, completer) = slot::<usize>();
        drop(completer);

        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
    }
}
