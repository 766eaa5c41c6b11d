//! Caller-side handle to a running load.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc};

use super::error::LoaderError;
use crate::events::{LoadEvent, LoadOutcome};

/// Cooperative cancellation flag shared between a [`LoadHandle`] and its session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A load in progress.
///
/// Events are read from this handle; the stream ends after the terminal event. Dropping the
/// handle does not stop the load.
pub struct LoadHandle {
    events: mpsc::UnboundedReceiver<LoadEvent>,
    cancel: CancelToken,
}

impl LoadHandle {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<LoadEvent>, cancel: CancelToken) -> Self {
        Self { events, cancel }
    }

    /// Ask the session to stop. It acknowledges with [`LoadEvent::Cancelled`] unless it had
    /// already reached another terminal event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this load, for use from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<LoadEvent> {
        self.events.recv().await
    }

    /// Consume events until the load ends, passing every non-terminal event to `on_event`.
    pub async fn wait_with<F>(mut self, mut on_event: F) -> LoadOutcome
    where
        F: FnMut(&LoadEvent),
    {
        while let Some(event) = self.events.recv().await {
            match event {
                LoadEvent::Complete => return LoadOutcome::Complete,
                LoadEvent::Failed(e) => return LoadOutcome::Failed(e),
                LoadEvent::Cancelled => return LoadOutcome::Cancelled,
                other => on_event(&other),
            }
        }
        // Session task died without a terminal event
        LoadOutcome::Failed(LoaderError::Transport(io::Error::other(
            "load session ended unexpectedly",
        )))
    }

    /// Wait for the load to end, ignoring intermediate events.
    pub async fn wait(self) -> LoadOutcome {
        self.wait_with(|_| {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_with_reports_non_terminal_events() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LoadHandle::new(rx, CancelToken::new());
        tx.send(LoadEvent::Progress(0.25)).unwrap();
        tx.send(LoadEvent::ChecksumFailure).unwrap();
        tx.send(LoadEvent::Complete).unwrap();

        let mut seen = 0;
        let outcome = handle.wait_with(|_| seen += 1).await;
        assert!(outcome.is_complete());
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn test_wait_without_terminal_is_failure() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LoadHandle::new(rx, CancelToken::new());
        drop(tx);
        assert!(matches!(handle.wait().await, LoadOutcome::Failed(LoaderError::Transport(_))));
    }
}
