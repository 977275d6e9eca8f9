//! Run-scoped cooperative cancellation.
//!
//! A [`CancelToken`] is handed to a scheduler run and cloned into every
//! acquisition task. Cancellation is cooperative: it stops new work from
//! being dispatched and wakes retry-backoff sleeps early, but lets
//! in-flight requests finish so the store's atomicity invariant holds.

use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation signal for one scheduler run.
///
/// Cloning is cheap; all clones observe the same signal. Once cancelled,
/// a token stays cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Creates a new, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signals cancellation to all clones of this token.
    ///
    /// Idempotent; later calls have no additional effect.
    pub fn cancel(&self) {
        // Receivers observe the latest value, repeated sends are harmless.
        let _ = self.tx.send(true);
    }

    /// Returns true if cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled.
    ///
    /// Intended for use in `tokio::select!` alongside a sleep or request
    /// future so waits can be interrupted.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // All senders dropped without cancelling; treat as never.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
