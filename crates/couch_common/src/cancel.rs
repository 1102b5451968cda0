//! Cooperative cancellation signal for async operation paths.
//!
//! Backed by a `tokio::sync::watch` channel so any number of tasks can await
//! `cancelled()` and wake as soon as `cancel()` is called.
//!
//! # Usage
//! ```ignore
//! let signal = CancelSignal::new();
//! let child = signal.clone();
//!
//! tokio::select! {
//!     _ = child.cancelled() => return Err(CouchError::Cancelled),
//!     res = dispatch() => res,
//! }
//!
//! // From the caller:
//! signal.cancel();
//! ```

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable cancellation token. All clones observe the same state.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a new signal in the non-cancelled state.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Wakes all waiters immediately.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` can only fail if the value
        // never flips; pending forever is the correct outcome in that case.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
