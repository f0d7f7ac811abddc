//! Session cancellation.
//!
//! Every session has one [`CancelSource`]; every suspension point of its run
//! loop races against the matching [`CancelSignal`].

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation fires. Never resolves if the source is
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs `fut` unless cancellation fires first.
pub async fn cancellable<F: Future>(signal: &CancelSignal, fut: F) -> Option<F::Output> {
    if signal.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = signal.cancelled() => None,
        output = fut => Some(output),
    }
}
