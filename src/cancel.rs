//! Cooperative cancellation.
//!
//! A [`CancelSignal`] is a cheap, cloneable flag backed by a
//! `tokio::sync::watch` channel. The queue checks it before admitting a new
//! folder job, and the analysis client races it against the remote call and
//! backoff sleeps. Nothing is preempted: code that does not look at the
//! signal runs to completion.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the signal, so this only
        // errors when no one can cancel anymore; stay pending in that case.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
