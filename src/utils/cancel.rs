/// Run cancellation signal shared by every suspension point
use std::future::Future;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
#[error("run cancelled")]
pub struct Cancelled;

/// Trips the paired [`CancelSignal`]s
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Mark the run as cancelled
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cloneable view on the cancellation state of a run
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a signal together with the handle that trips it
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A signal that is never tripped
    #[allow(dead_code)]
    pub fn never() -> Self {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the run is cancelled; pends forever if it never is
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drive `fut` unless the run is cancelled first; the future is dropped on cancel
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}
