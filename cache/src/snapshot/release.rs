//! Background release of mutable refs.
//!
//! Rollback paths run in `Drop` and cannot await, so they hand refs to a
//! worker task that releases them on its own schedule.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::MutableRef;

enum Request {
    Release(Arc<dyn MutableRef>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the release task. Cloning shares the task.
#[derive(Clone)]
pub struct ReleaseWorker {
    tx: mpsc::UnboundedSender<Request>,
}

impl ReleaseWorker {
    /// Start the worker. Must be called within a Tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Release(mutable) => {
                        if let Err(e) = mutable.release().await {
                            tracing::warn!(id = %mutable.id(), error = %e, "Failed to release mutable ref");
                        } else {
                            tracing::debug!(id = %mutable.id(), "Released mutable ref");
                        }
                    }
                    Request::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a ref for release.
    pub fn release(&self, mutable: Arc<dyn MutableRef>) {
        if let Err(mpsc::error::SendError(request)) = self.tx.send(Request::Release(mutable)) {
            // Worker is gone; dropping the last handle still gives up the hold.
            if let Request::Release(mutable) = request {
                tracing::warn!(id = %mutable.id(), "Release worker stopped, dropping ref");
            }
        }
    }

    /// Wait until every release queued before this call has completed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Request::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
