//! Cancellation tokens bounding broker calls and consumer lifetimes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::QueueError;

/// Create a linked canceller/token pair.
///
/// Tokens are cheap to clone; every clone observes the same cancellation.
pub fn cancellation() -> (Canceller, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx: Arc::new(tx) }, CancelToken { rx })
}

/// Triggers cancellation of every linked [`CancelToken`].
///
/// Dropping a canceller does not cancel its tokens.
#[derive(Clone, Debug)]
pub struct Canceller {
    tx: Arc<watch::Sender<bool>>,
}

impl Canceller {
    /// Signal cancellation. Calling it again has no effect.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Signal cancellation once `deadline` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_after(&self, deadline: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tx.send_replace(true);
        });
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes cancellation signalled by a [`Canceller`].
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelToken { rx }
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for cancellation.
    ///
    /// Resolves immediately if already cancelled; pends forever if every
    /// canceller was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless this token fires first.
    pub(crate) async fn guard<F>(&self, fut: F) -> Result<F::Output, QueueError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(QueueError::Cancelled),
            output = fut => Ok(output),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}
