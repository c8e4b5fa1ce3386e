use std::{future::Future, sync::Arc};

use tokio::sync::Semaphore;

/// A level-triggered cancellation signal shared by everything running inside
/// a [`Scope`](crate::scope::Scope).
///
/// - Multi-producer and multi-consumer: clone to get another handle.
/// - Once cancelled, stays cancelled. Every call to [`cancelled`] on every
///   handle completes immediately from then on, no matter when the handle
///   was created.
/// - Cancelling more than once is harmless.
///
/// Like the shutdown channels this grew out of, it's a [`Semaphore`] with
/// zero permits: [`acquire`] can only ever return an [`AcquireError`], which
/// happens exactly when the semaphore is closed. Closing is cancelling.
///
/// [`cancelled`]: CancelToken::cancelled
/// [`acquire`]: Semaphore::acquire
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Semaphore>,
}

impl CancelToken {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Cancel, waking every task currently waiting in [`cancelled`].
    ///
    /// [`cancelled`]: CancelToken::cancelled
    pub fn cancel(&self) {
        self.inner.close();
    }

    /// Wait until cancelled. Completes immediately if already cancelled.
    pub async fn cancelled(&self) {
        self.inner
            .acquire()
            .await
            .map_err(|_| ())
            .expect_err("Shouldn't've been able to acquire a permit");
    }

    /// Immediately returns whether we've been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_closed()
    }

    /// Drive `future` to completion unless cancellation comes first, in which
    /// case `future` is dropped at its current await point and `None` is
    /// returned. Cancellation wins ties.
    pub async fn run_until_cancelled<F: Future>(
        &self,
        future: F,
    ) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            output = future => Some(output),
        }
    }
}
