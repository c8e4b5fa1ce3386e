//! The update queue: requests flowing from callers to the consumer task.

use std::{
    fmt,
    future::Future,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, MutationError};

/// Identifies one update request (and the [`StateEvent`] it caused) within a
/// container. Two requests are never equal, even if their mutators produce
/// equal values.
///
/// [`StateEvent`]: crate::StateEvent
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RequestId(u64);

impl RequestId {
    /// The synthetic request that "caused" the initial value.
    pub const INIT: Self = Self(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) type BoxMutator<T> =
    Box<dyn FnOnce(T) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

pub(crate) type ErrorSink = Box<dyn FnOnce(MutationError) + Send>;

pub(crate) fn box_mutator<T, F, Fut>(mutator: F) -> BoxMutator<T>
where
    T: Send + 'static,
    F: FnOnce(T) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    // Call `mutator` inside the future so a panic in it can be caught.
    Box::new(move |value| async move { mutator(value).await }.boxed())
}

pub(crate) struct UpdateRequest<T> {
    pub id: RequestId,
    pub mutator: BoxMutator<T>,
    pub completion: Completion<T>,
}

/// What happens after a request has been applied.
pub(crate) enum Completion<T> {
    /// Fire-and-forget. Errors go to `on_error`, or to the owning scope if
    /// there's no sink.
    Detached { on_error: Option<ErrorSink> },
    /// A caller is waiting for exactly this request's outcome.
    Awaited(oneshot::Sender<Result<T, MutationError>>),
}

impl<T> Completion<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Detached { on_error: Some(_) } => "async+sink",
            Self::Detached { on_error: None } => "async",
            Self::Awaited(_) => "blocking",
        }
    }
}

/// Sending half of the update queue. Also hands out [`RequestId`]s.
pub(crate) struct UpdateTx<T> {
    kind: TxKind<T>,
    next_id: AtomicU64,
}

enum TxKind<T> {
    Unbounded(mpsc::UnboundedSender<UpdateRequest<T>>),
    Bounded {
        tx: mpsc::Sender<UpdateRequest<T>>,
        capacity: usize,
    },
}

pub(crate) enum UpdateRx<T> {
    Unbounded(mpsc::UnboundedReceiver<UpdateRequest<T>>),
    Bounded(mpsc::Receiver<UpdateRequest<T>>),
}

/// A FIFO update queue. `None` means unbounded.
pub(crate) fn queue<T>(
    capacity: Option<NonZeroUsize>,
) -> (UpdateTx<T>, UpdateRx<T>) {
    let (kind, rx) = match capacity {
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (TxKind::Unbounded(tx), UpdateRx::Unbounded(rx))
        }
        Some(capacity) => {
            let capacity = capacity.get();
            let (tx, rx) = mpsc::channel(capacity);
            (TxKind::Bounded { tx, capacity }, UpdateRx::Bounded(rx))
        }
    };
    let tx = UpdateTx {
        kind,
        next_id: AtomicU64::new(1),
    };
    (tx, rx)
}

impl<T> UpdateTx<T> {
    /// Enqueue a request without waiting, returning its id.
    pub fn send(
        &self,
        mutator: BoxMutator<T>,
        completion: Completion<T>,
    ) -> Result<RequestId, Error> {
        use mpsc::error::TrySendError;

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = UpdateRequest {
            id,
            mutator,
            completion,
        };

        match &self.kind {
            TxKind::Unbounded(tx) =>
                tx.send(request).map_err(|_| Error::ScopeCancelled)?,
            TxKind::Bounded { tx, capacity } =>
                tx.try_send(request).map_err(|e| match e {
                    TrySendError::Full(_) => Error::QueueFull {
                        capacity: *capacity,
                    },
                    TrySendError::Closed(_) => Error::ScopeCancelled,
                })?,
        }

        Ok(id)
    }
}

impl<T> UpdateRx<T> {
    /// The next request, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<UpdateRequest<T>> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}
