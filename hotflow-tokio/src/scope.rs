//! # `Scope`
//!
//! A [`Scope`] owns a group of spawned [`Task`]s, a [`CancelToken`] that
//! bounds their lifetime, and the unhandled errors they raise. It's the
//! explicit stand-in for an ambient "current coroutine scope": whoever
//! creates the scope decides where unhandled errors go (an [`ErrorReporter`])
//! and joins everything through the [`ScopeJoiner`].
//!
//! Unhandled errors are loud by default. [`Scope::raise`] logs the error,
//! reports it, remembers it, and cancels the whole scope, so that the joiner
//! returns [`Error::Unhandled`].

use std::{
    borrow::Cow,
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{cancel::CancelToken, task::Task};

/// Errors returned when joining a [`Scope`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unhandled error in scope '{scope}': {error:#}")]
    Unhandled {
        scope: Cow<'static, str>,
        error: Arc<anyhow::Error>,
    },
    #[error("Some tasks failed to finish on time: {hung_tasks:?}")]
    Hung { hung_tasks: Vec<String> },
}

/// Somewhere to send errors that nobody else handled, e.g. a crash reporting
/// backend. Supplied when the [`Scope`] is constructed.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, error: &anyhow::Error);
}

/// A cloneable handle for spawning tasks into a scope, cancelling it, and
/// raising unhandled errors onto it. See the [module docs](self).
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

/// Joins every task spawned into a [`Scope`]. There is exactly one joiner per
/// scope.
#[must_use]
pub struct ScopeJoiner {
    inner: Arc<ScopeInner>,
    tasks_rx: mpsc::UnboundedReceiver<Task<()>>,
}

struct ScopeInner {
    name: Cow<'static, str>,
    cancel: CancelToken,
    tasks_tx: mpsc::UnboundedSender<Task<()>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    // The first error passed to `raise`.
    unhandled: Mutex<Option<Arc<anyhow::Error>>>,
}

// --- impl Scope --- //

impl Scope {
    /// A new scope whose unhandled errors are only logged.
    pub fn new(name: impl Into<Cow<'static, str>>) -> (Self, ScopeJoiner) {
        Self::build(name.into(), None)
    }

    /// A new scope whose unhandled errors are also sent to `reporter`.
    pub fn with_reporter(
        name: impl Into<Cow<'static, str>>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Self, ScopeJoiner) {
        Self::build(name.into(), Some(reporter))
    }

    fn build(
        name: Cow<'static, str>,
        reporter: Option<Arc<dyn ErrorReporter>>,
    ) -> (Self, ScopeJoiner) {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ScopeInner {
            name,
            cancel: CancelToken::new(),
            tasks_tx,
            reporter,
            unhandled: Mutex::new(None),
        });
        let joiner = ScopeJoiner {
            inner: inner.clone(),
            tasks_rx,
        };
        (Self { inner }, joiner)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn a named task into this scope. The scope's [`ScopeJoiner`] joins
    /// it; if the joiner is already gone, the task is detached.
    pub fn spawn<F>(&self, name: impl Into<Cow<'static, str>>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Task::spawn(name, future);
        if let Err(mpsc::error::SendError(task)) =
            self.inner.tasks_tx.send(task)
        {
            let scope = self.name();
            debug!(%scope, "Joiner gone; detaching {}", task.name());
            task.detach();
        }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(scope = %self.name(), "Cancelling scope");
        }
        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Wait until the scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// A handle to the scope's [`CancelToken`], for tasks that only need to
    /// observe cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    /// Raise an error that nobody handled.
    ///
    /// The error is logged, sent to the scope's [`ErrorReporter`] (if any),
    /// recorded if it's the first, and then the scope is cancelled.
    pub fn raise(&self, error: anyhow::Error) {
        error!(scope = %self.name(), "Unhandled error: {error:#}");
        if let Some(reporter) = &self.inner.reporter {
            reporter.report(&error);
        }
        {
            let mut unhandled = self.inner.lock_unhandled();
            if unhandled.is_none() {
                *unhandled = Some(Arc::new(error));
            }
        }
        self.cancel();
    }

    /// The first error passed to [`raise`](Self::raise), if any.
    pub fn unhandled_error(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.lock_unhandled().clone()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.inner.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// --- impl ScopeInner --- //

impl ScopeInner {
    fn lock_unhandled(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<Arc<anyhow::Error>>> {
        // Nothing panics while holding this lock, but don't lose the error
        // even if something did.
        self.unhandled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// --- impl ScopeJoiner --- //

impl ScopeJoiner {
    /// Poll every spawned task until the scope is cancelled (so panics
    /// propagate), then give all remaining tasks up to `shutdown_timeout` to
    /// finish.
    ///
    /// # Errors
    ///
    /// - [`Error::Unhandled`] if any error was [`raise`](Scope::raise)d.
    /// - [`Error::Hung`] if some tasks didn't finish within the timeout.
    ///
    /// NOTE: To propagate panics beyond this function, the callsite must
    /// still poll the future returned here.
    pub async fn join(
        mut self,
        shutdown_timeout: Duration,
    ) -> Result<(), Error> {
        let name = self.inner.name.clone();
        let cancel = self.inner.cancel.clone();
        let mut tasks = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(task) = self.tasks_rx.recv() => {
                    debug!(scope = %name, "Joining task: {}", task.name());
                    tasks.push(task.logged());
                }
                Some(task_name) = tasks.next() => {
                    debug!(scope = %name, "Task finished: {task_name}");
                }
            }
        }

        // Pick up anything spawned right before cancellation.
        while let Ok(task) = self.tasks_rx.try_recv() {
            tasks.push(task.logged());
        }

        let shutdown_timeout_fut = tokio::time::sleep(shutdown_timeout);
        tokio::pin!(shutdown_timeout_fut);

        let mut result = Ok(());
        while !tasks.is_empty() {
            tokio::select! {
                Some(_task_name) = tasks.next() => (),
                () = &mut shutdown_timeout_fut => {
                    let hung_tasks = tasks
                        .iter()
                        .map(|task| task.name().to_owned())
                        .collect::<Vec<_>>();
                    warn!(scope = %name, "Hung tasks: {hung_tasks:?}");
                    result = Err(Error::Hung { hung_tasks });
                    break;
                }
            }
        }

        // An unhandled error is the root cause; report it over hung tasks.
        if let Some(error) = self.inner.lock_unhandled().clone() {
            return Err(Error::Unhandled { scope: name, error });
        }

        if result.is_ok() {
            info!(scope = %name, "Scope tasks finished.");
        }
        result
    }
}
