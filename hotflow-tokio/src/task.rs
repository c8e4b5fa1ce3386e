use std::{
    borrow::Cow,
    fmt::{self, Display},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

/// A named [`tokio::task::JoinHandle`] that:
///
/// (1) re-raises panics from the spawned task in whoever polls the handle,
///     instead of quietly turning them into a [`JoinError`].
/// (2) is `#[must_use]`, so every spawned task is either joined or explicitly
///     [`detach`]ed.
///
/// Tasks spawned by a [`Scope`] are joined by its [`ScopeJoiner`], which is
/// the usual way to get structured concurrency out of this type.
///
/// [`detach`]: Task::detach
/// [`Scope`]: crate::scope::Scope
/// [`ScopeJoiner`]: crate::scope::ScopeJoiner
#[must_use]
pub struct Task<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

/// A [`Future`] wrapping a [`Task`] which logs how the task ended. The
/// task's output is discarded and replaced with its name.
#[must_use]
pub struct LoggedTask<T>(Task<T>);

// "Task '<name>' <finished|cancelled|panicked>[: <error>]"
struct TaskOutcome<'a> {
    name: &'a str,
    // `result.as_ref().map(|_| ())` keeps this free of the generic `T`.
    result: Result<(), &'a JoinError>,
}

// --- impl Task --- //

impl<T> Task<T> {
    /// Spawns a named task inside the current [`tracing::Span`].
    /// This is generally what you want.
    #[inline]
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self::spawn_with_span(name, tracing::Span::current(), future)
    }

    /// Spawns a named task inside `span`.
    ///
    /// Spans created with the `span!` macros are children of the current span
    /// unless created with `parent: None`.
    #[inline]
    #[allow(clippy::disallowed_methods)]
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Self {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Let the task keep running in the background without a handle. Its
    /// output, and any panic, can no longer be observed.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Log the task's outcome when it finishes. See [`LoggedTask`].
    #[inline]
    pub fn logged(self) -> LoggedTask<T> {
        LoggedTask(self)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(output) => Ok(output),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(panic_payload) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_payload)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

// --- impl LoggedTask --- //

impl<T> LoggedTask<T> {
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl<T> Future for LoggedTask<T> {
    type Output = Cow<'static, str>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            let outcome = TaskOutcome {
                name: self.name(),
                result: result.as_ref().map(|_| ()),
            };

            match &result {
                Ok(_) => info!("{outcome}"),
                Err(_) => warn!("{outcome}"),
            }

            self.0.name.clone()
        })
    }
}

// --- impl TaskOutcome --- //

impl Display for TaskOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match &self.result {
            Ok(()) => "finished",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(e) if e.is_panic() => "panicked",
            Err(_) => "(unknown join error)",
        };

        let name = self.name;
        write!(f, "Task '{name}' {label}")?;

        if let Err(e) = self.result {
            write!(f, ": {e:#}")?;
        }

        Ok(())
    }
}
