//! # `HotData`
//!
//! A hot, observable piece of state with serialized async updates.
//!
//! ```text
//!  update_async ──┐                      ┌──> events()  every StateEvent
//!  update_async ──┼──> update queue ──> consumer task
//! update_blocking ┘      (FIFO)          └──> data()    latest value, deduped
//!        ^                                  │
//!        └────────── completion handle ─────┘
//! ```
//!
//! - A single consumer task owns the value. It runs the initializer exactly
//!   once, then applies queued mutators one at a time, in dequeue order.
//! - Every applied (or failed) request is published as a [`StateEvent`]
//!   tagged with the request's [`RequestId`].
//! - [`HotData::data`] replays the latest value to each new subscriber and
//!   then yields every new value that differs from the previous one. Each
//!   subscriber buffers what it hasn't polled yet, so a slow subscriber still
//!   sees every value without holding up the consumer task.
//! - A panicking initializer, mutator or error sink is caught and raised
//!   onto the owning [`Scope`], like any other unhandled error.
//! - [`HotData::update_blocking`] waits on its own request's completion
//!   handle, so it gets exactly the value (or error) its mutator produced.
//!
//! Mutators are expected to be pure functions of the value they're given:
//! the container serializes them, but it can't stop a mutator from sharing
//! other state out-of-band.
//!
//! ```
//! # tokio_test::block_on(async {
//! use hotflow::{HotData, HotDataConfig};
//! use hotflow_tokio::scope::Scope;
//!
//! let (scope, _joiner) = Scope::new("example");
//! let counter = HotData::with_value(&scope, HotDataConfig::default(), 0);
//!
//! let value = counter
//!     .update_blocking(|count| async move { Ok(count + 1) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 1);
//! assert_eq!(counter.current().await.unwrap(), 1);
//! # })
//! ```

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use anyhow::anyhow;
use futures::{
    future::{BoxFuture, FutureExt},
    stream::{self, Stream, StreamExt},
};
use hotflow_tokio::{
    events_bus::{EventsBus, EventsRx},
    scope::Scope,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    config::{HotDataConfig, SharingPolicy},
    error::{Error, InitializationError, MutationError},
    update::{
        self, box_mutator, BoxMutator, Completion, RequestId, UpdateRequest,
        UpdateRx, UpdateTx,
    },
};

type BoxInit<T> =
    Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Published by the consumer task after each request it handles.
#[derive(Clone, Debug)]
pub struct StateEvent<T> {
    /// The value after the request. Unchanged if the mutator failed.
    pub value: T,
    /// The mutator's error, if it failed and no error sink took it.
    pub error: Option<MutationError>,
    /// The request which produced this event.
    pub caused_by: RequestId,
}

/// A cloneable handle to a hot state container. See the [module docs](self).
pub struct HotData<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    config: HotDataConfig,
    scope: Scope,
    update_tx: UpdateTx<T>,
    values: Arc<ValueFanout<T>>,
    events: EventsBus<StateEvent<T>>,
    init_error: Arc<OnceLock<InitializationError>>,
    // Taken exactly once, by `activate`.
    consumer: Mutex<Option<Consumer<T>>>,
}

/// Everything the consumer task owns.
struct Consumer<T> {
    init: BoxInit<T>,
    update_rx: UpdateRx<T>,
    publisher: Publisher<T>,
    scope: Scope,
    init_error: Arc<OnceLock<InitializationError>>,
}

/// Owned by the consumer task. Dropping it ends every `data` stream.
struct Publisher<T> {
    values: Arc<ValueFanout<T>>,
    events: EventsBus<StateEvent<T>>,
}

/// The latest distinct value, plus one unbounded buffer per `data`
/// subscriber.
struct ValueFanout<T> {
    state: Mutex<FanoutState<T>>,
}

struct FanoutState<T> {
    latest: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    // Set once the consumer task is gone.
    closed: bool,
}

// State threaded through the `data` stream.
struct DataState<T> {
    // Held for the stream's whole lifetime: the container stays up while it
    // has subscribers, even if every `HotData` handle is dropped.
    inner: Arc<Inner<T>>,
    // Subscribed on the first poll.
    values_rx: Option<mpsc::UnboundedReceiver<T>>,
    last: Option<T>,
}

// --- impl HotData --- //

impl<T> HotData<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Create a container owned by `scope` whose first value comes from
    /// `init`.
    ///
    /// `init` runs once, on the consumer task, when the container is first
    /// activated (see [`SharingPolicy`]). If it fails, the error is raised
    /// onto `scope` and the container never gets a value.
    ///
    /// Must be called within a Tokio runtime if the sharing policy is
    /// [`SharingPolicy::Eagerly`].
    pub fn new<F, Fut>(scope: &Scope, config: HotDataConfig, init: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (update_tx, update_rx) = update::queue(config.queue_capacity);
        let values = Arc::new(ValueFanout::new());
        let events = EventsBus::new();
        let init_error = Arc::new(OnceLock::new());

        let consumer = Consumer {
            // Call `init` inside the future so a panic in it can be caught.
            init: Box::new(move || async move { init().await }.boxed()),
            update_rx,
            publisher: Publisher {
                values: values.clone(),
                events: events.clone(),
            },
            scope: scope.clone(),
            init_error: init_error.clone(),
        };

        debug!(tag = ?config.tag, sharing = ?config.sharing, "HotData::new");
        let sharing = config.sharing;
        let inner = Arc::new(Inner {
            config,
            scope: scope.clone(),
            update_tx,
            values,
            events,
            init_error,
            consumer: Mutex::new(Some(consumer)),
        });

        if sharing == SharingPolicy::Eagerly {
            inner.activate();
        }

        Self { inner }
    }

    /// Create a container whose first value is `value`.
    pub fn with_value(scope: &Scope, config: HotDataConfig, value: T) -> Self {
        Self::new(scope, config, move || async move { Ok(value) })
    }

    pub fn tag(&self) -> Option<&str> {
        self.inner.config.tag.as_deref()
    }

    /// Queue an update and return without waiting for it to be applied.
    ///
    /// If `mutator` fails, the value is left unchanged and the error is
    /// raised onto the owning [`Scope`], which cancels it. Use
    /// [`update_async_or_else`] to handle errors instead.
    ///
    /// [`update_async_or_else`]: Self::update_async_or_else
    pub fn update_async<F, Fut>(&self, mutator: F) -> Result<RequestId, Error>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let completion = Completion::Detached { on_error: None };
        self.inner.send(box_mutator(mutator), completion)
    }

    /// Like [`update_async`](Self::update_async), but if `mutator` fails,
    /// `on_error` is called with the error (exactly once) and the error is
    /// considered handled.
    pub fn update_async_or_else<E, F, Fut>(
        &self,
        on_error: E,
        mutator: F,
    ) -> Result<RequestId, Error>
    where
        E: FnOnce(MutationError) + Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let completion = Completion::Detached {
            on_error: Some(Box::new(on_error)),
        };
        self.inner.send(box_mutator(mutator), completion)
    }

    /// Queue an update and wait until it has been applied, returning the
    /// value `mutator` produced.
    ///
    /// If `mutator` fails, the value is left unchanged and the error is
    /// returned here as [`Error::Mutation`]. It is never sent to the scope.
    ///
    /// Dropping the returned future doesn't retract the update; it's still
    /// applied, just not observed.
    pub async fn update_blocking<F, Fut>(&self, mutator: F) -> Result<T, Error>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.inner.activate();

        let (done_tx, done_rx) = oneshot::channel();
        let id = self
            .inner
            .send(box_mutator(mutator), Completion::Awaited(done_tx))?;

        trace!(tag = ?self.tag(), %id, "Waiting for update");
        match done_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::Mutation(error)),
            // The consumer task dropped our request.
            Err(_) => Err(self.inner.stopped_error()),
        }
    }

    /// A stream of the container's value.
    ///
    /// The first poll activates the container. Each subscriber gets the
    /// latest value as soon as there is one, then every newer value that's
    /// different from the last one it saw, in commit order. Values are
    /// buffered until polled, so none are skipped.
    ///
    /// The stream keeps the container alive, even after every `HotData`
    /// handle is dropped. It ends only when the container stops (owning
    /// scope cancelled, or initialization failed).
    pub fn data(&self) -> impl Stream<Item = T> + Send + 'static {
        let state = DataState {
            inner: self.inner.clone(),
            values_rx: None,
            last: None,
        };

        stream::unfold(state, |mut state| async move {
            if state.values_rx.is_none() {
                state.values_rx = Some(state.inner.values.subscribe());
                state.inner.activate();
            }

            loop {
                let value = state.values_rx.as_mut()?.recv().await?;
                if state.last.as_ref() != Some(&value) {
                    state.last = Some(value.clone());
                    return Some((value, state));
                }
            }
        })
    }

    /// The current value: the first item of [`data`](Self::data).
    pub async fn current(&self) -> Result<T, Error> {
        let mut data = pin!(self.data());
        match data.next().await {
            Some(value) => Ok(value),
            None => Err(self.inner.stopped_error()),
        }
    }

    /// Every [`StateEvent`] published after this call, including events
    /// that didn't change the value and events carrying errors.
    pub fn events(&self) -> EventsRx<StateEvent<T>> {
        self.inner.events.subscribe()
    }
}

impl<T> Clone for HotData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for HotData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HotData")
            .field("tag", &self.inner.config.tag)
            .field("sharing", &self.inner.config.sharing)
            .finish_non_exhaustive()
    }
}

// --- impl Inner --- //

impl<T> Inner<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Spawn the consumer task if it hasn't been spawned yet.
    fn activate(&self) {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(consumer) = consumer else { return };

        let tag = self.config.tag.as_deref().unwrap_or_default();
        let span = debug_span!("(hot-data)", %tag);
        self.scope
            .spawn(self.config.task_name(), consumer.run().instrument(span));
    }

    fn send(
        &self,
        mutator: BoxMutator<T>,
        completion: Completion<T>,
    ) -> Result<RequestId, Error> {
        // A container that was never activated still has an open queue, but
        // nothing will ever drain it.
        if self.scope.is_cancelled() {
            return Err(self.stopped_error());
        }
        self.update_tx.send(mutator, completion)
    }

    /// Why the consumer task is no longer servicing requests.
    fn stopped_error(&self) -> Error {
        match self.init_error.get() {
            Some(error) => Error::Initialization(error.clone()),
            None => Error::ScopeCancelled,
        }
    }
}

// --- impl Consumer --- //

impl<T> Consumer<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    async fn run(self) {
        let Consumer {
            init,
            mut update_rx,
            publisher,
            scope,
            init_error,
        } = self;
        let cancel = scope.cancel_token();

        debug!("Providing initial value...");
        let init = AssertUnwindSafe(init()).catch_unwind();
        let result = match cancel.run_until_cancelled(init).await {
            Some(Ok(result)) => result,
            Some(Err(payload)) => {
                let message = panic_message(&*payload);
                Err(anyhow!("Initializer panicked: {message}"))
            }
            None => {
                debug!("Cancelled during initialization");
                return;
            }
        };
        let mut current = match result {
            Ok(value) => value,
            Err(e) => {
                let error = InitializationError::new(e);
                warn!("Initialization failed: {error}");
                let _ = init_error.set(error.clone());
                scope.raise(anyhow::Error::new(error));
                return;
            }
        };
        debug!("...initial value provided: {current:?}");
        publisher.publish(StateEvent {
            value: current.clone(),
            error: None,
            caused_by: RequestId::INIT,
        });

        loop {
            let request =
                match cancel.run_until_cancelled(update_rx.recv()).await {
                    Some(Some(request)) => request,
                    Some(None) => {
                        debug!("All handles dropped");
                        break;
                    }
                    None => {
                        debug!("Scope cancelled");
                        break;
                    }
                };

            let UpdateRequest {
                id,
                mutator,
                completion,
            } = request;
            trace!(%id, kind = completion.kind(), "Applying update");

            let update =
                AssertUnwindSafe(mutator(current.clone())).catch_unwind();
            let result = match cancel.run_until_cancelled(update).await {
                Some(Ok(result)) => result,
                Some(Err(payload)) => {
                    let message = panic_message(&*payload);
                    scope.raise(anyhow!("Update {id} panicked: {message}"));
                    break;
                }
                None => {
                    debug!(%id, "Scope cancelled mid-update");
                    break;
                }
            };

            match result {
                Ok(value) => {
                    trace!(%id, "Updated: {value:?}");
                    current = value;
                    publisher.publish(StateEvent {
                        value: current.clone(),
                        error: None,
                        caused_by: id,
                    });
                    if let Completion::Awaited(done_tx) = completion {
                        let _ = done_tx.send(Ok(current.clone()));
                    }
                }
                Err(e) => {
                    let error = MutationError::new(e);
                    let kind = completion.kind();
                    debug!(%id, kind, "Update failed: {error}");

                    match completion {
                        Completion::Detached {
                            on_error: Some(on_error),
                        } => {
                            let sink =
                                AssertUnwindSafe(move || on_error(error));
                            if let Err(payload) = panic::catch_unwind(sink) {
                                let message = panic_message(&*payload);
                                scope.raise(anyhow!(
                                    "Error sink for {id} panicked: {message}"
                                ));
                                break;
                            }
                            publisher.publish(StateEvent {
                                value: current.clone(),
                                error: None,
                                caused_by: id,
                            });
                        }
                        Completion::Detached { on_error: None } => {
                            publisher.publish(StateEvent {
                                value: current.clone(),
                                error: Some(error.clone()),
                                caused_by: id,
                            });
                            scope.raise(anyhow::Error::new(error));
                        }
                        Completion::Awaited(done_tx) => {
                            publisher.publish(StateEvent {
                                value: current.clone(),
                                error: Some(error.clone()),
                                caused_by: id,
                            });
                            let _ = done_tx.send(Err(error));
                        }
                    }
                }
            }
        }

        debug!("Consumer finished");
    }
}

// --- impl Publisher --- //

impl<T: Clone + PartialEq> Publisher<T> {
    fn publish(&self, event: StateEvent<T>) {
        self.values.publish(&event.value);
        self.events.send(event);
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.values.close();
    }
}

// --- impl ValueFanout --- //

impl<T> ValueFanout<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FanoutState {
                latest: None,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FanoutState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every subscriber's sender, ending their streams. Later
    /// subscribers get an already-ended stream.
    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}

impl<T: Clone + PartialEq> ValueFanout<T> {
    /// A new subscriber's buffer, primed with the latest value if there is
    /// one.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            if let Some(latest) = &state.latest {
                let _ = tx.send(latest.clone());
            }
            state.subscribers.push(tx);
        }
        rx
    }

    /// Push `value` to every subscriber, unless it equals the latest value.
    fn publish(&self, value: &T) {
        let mut state = self.lock();
        if state.latest.as_ref() == Some(value) {
            return;
        }
        state.latest = Some(value.clone());
        // Prune subscribers whose stream was dropped.
        state.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

#[cfg(test)]
mod test {
    use std::{
        collections::BTreeMap,
        num::NonZeroUsize,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::anyhow;
    use hotflow_tokio::scope::{self, ScopeJoiner};
    use proptest::{collection::vec, prelude::any, proptest};
    use tokio::time;

    use super::*;
    use crate::report::RecordingReporter;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    fn test_scope() -> (Scope, ScopeJoiner) {
        hotflow_logger::init_for_testing();
        Scope::new("test")
    }

    fn counter(scope: &Scope) -> HotData<i64> {
        HotData::with_value(scope, HotDataConfig::default(), 0)
    }

    #[tokio::test]
    async fn blocking_then_async_scenario() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);

        let value = hot.update_blocking(|v| async move { Ok(v + 1) }).await;
        assert_eq!(value.unwrap(), 1);

        hot.update_async(|v| async move { Ok(v * 10) }).unwrap();
        let value = hot.update_blocking(|v| async move { Ok(v) }).await;
        assert_eq!(value.unwrap(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_async_inserts_both_land() {
        let (scope, _joiner) = test_scope();
        let hot = HotData::with_value(
            &scope,
            HotDataConfig::default(),
            BTreeMap::<String, i32>::new(),
        );

        let tasks = [("a", 1), ("b", 2)].map(|(key, value)| {
            let hot = hot.clone();
            tokio::spawn(async move {
                hot.update_async(move |mut map| async move {
                    map.insert(key.to_owned(), value);
                    Ok(map)
                })
                .unwrap();
            })
        });
        for task in tasks {
            task.await.unwrap();
        }

        let map = hot.update_blocking(|map| async move { Ok(map) }).await;
        let map = map.unwrap();
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.get("b"), Some(&2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lazy_init_runs_once() {
        let (scope, _joiner) = test_scope();
        let init_count = Arc::new(AtomicUsize::new(0));

        let count = init_count.clone();
        let hot = HotData::new(&scope, HotDataConfig::default(), move || {
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_millis(10)).await;
                Ok(7_i64)
            }
        });

        // Nobody has subscribed yet.
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(init_count.load(Ordering::SeqCst), 0);

        let subscribers = (0..16)
            .map(|_| {
                let hot = hot.clone();
                tokio::spawn(async move { hot.current().await.unwrap() })
            })
            .collect::<Vec<_>>();
        for subscriber in subscribers {
            assert_eq!(subscriber.await.unwrap(), 7);
        }

        assert_eq!(init_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eager_init_without_subscribers() {
        let (scope, _joiner) = test_scope();
        let init_count = Arc::new(AtomicUsize::new(0));

        let count = init_count.clone();
        let config = HotDataConfig::default()
            .with_tag("eager")
            .with_sharing(SharingPolicy::Eagerly);
        let hot = HotData::new(&scope, config, move || async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(1_i64)
        });
        assert_eq!(hot.tag(), Some("eager"));

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(init_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn async_updates_wait_for_activation() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);

        hot.update_async(|v| async move { Ok(v + 5) }).unwrap();
        time::sleep(Duration::from_secs(1)).await;

        // Applied once something activates the container.
        let mut events = hot.events();
        let value = hot.update_blocking(|v| async move { Ok(v) }).await;
        assert_eq!(value.unwrap(), 5);

        let init = events.recv().await;
        assert_eq!((init.caused_by, init.value), (RequestId::INIT, 0));
        let queued = events.recv().await;
        assert_eq!(queued.value, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn blocking_gets_its_own_value() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);

        let callers = (1..=64_i64)
            .map(|marker| {
                let hot = hot.clone();
                tokio::spawn(async move {
                    let value = hot
                        .update_blocking(move |_| async move { Ok(marker) })
                        .await
                        .unwrap();
                    (marker, value)
                })
            })
            .collect::<Vec<_>>();

        for caller in callers {
            let (marker, value) = caller.await.unwrap();
            assert_eq!(marker, value);
        }
    }

    #[tokio::test]
    async fn events_are_tagged_with_request_id() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        hot.current().await.unwrap();

        let mut events = hot.events();
        let first = hot.update_async(|v| async move { Ok(v + 1) }).unwrap();
        let second = hot.update_async(|v| async move { Ok(v + 1) }).unwrap();

        let event = events.recv().await;
        assert_eq!((event.caused_by, event.value), (first, 1));
        let event = events.recv().await;
        assert_eq!((event.caused_by, event.value), (second, 2));
    }

    #[tokio::test]
    async fn sink_handles_async_error() {
        let (scope, _joiner) = test_scope();
        let hot = HotData::with_value(&scope, HotDataConfig::default(), 5);
        hot.current().await.unwrap();

        let mut events = hot.events();
        let sink_calls = Arc::new(AtomicUsize::new(0));
        let calls = sink_calls.clone();
        let id = hot
            .update_async_or_else(
                move |error| {
                    assert!(error.downcast_ref::<Boom>().is_some());
                    calls.fetch_add(1, Ordering::SeqCst);
                },
                |_: i64| async { Err(anyhow::Error::new(Boom)) },
            )
            .unwrap();

        let event = events.recv_filtered(|e| e.caused_by == id).await;
        assert!(event.error.is_none());
        assert_eq!(event.value, 5);

        let value = hot.update_blocking(|v| async move { Ok(v) }).await;
        assert_eq!(value.unwrap(), 5);
        assert_eq!(sink_calls.load(Ordering::SeqCst), 1);
        assert!(!scope.is_cancelled());
    }

    #[tokio::test]
    async fn unhandled_async_error_reaches_scope() {
        hotflow_logger::init_for_testing();
        let reporter = Arc::new(RecordingReporter::new());
        let (scope, joiner) = Scope::with_reporter("test", reporter.clone());
        let config =
            HotDataConfig::default().with_sharing(SharingPolicy::Eagerly);
        let hot = HotData::with_value(&scope, config, 1_i64);

        let mut events = hot.events();
        let id = hot
            .update_async(|_| async { Err(anyhow::Error::new(Boom)) })
            .unwrap();
        let event = events.recv_filtered(|e| e.caused_by == id).await;
        assert_eq!(event.value, 1);
        let broadcast_error = event.error.unwrap();

        match joiner.join(Duration::from_secs(5)).await {
            Err(scope::Error::Unhandled { error, .. }) => {
                let error = error.downcast_ref::<MutationError>().unwrap();
                assert!(error.ptr_eq(&broadcast_error));
                assert!(error.downcast_ref::<Boom>().is_some());
            }
            other => panic!("unexpected join result: {other:?}"),
        }
        assert_eq!(reporter.reports(), vec!["boom".to_owned()]);
    }

    #[tokio::test]
    async fn blocking_error_goes_to_caller() {
        let (scope, _joiner) = test_scope();
        let hot = HotData::with_value(&scope, HotDataConfig::default(), 3);

        let result = hot
            .update_blocking(|_: i64| async { Err(anyhow::Error::new(Boom)) })
            .await;
        match result {
            Err(Error::Mutation(error)) =>
                assert!(error.downcast_ref::<Boom>().is_some()),
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(hot.current().await.unwrap(), 3);
        assert!(!scope.is_cancelled());
        assert!(scope.unhandled_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn identity_update_is_not_re_emitted() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        let mut data = pin!(hot.data());
        assert_eq!(data.next().await, Some(0));

        // Completes the blocking call, but `data` stays quiet.
        let value = hot.update_blocking(|v| async move { Ok(v) }).await;
        assert_eq!(value.unwrap(), 0);
        let next = time::timeout(Duration::from_secs(1), data.next()).await;
        assert!(next.is_err());

        hot.update_blocking(|v| async move { Ok(v + 1) }).await.unwrap();
        assert_eq!(data.next().await, Some(1));
    }

    #[tokio::test]
    async fn late_subscriber_gets_latest_value() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        for _ in 0..3 {
            hot.update_blocking(|v| async move { Ok(v + 1) }).await.unwrap();
        }

        let mut data = pin!(hot.data());
        assert_eq!(data.next().await, Some(3));
    }

    #[tokio::test]
    async fn init_failure_is_fatal() {
        hotflow_logger::init_for_testing();
        let (scope, joiner) = Scope::new("test");
        let hot = HotData::<i64>::new(&scope, HotDataConfig::default(), || {
            async { Err(anyhow!("no settings file")) }
        });

        let result = hot.update_blocking(|v| async move { Ok(v + 1) }).await;
        match result {
            Err(Error::Initialization(error)) =>
                assert_eq!(error.to_string(), "no settings file"),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut data = pin!(hot.data());
        assert_eq!(data.next().await, None);
        assert!(matches!(hot.current().await, Err(Error::Initialization(_))));

        let result = joiner.join(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(scope::Error::Unhandled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_init_fails_waiters() {
        let (scope, _joiner) = test_scope();
        let hot = HotData::<i64>::new(&scope, HotDataConfig::default(), || {
            std::future::pending()
        });

        let waiter = {
            let hot = hot.clone();
            tokio::spawn(async move {
                hot.update_blocking(|v| async move { Ok(v + 1) }).await
            })
        };
        let mut data = pin!(hot.data());

        time::sleep(Duration::from_secs(1)).await;
        scope.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(Error::ScopeCancelled)));
        assert_eq!(data.next().await, None);

        // The queue is closed for good.
        let result = hot.update_async(|v| async move { Ok(v) });
        assert!(matches!(result, Err(Error::ScopeCancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_in_flight_mutation() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        hot.current().await.unwrap();

        let canceller = scope.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = hot
            .update_blocking(|v| async move {
                time::sleep(Duration::from_secs(60)).await;
                Ok(v + 1)
            })
            .await;
        assert!(matches!(result, Err(Error::ScopeCancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_retract_update() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);

        let slow_update = hot.update_blocking(|v| async move {
            time::sleep(Duration::from_secs(10)).await;
            Ok(v + 1)
        });
        let result = time::timeout(Duration::from_secs(1), slow_update).await;
        assert!(result.is_err());

        // Queued behind the abandoned update, so it sees its result.
        let value = hot.update_blocking(|v| async move { Ok(v) }).await;
        assert_eq!(value.unwrap(), 1);
    }

    #[tokio::test]
    async fn bounded_queue_rejects_when_full() {
        let (scope, _joiner) = test_scope();
        let config = HotDataConfig::default()
            .with_queue_capacity(NonZeroUsize::new(1).unwrap());
        let hot = HotData::with_value(&scope, config, 0_i64);

        // Not activated yet, so nothing drains the queue.
        hot.update_async(|v| async move { Ok(v + 1) }).unwrap();
        let result = hot.update_async(|v| async move { Ok(v + 1) });
        assert!(matches!(result, Err(Error::QueueFull { capacity: 1 })));

        let value = hot.update_blocking(|v| async move { Ok(v) }).await;
        assert_eq!(value.unwrap(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_sees_every_value() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        let mut data = pin!(hot.data());
        assert_eq!(data.next().await, Some(0));

        // Three commits land before the subscriber polls again.
        for _ in 0..3 {
            hot.update_blocking(|v| async move { Ok(v + 1) }).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.extend(data.next().await);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn data_stream_outlives_handles() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        let mut data = pin!(hot.data());
        assert_eq!(data.next().await, Some(0));

        drop(hot);
        let next = time::timeout(Duration::from_secs(1), data.next()).await;
        assert!(next.is_err(), "stream ended while the scope was alive");

        scope.cancel();
        assert_eq!(data.next().await, None);
    }

    #[tokio::test]
    async fn cancelled_scope_rejects_updates_before_activation() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        scope.cancel();

        let result = hot.update_async(|v| async move { Ok(v + 1) });
        assert!(matches!(result, Err(Error::ScopeCancelled)));
        let result =
            hot.update_async_or_else(|_| (), |v| async move { Ok(v + 1) });
        assert!(matches!(result, Err(Error::ScopeCancelled)));
        let result = hot.update_blocking(|v| async move { Ok(v + 1) }).await;
        assert!(matches!(result, Err(Error::ScopeCancelled)));
    }

    fn explode(message: &str) -> anyhow::Result<i64> {
        panic!("{message}")
    }

    #[tokio::test]
    async fn panicking_update_cancels_scope() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        hot.current().await.unwrap();

        let result = hot
            .update_blocking(|_| async { explode("mutator bug") })
            .await;
        assert!(matches!(result, Err(Error::ScopeCancelled)));
        assert!(scope.is_cancelled());
        let error = scope.unhandled_error().unwrap();
        assert!(error.to_string().contains("mutator bug"), "{error:#}");

        let result = hot.update_async(|v| async move { Ok(v) });
        assert!(matches!(result, Err(Error::ScopeCancelled)));
    }

    #[tokio::test]
    async fn panicking_sink_cancels_scope() {
        let (scope, _joiner) = test_scope();
        let hot = counter(&scope);
        let mut data = pin!(hot.data());
        assert_eq!(data.next().await, Some(0));

        hot.update_async_or_else(
            |_| {
                panic!("sink bug");
            },
            |_: i64| async { Err(anyhow::Error::new(Boom)) },
        )
        .unwrap();

        assert_eq!(data.next().await, None);
        assert!(scope.is_cancelled());
        let error = scope.unhandled_error().unwrap();
        assert!(error.to_string().contains("sink bug"), "{error:#}");
    }

    #[tokio::test]
    async fn panicking_init_is_an_init_failure() {
        let (scope, _joiner) = test_scope();
        let hot = HotData::new(&scope, HotDataConfig::default(), || async {
            explode("init bug")
        });

        match hot.current().await {
            Err(Error::Initialization(error)) =>
                assert!(error.to_string().contains("init bug"), "{error}"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(scope.is_cancelled());
    }

    /// A view model's screen state, fed by two independent producers.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn view_model_state() {
        #[derive(Clone, Debug, Default, PartialEq)]
        struct RecorderState {
            log_path: Option<String>,
            log_size: Option<u64>,
            zip_path: Option<String>,
            zip_size: Option<u64>,
            loading: bool,
        }

        let (scope, _joiner) = test_scope();
        let state = HotData::new(&scope, HotDataConfig::default(), || async {
            Ok(RecorderState {
                loading: true,
                ..Default::default()
            })
        });

        let log_feed = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .update_blocking(|s| async move {
                        Ok(RecorderState {
                            log_path: Some("debug.log".to_owned()),
                            log_size: Some(1024),
                            ..s
                        })
                    })
                    .await
            })
        };
        let zip_feed = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .update_blocking(|s| async move {
                        Ok(RecorderState {
                            zip_path: Some("debug.log.zip".to_owned()),
                            zip_size: Some(256),
                            loading: false,
                            ..s
                        })
                    })
                    .await
            })
        };
        log_feed.await.unwrap().unwrap();
        zip_feed.await.unwrap().unwrap();

        let expected = RecorderState {
            log_path: Some("debug.log".to_owned()),
            log_size: Some(1024),
            zip_path: Some("debug.log.zip".to_owned()),
            zip_size: Some(256),
            loading: false,
        };
        assert_eq!(state.current().await.unwrap(), expected);
    }

    #[derive(Copy, Clone, Debug)]
    enum Op {
        Add(i64),
        Mul(i64),
    }

    impl Op {
        fn apply(self, value: i64) -> i64 {
            match self {
                Self::Add(x) => value.wrapping_add(x),
                Self::Mul(x) => value.wrapping_mul(x),
            }
        }
    }

    fn arb_op() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::strategy::Strategy;
        (any::<bool>(), -5_i64..5).prop_map(|(add, x)| {
            if add { Op::Add(x) } else { Op::Mul(x) }
        })
    }

    /// Concurrent producers never lose an update: the final value is the
    /// fold of every op in the order the consumer applied them, and each
    /// producer's ops were applied in the order it sent them.
    #[test]
    fn updates_fold_in_apply_order() {
        let config = proptest::test_runner::Config::with_cases(32);
        proptest!(config, |(
            left in vec(arb_op(), 0..20),
            right in vec(arb_op(), 0..20)
        )| {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let (applied, value) = rt.block_on(async {
                let (scope, _joiner) = Scope::new("prop");
                let hot = HotData::with_value(
                    &scope, HotDataConfig::default(), 1_i64,
                );
                let applied = Arc::new(Mutex::new(Vec::new()));

                let producers = [(0_usize, left.clone()), (1, right.clone())]
                    .map(|(producer, ops)| {
                        let hot = hot.clone();
                        let applied = applied.clone();
                        tokio::spawn(async move {
                            for (idx, op) in ops.into_iter().enumerate() {
                                let applied = applied.clone();
                                hot.update_async(move |value| async move {
                                    applied.lock().unwrap()
                                        .push((producer, idx, op));
                                    Ok(op.apply(value))
                                })
                                .unwrap();
                            }
                        })
                    });
                for producer in producers {
                    producer.await.unwrap();
                }

                let value = hot
                    .update_blocking(|value| async move { Ok(value) })
                    .await
                    .unwrap();
                let applied = applied.lock().unwrap().clone();
                (applied, value)
            });

            assert_eq!(applied.len(), left.len() + right.len());
            let expected = applied
                .iter()
                .fold(1_i64, |value, (_, _, op)| op.apply(value));
            assert_eq!(value, expected);

            for producer in [0, 1] {
                let order = applied
                    .iter()
                    .filter(|(p, _, _)| *p == producer)
                    .map(|(_, idx, _)| *idx)
                    .collect::<Vec<_>>();
                let sorted = (0..order.len()).collect::<Vec<_>>();
                assert_eq!(order, sorted);
            }
        });
    }
}
