use tokio::sync::broadcast;

use crate::DEFAULT_CHANNEL_SIZE;

/// An [`EventsBus`] fans events out from one or more producers to any number
/// of listeners.
///
/// - Clone the [`EventsBus`] to get another handle to it.
/// - [`send`] is a noop when nobody is listening.
/// - [`subscribe`] returns a receiver that sees only events sent after it was
///   created. There is no replay.
///
/// Backed by a [`tokio::sync::broadcast`] channel so that sending never waits
/// on listeners and listeners that give up don't need to be cleaned up.
///
/// [`send`]: Self::send
/// [`subscribe`]: Self::subscribe
#[derive(Clone)]
pub struct EventsBus<T> {
    event_tx: broadcast::Sender<T>,
}

impl<T: Clone> EventsBus<T> {
    /// Create a new [`EventsBus`] with the default channel size.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::new_with_size(DEFAULT_CHANNEL_SIZE)
    }

    /// Create a new [`EventsBus`] with a custom channel size.
    pub fn new_with_size(size: usize) -> Self {
        Self {
            event_tx: broadcast::channel(size).0,
        }
    }

    /// Publish an event to all current listeners (if any).
    pub fn send(&self, event: T) {
        // Only errors when there are no receivers, which is fine.
        let _ = self.event_tx.send(event);
    }

    /// The number of listeners currently subscribed.
    pub fn listener_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Get a receiver which observes every event sent after this call.
    ///
    /// Start reading promptly; a receiver that falls more than the channel
    /// size behind skips the oldest events.
    pub fn subscribe(&self) -> EventsRx<T> {
        EventsRx {
            _event_tx: self.event_tx.clone(),
            event_rx: self.event_tx.subscribe(),
        }
    }
}

pub struct EventsRx<T> {
    // Keep a sender alive so the channel can't close underneath us.
    _event_tx: broadcast::Sender<T>,
    event_rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventsRx<T> {
    /// Wait for the next event.
    ///
    /// Will wait indefinitely, so ensure there's a timeout around this.
    pub async fn recv(&mut self) -> T {
        self.recv_filtered(|_| true).await
    }

    /// Wait for the next event that makes `filter` return true.
    ///
    /// Will wait indefinitely, so ensure there's a timeout around this.
    pub async fn recv_filtered(&mut self, filter: impl Fn(&T) -> bool) -> T {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.event_rx.recv().await {
                Ok(event) =>
                    if filter(&event) {
                        return event;
                    },
                Err(RecvError::Closed) => unreachable!(
                    "We hold a sender handle, so the channel can't be closed"
                ),
                // Fell behind and missed some events. Keep going.
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Events receiver lagged by {skipped}");
                }
            }
        }
    }
}
