use std::{borrow::Cow, num::NonZeroUsize};

/// When a [`HotData`](crate::HotData) starts its consumer task, which is
/// also when its initializer runs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SharingPolicy {
    /// Start on first use: the first poll of a [`data`] stream, or the first
    /// [`current`] or [`update_blocking`] call. Requests sent with
    /// [`update_async`] before then wait in the queue.
    ///
    /// [`data`]: crate::HotData::data
    /// [`current`]: crate::HotData::current
    /// [`update_blocking`]: crate::HotData::update_blocking
    /// [`update_async`]: crate::HotData::update_async
    #[default]
    Lazily,
    /// Start as soon as the container is constructed.
    Eagerly,
}

/// Configuration for a [`HotData`](crate::HotData).
///
/// ```
/// # use std::num::NonZeroUsize;
/// # use hotflow::{HotDataConfig, SharingPolicy};
/// let config = HotDataConfig::default()
///     .with_tag("settings")
///     .with_sharing(SharingPolicy::Eagerly)
///     .with_queue_capacity(NonZeroUsize::new(64).unwrap());
/// assert_eq!(config.tag.as_deref(), Some("settings"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct HotDataConfig {
    /// Diagnostic tag, used in the consumer task's name and tracing span.
    pub tag: Option<Cow<'static, str>>,
    pub sharing: SharingPolicy,
    /// `None` (the default) means the update queue is unbounded. With a
    /// capacity, enqueueing never waits; it fails with
    /// [`Error::QueueFull`](crate::Error::QueueFull) instead.
    pub queue_capacity: Option<NonZeroUsize>,
}

impl HotDataConfig {
    pub fn with_tag(mut self, tag: impl Into<Cow<'static, str>>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_sharing(mut self, sharing: SharingPolicy) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// `hot-data` or `hot-data:<tag>`
    pub(crate) fn task_name(&self) -> Cow<'static, str> {
        match &self.tag {
            Some(tag) => Cow::Owned(format!("hot-data:{tag}")),
            None => Cow::Borrowed("hot-data"),
        }
    }
}
