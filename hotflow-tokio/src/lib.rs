//! A crate containing utilities and extensions built on top of Tokio.

/// `CancelToken`, a level-triggered cancellation signal.
pub mod cancel;
/// Wraps a mpmc [`tokio::sync::broadcast`] to provide a convenient events bus.
pub mod events_bus;
/// `Scope`, the owner of a group of tasks and their unhandled errors.
pub mod scope;
/// `Task` and associated helpers.
pub mod task;

// Can save a `tokio` dependency declaration
pub use tokio;

/// Default capacity for Tokio broadcast channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;
