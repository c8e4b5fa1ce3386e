//! # `hotflow`
//!
//! [`HotData`] is a thread-safe, observable piece of state for view models
//! and services: one consumer task applies updates in order, callers can
//! fire-and-forget or await their own update, and any number of subscribers
//! watch the latest value.
//!
//! A container lives inside a [`Scope`](hotflow_tokio::scope::Scope), which
//! bounds its lifetime and receives any errors nobody handled (see
//! [`report`]).

/// `HotDataConfig` and `SharingPolicy`.
pub mod config;
/// Error types.
pub mod error;
/// `HotData`, the state container.
pub mod hot_data;
/// `ErrorReporter` implementations.
pub mod report;
/// The update queue.
mod update;

pub use config::{HotDataConfig, SharingPolicy};
pub use error::{Error, InitializationError, MutationError};
pub use hot_data::{HotData, StateEvent};
pub use update::RequestId;
