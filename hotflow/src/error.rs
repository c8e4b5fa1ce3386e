use std::{fmt, sync::Arc};

use thiserror::Error;

/// Errors returned by [`HotData`](crate::HotData) operations.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The mutator returned an error. The value was left unchanged.
    #[error("Update failed: {0}")]
    Mutation(#[source] MutationError),
    /// The initializer failed, so there is no value to update or observe.
    #[error("Initialization failed: {0}")]
    Initialization(#[source] InitializationError),
    /// A bounded update queue had no room for another request.
    #[error("Update queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    /// The container stopped before the request could be serviced.
    #[error("Owning scope was cancelled")]
    ScopeCancelled,
}

/// An error returned by a mutator.
///
/// Cheap to clone: the same error is delivered to the awaiting caller and
/// broadcast in the matching [`StateEvent`](crate::StateEvent).
#[derive(Clone)]
pub struct MutationError(Arc<anyhow::Error>);

/// An error returned by a container's initializer.
#[derive(Clone)]
pub struct InitializationError(Arc<anyhow::Error>);

macro_rules! shared_anyhow_error {
    ($name:ident) => {
        impl $name {
            pub(crate) fn new(error: anyhow::Error) -> Self {
                Self(Arc::new(error))
            }

            /// The error exactly as it was returned.
            pub fn inner(&self) -> &anyhow::Error {
                &self.0
            }

            /// Downcast to the concrete error type that was returned.
            pub fn downcast_ref<E>(&self) -> Option<&E>
            where
                E: fmt::Display + fmt::Debug + Send + Sync + 'static,
            {
                self.0.downcast_ref::<E>()
            }

            /// Whether `self` and `other` are clones of the same error.
            pub fn ptr_eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Render the whole context chain.
                write!(f, "{:#}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }

        // `Display` already renders the full chain, so no `source()`.
        impl std::error::Error for $name {}
    };
}

shared_anyhow_error!(MutationError);
shared_anyhow_error!(InitializationError);
