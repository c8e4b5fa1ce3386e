//! Where unhandled errors end up.
//!
//! A [`Scope`](hotflow_tokio::scope::Scope) is constructed with an
//! [`ErrorReporter`]; every error raised onto the scope (e.g. a failed
//! [`update_async`](crate::HotData::update_async) without an error sink) is
//! sent to it. Crash reporting backends plug in here by implementing the
//! trait. This module provides the reporters that don't need a backend.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

pub use hotflow_tokio::scope::ErrorReporter;
use tracing::warn;

/// Logs every report with its full context chain.
#[derive(Copy, Clone, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &anyhow::Error) {
        warn!("Reporting: {error:#}");
    }
}

/// Gates a reporting backend behind a readiness flag.
///
/// Backends usually need some setup (consent, keys, metadata) before they can
/// accept reports. Until [`set_ready`](Self::set_ready) is called, reports
/// are logged and dropped.
pub struct Bugs {
    ready: AtomicBool,
    backend: Arc<dyn ErrorReporter>,
}

impl Bugs {
    pub fn new(backend: Arc<dyn ErrorReporter>) -> Self {
        Self {
            ready: AtomicBool::new(false),
            backend,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl ErrorReporter for Bugs {
    fn report(&self, error: &anyhow::Error) {
        if !self.is_ready() {
            warn!("Bug tracking not initialized yet, dropping: {error:#}");
            return;
        }
        self.backend.report(error);
    }
}

/// Keeps the rendered text of every report in memory, e.g. to show them in a
/// UI or to assert on them in tests.
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each report's `{:#}` rendering, oldest first.
    pub fn reports(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &anyhow::Error) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{error:#}"));
    }
}
