//! Logger configuration for programs and tests built on `hotflow`.
//!
//! Everything in the workspace logs through [`tracing`]; this crate only
//! decides where those events end up.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    fmt::MakeWriter,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize a global `tracing` logger that prints to stdout.
///
/// + The default log level includes INFO, WARN, and ERROR events.
/// + Set `RUST_LOG` to change the level or filter by target, e.g.
///   `RUST_LOG=info,hotflow=trace`. The syntax is documented here:
///   <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html>
///
/// Panics if a logger is already initialized, so don't use this in tests.
pub fn init() {
    try_init().expect("Failed to setup logger");
}

/// Try to initialize a global logger which prints to stdout. Returns an `Err`
/// if another global logger is already set.
pub fn try_init() -> Result<(), TryInitError> {
    try_init_with_writer(std::io::stdout, true)
}

/// Use this to initialize the global logger in tests.
///
/// Does nothing unless `RUST_LOG` is set, and doesn't care if another test
/// thread won the race to set the global logger. Output goes through the test
/// harness so it's only shown for failing tests (or with `--nocapture`).
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }

    let _ = try_init_with_writer(
        tracing_subscriber::fmt::TestWriter::new(),
        false,
    );
}

fn try_init_with_writer<W>(writer: W, ansi: bool) -> Result<(), TryInitError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = targets_or_default(rust_log.as_deref(), Level::INFO);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(writer)
        .with_filter(filter);

    tracing_subscriber::registry().with(fmt_layer).try_init()
}

/// Parse a `RUST_LOG`-style targets filter, falling back to `default` for
/// everything if the var is missing or doesn't parse.
fn targets_or_default(rust_log: Option<&str>, default: Level) -> Targets {
    rust_log
        .and_then(|rust_log| Targets::from_str(rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(default))
}
