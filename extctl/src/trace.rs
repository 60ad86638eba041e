//! Logging for the harness.
//!
//! `tracing` sits behind the `tracing` feature, on by default. Building with
//! `--no-default-features` turns every log macro into `()`, which keeps the
//! control loop free of formatting work.

/// Default filter when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "extctl=info";

/// Installs the global subscriber: uptime timestamps, thread names, filter
/// from `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored. A no-op without the
/// `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_timer(fmt::time::uptime())
        .with_file(false)
        .with_line_number(false);

    // Err only means a subscriber is already installed.
    let _ = tracing_subscriber::registry().with(layer).with(filter).try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {
        ()
    };
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    discard as debug, discard as error, discard as info, discard as trace, discard as warn,
};
