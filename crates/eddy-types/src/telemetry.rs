//! Tracing initialisation.
//!
//! Installs a `tracing-subscriber` `fmt` layer filtered by `RUST_LOG`, or by
//! the configured level when the environment variable is unset.

use tracing_subscriber::EnvFilter;

use crate::config::LogSection;

/// Initialise the global subscriber.
///
/// Safe to call more than once: later calls are ignored, which keeps
/// tests that each initialise logging from panicking.
pub fn init(config: &LogSection) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
