//! `tracing` logger config.
//!
//! The log level is configurable via the `RUST_LOG` environment variable
//! (e.g. `RUST_LOG=debug`, or per-target: `RUST_LOG=warn,mpp_ln=debug`) and
//! defaults to `info`.

use std::io;

use anyhow::{anyhow, Context};
use tracing_subscriber::filter::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info";

/// Initialize the global `tracing` logger, printing enabled events to
/// stderr.
///
/// Panics if a logger is already initialized.
pub fn init(rust_log: Option<&str>) {
    try_init(rust_log).expect("Failed to set up logger");
}

/// Try to initialize the global logger.
/// Returns `Err` if another global logger is already set.
pub fn try_init(rust_log: Option<&str>) -> anyhow::Result<()> {
    let directives = rust_log.unwrap_or(DEFAULT_DIRECTIVES);
    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("Invalid RUST_LOG: {directives:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|err| anyhow!("Logger already initialized: {err:#}"))
}

/// Use this to initialize the global logger in tests. Multiple test threads
/// may race to set the global logger; losing the race is fine.
pub fn init_for_testing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let _ = try_init(rust_log.as_deref());
}
