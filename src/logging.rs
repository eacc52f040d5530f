//! Tracing subscriber bootstrap for binaries and examples.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Crates whose events the configured level applies to.
const CRATES: [&str; 3] = ["daq_align", "daq_core", "daq_driver_mock"];

/// Filter directives for `level`, e.g. `daq_align=debug,daq_core=debug,...`.
pub fn directives(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Fails if a global
/// subscriber is already installed.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(level)))
        .map_err(|e| anyhow!("invalid log filter: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
