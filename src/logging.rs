//! Tracing subscriber setup for binaries.

use std::io;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Installs a stderr `fmt` subscriber honouring `RUST_LOG`.
///
/// Safe to call more than once; only the first call has an effect, and a
/// subscriber installed elsewhere is left in place.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .try_init()
            .ok();
    });
}
