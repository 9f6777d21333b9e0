//! Termination hook reporting devices left behind by an interrupted run.
//!
//! The hook never deletes anything: the process is already going away and
//! remote calls cannot be trusted to finish. It only reads the global ledger
//! without locking and prints what a later sweep or the user must clean up.

use std::io::{self, Write};
use std::process;
use std::sync::{Mutex, OnceLock, PoisonError};

use thiserror::Error;
use tracing::warn;

use super::report::Remediation;
use crate::registry::DeviceRegistry;

/// Exit status used after an interrupt, matching shells' `128 + SIGINT`.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

struct HookState {
    registry: DeviceRegistry,
    remediation: Remediation,
}

static HOOK: OnceLock<HookState> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());

/// Raised when the termination hook cannot be installed.
#[derive(Debug, Error)]
pub enum SignalHookError {
    /// Raised when the OS refuses the signal handler.
    #[error("failed to install termination handler: {0}")]
    Install(#[from] ctrlc::Error),
}

/// Writes the leftover-device summary for an interrupted run.
///
/// Synchronous and lock-free: the ledger is read with
/// [`DeviceRegistry::read_registered_devices_unsafe`]. Returns the number of
/// entries reported.
pub fn report_interrupted_exit(
    registry: &DeviceRegistry,
    remediation: &Remediation,
    mut target: impl Write,
) -> usize {
    let leftovers = registry.read_registered_devices_unsafe();
    if !leftovers.is_empty() {
        write!(target, "{}", remediation.render_leftovers(&leftovers)).ok();
        target.flush().ok();
    }
    leftovers.len()
}

/// Installs the termination hook once per process.
///
/// Returns `true` when this call installed the hook and `false` when it was
/// already installed; later calls never replace the first registry.
///
/// # Errors
///
/// Returns [`SignalHookError`] when the handler cannot be registered.
pub fn global_init(
    registry: DeviceRegistry,
    remediation: Remediation,
) -> Result<bool, SignalHookError> {
    let _installing = INSTALL.lock().unwrap_or_else(PoisonError::into_inner);
    if HOOK.get().is_some() {
        return Ok(false);
    }
    ctrlc::set_handler(|| {
        if let Some(state) = HOOK.get() {
            let reported = report_interrupted_exit(&state.registry, &state.remediation, io::stderr());
            if reported > 0 {
                warn!(devices = reported, "interrupted with devices still registered");
            }
        }
        process::exit(INTERRUPTED_EXIT_CODE);
    })?;
    HOOK.get_or_init(|| HookState {
        registry,
        remediation,
    });
    Ok(true)
}
