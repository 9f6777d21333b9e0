//! End-of-run sweep deleting every instance still in the global registry.
//!
//! Deletes are dispatched concurrently and each failure is captured as a
//! [`DeletionLeak`], so one stuck instance never prevents attempts on the
//! rest. The signal-path counterpart lives in [`signal`].

mod report;
mod signal;

use futures::future::join_all;
use tracing::{info, warn};

use crate::events::{DeviceEvent, EventBus};
use crate::provider::InstanceProvider;
use crate::registry::{Registries, RegistryError};

pub use report::{DEFAULT_CONSOLE_URL, DeletionLeak, Remediation, TeardownReport};
pub use signal::{INTERRUPTED_EXIT_CODE, SignalHookError, global_init, report_interrupted_exit};

/// Reconciles the global registry against the provider.
#[derive(Clone, Debug)]
pub struct Teardown<P> {
    provider: P,
    registries: Registries,
    remediation: Remediation,
    events: EventBus,
}

impl<P: InstanceProvider> Teardown<P> {
    /// Creates a sweeper.
    #[must_use]
    pub fn new(provider: P, registries: Registries, remediation: Remediation) -> Self {
        Self {
            provider,
            registries,
            remediation,
            events: EventBus::default(),
        }
    }

    /// Publishes deletion events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Remediation hints used in reports.
    #[must_use]
    pub const fn remediation(&self) -> &Remediation {
        &self.remediation
    }

    /// Installs the termination hook for this sweeper's global registry.
    ///
    /// # Errors
    ///
    /// Returns [`SignalHookError`] when the handler cannot be registered.
    pub fn global_init(&self) -> Result<bool, SignalHookError> {
        global_init(self.registries.global().clone(), self.remediation.clone())
    }

    /// Deletes every globally registered instance and reports leaks.
    ///
    /// An empty registry is a successful no-op. Successfully deleted
    /// instances are removed from both scopes; failed ones stay registered
    /// so the next sweep retries them.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] only when the global ledger cannot be read.
    pub async fn global_cleanup(&self) -> Result<TeardownReport, RegistryError> {
        let entries = self.registries.global().read_registered_devices().await?;
        let outcomes = join_all(entries.into_iter().map(|entry| async move {
            let outcome = self.provider.delete(&entry.uuid).await;
            (entry, outcome)
        }))
        .await;

        let mut deleted = Vec::new();
        let mut leaks = Vec::new();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    if let Err(err) = self.registries.unregister_everywhere(&entry.uuid).await {
                        warn!(uuid = %entry.uuid, error = %err, "deleted device is still registered");
                    }
                    self.events.emit(DeviceEvent::Deleted {
                        uuid: entry.uuid.clone(),
                    });
                    deleted.push(entry);
                }
                Err(err) => leaks.push(DeletionLeak {
                    uuid: entry.uuid,
                    name: entry.name,
                    error: err.to_string(),
                }),
            }
        }

        let report = TeardownReport::new(deleted, leaks, self.remediation.clone());
        if report.is_clean() {
            info!(deleted = report.deleted.len(), "teardown completed successfully");
        } else {
            warn!(
                leaks = report.leaks.len(),
                summary = %report.summary(),
                "teardown completed with warnings"
            );
        }
        Ok(report)
    }
}
