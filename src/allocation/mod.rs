//! Hands out emulator instances, preferring reuse over provisioning.
//!
//! Candidates are listed without any lock held. The claim itself runs under
//! the runtime ledger's exclusive file lock, which every task and every
//! process sharing the registry directory takes through its own open file,
//! so no instance is claimed twice.
//!
//! Claims are recorded against the claiming process. [`release_all`] drops
//! them on normal exit and [`reclaim_orphaned_claims`] drops those left by
//! processes that died without releasing.
//!
//! [`release_all`]: AllocationCoordinator::release_all
//! [`reclaim_orphaned_claims`]: AllocationCoordinator::reclaim_orphaned_claims

use std::process;

use thiserror::Error;
use tracing::{info, warn};

use crate::events::{DeviceEvent, EventBus};
use crate::launcher::InstanceLauncher;
use crate::provider::{InstanceHandle, InstanceProvider, ProvisioningError, Recipe};
use crate::registry::{Registries, RegistryEntry, RegistryError};

/// Errors surfaced while allocating, releasing, or shutting down instances.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AllocationError {
    /// Raised when the provider rejects a create, delete, list, or connect.
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),
    /// Raised when the registry cannot be read or updated.
    #[error("device registry failure: {0}")]
    Registry(#[from] RegistryError),
}

/// Matches device requests to free instances or new launches.
#[derive(Debug)]
pub struct AllocationCoordinator<P> {
    provider: P,
    launcher: InstanceLauncher<P>,
    registries: Registries,
    events: EventBus,
}

impl<P> AllocationCoordinator<P>
where
    P: InstanceProvider + Clone,
{
    /// Creates a coordinator and the launcher it provisions through.
    #[must_use]
    pub fn new(provider: P, registries: Registries, events: EventBus) -> Self {
        let launcher = InstanceLauncher::new(provider.clone(), registries.clone(), events.clone());
        Self::with_launcher(provider, launcher, registries, events)
    }

    /// Creates a coordinator around an existing launcher.
    #[must_use]
    pub fn with_launcher(
        provider: P,
        launcher: InstanceLauncher<P>,
        registries: Registries,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            launcher,
            registries,
            events,
        }
    }
}

impl<P: InstanceProvider> AllocationCoordinator<P> {
    /// Provider used for listing and connecting.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Launcher used when no free instance exists.
    #[must_use]
    pub const fn launcher(&self) -> &InstanceLauncher<P> {
        &self.launcher
    }

    /// Registries this coordinator claims in.
    #[must_use]
    pub const fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Returns an instance of `recipe` claimed exclusively for the caller.
    ///
    /// A free, already provisioned instance is reused when one exists;
    /// otherwise a new one is launched. The returned handle always carries a
    /// connected ADB address.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] when listing, launching, connecting, or
    /// claiming fails.
    pub async fn allocate_device(&self, recipe: &Recipe) -> Result<InstanceHandle, AllocationError> {
        let handle = match self.claim_free_instance(recipe).await? {
            Some(reused) => {
                info!(uuid = %reused.uuid, recipe = %recipe, "reusing free device");
                self.events.emit(DeviceEvent::Claimed {
                    uuid: reused.uuid.clone(),
                });
                reused
            }
            None => self.launcher.launch(recipe).await?,
        };
        self.ensure_connected(handle).await
    }

    /// Releases the caller's claim. The instance stays alive for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Registry`] when the runtime ledger cannot
    /// be updated.
    pub async fn deallocate_device(&self, uuid: &str) -> Result<(), AllocationError> {
        if self.registries.runtime().unregister_device(uuid).await? {
            info!(%uuid, "device released");
            self.events.emit(DeviceEvent::Released {
                uuid: uuid.to_owned(),
            });
        } else {
            warn!(%uuid, "released a device that held no claim");
        }
        Ok(())
    }

    /// Releases every claim held by this process and returns how many.
    ///
    /// Call once on normal exit; the instances stay in the global ledger for
    /// the next run or the teardown sweep.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Registry`] when the runtime ledger cannot
    /// be updated.
    pub async fn release_all(&self) -> Result<usize, AllocationError> {
        let released = self
            .registries
            .runtime()
            .unregister_owned_by(process::id())
            .await?;
        for entry in &released {
            self.events.emit(DeviceEvent::Released {
                uuid: entry.uuid.clone(),
            });
        }
        info!(count = released.len(), "released claims held by this process");
        Ok(released.len())
    }

    /// Drops claims whose owning process is no longer running.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Registry`] when the runtime ledger cannot
    /// be updated.
    pub async fn reclaim_orphaned_claims(&self) -> Result<usize, AllocationError> {
        let orphans = self.registries.runtime().unregister_orphans().await?;
        for entry in &orphans {
            warn!(uuid = %entry.uuid, pid = ?entry.pid, "dropping claim of an exited process");
        }
        Ok(orphans.len())
    }

    async fn claim_free_instance(
        &self,
        recipe: &Recipe,
    ) -> Result<Option<InstanceHandle>, AllocationError> {
        let candidates = self
            .provider
            .list()
            .await?
            .into_iter()
            .filter(|instance| instance.state.is_usable() && instance.matches_recipe(recipe))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Ok(None);
        }

        let offered = candidates.iter().map(RegistryEntry::for_instance).collect();
        let claimed = self.registries.claim_first_free(offered).await?;
        Ok(claimed.and_then(|entry| {
            candidates
                .into_iter()
                .find(|candidate| candidate.uuid == entry.uuid)
        }))
    }

    async fn ensure_connected(
        &self,
        handle: InstanceHandle,
    ) -> Result<InstanceHandle, AllocationError> {
        if handle.is_adb_connected() {
            return Ok(handle);
        }
        match self.provider.connect(&handle.uuid).await {
            Ok(connected) => Ok(connected),
            Err(err) => {
                warn!(uuid = %handle.uuid, error = %err, "adb connect failed; releasing claim");
                self.registries.runtime().unregister_device(&handle.uuid).await?;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests;
