//! Provisions new instances and registers them before anyone can use them.

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::allocation::AllocationError;
use crate::events::{DeviceEvent, EventBus};
use crate::provider::{InstanceHandle, InstanceProvider, Recipe};
use crate::registry::{Registries, RegistryEntry};

/// Default prefix for names of launched instances.
pub const DEFAULT_NAME_PREFIX: &str = "emulease";

/// Creates and deletes remote instances, keeping both registry scopes in
/// step with the provider.
#[derive(Clone, Debug)]
pub struct InstanceLauncher<P> {
    provider: P,
    registries: Registries,
    events: EventBus,
    name_prefix: String,
}

impl<P: InstanceProvider> InstanceLauncher<P> {
    /// Creates a launcher.
    #[must_use]
    pub fn new(provider: P, registries: Registries, events: EventBus) -> Self {
        Self {
            provider,
            registries,
            events,
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
        }
    }

    /// Overrides the instance name prefix.
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    fn instance_name(&self) -> String {
        format!("{}-{}", self.name_prefix, Uuid::new_v4().simple())
    }

    /// Provisions a new instance of `recipe` and claims it for the caller.
    ///
    /// The instance is written to the global and runtime scopes straight
    /// after creation, before any other work happens on it.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Provisioning`] when creation fails (nothing
    /// is registered), or [`AllocationError::Registry`] when registration
    /// fails (the instance is deleted on a best-effort basis).
    pub async fn launch(&self, recipe: &Recipe) -> Result<InstanceHandle, AllocationError> {
        let name = self.instance_name();
        let handle = self.provider.create(recipe, &name).await?;

        let mut entry = RegistryEntry::for_instance(&handle);
        if entry.recipe_uuid.is_none() {
            entry.recipe_uuid = Some(recipe.uuid.clone());
        }
        if let Err(err) = self.registries.register_launched(entry).await {
            error!(uuid = %handle.uuid, error = %err, "failed to register launched instance");
            if let Err(delete_err) = self.provider.delete(&handle.uuid).await {
                warn!(
                    uuid = %handle.uuid,
                    error = %delete_err,
                    "unregistered instance could not be deleted and has leaked"
                );
            }
            return Err(err.into());
        }

        info!(uuid = %handle.uuid, name = %handle.name, recipe = %recipe, "device provisioned");
        self.events.emit(DeviceEvent::Provisioned {
            uuid: handle.uuid.clone(),
            name: handle.name.clone(),
            recipe: recipe.name.clone(),
        });
        Ok(handle)
    }

    /// Deletes the remote instance, then forgets it in both scopes.
    ///
    /// Entries are only removed after the provider confirms deletion, so a
    /// failed delete stays visible to the teardown sweep.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Provisioning`] when deletion fails, or
    /// [`AllocationError::Registry`] when the ledgers cannot be updated.
    pub async fn shutdown(&self, handle: &InstanceHandle) -> Result<(), AllocationError> {
        self.provider.delete(&handle.uuid).await?;
        self.registries.unregister_everywhere(&handle.uuid).await?;
        info!(uuid = %handle.uuid, name = %handle.name, "device shut down");
        self.events.emit(DeviceEvent::Deleted {
            uuid: handle.uuid.clone(),
        });
        Ok(())
    }
}
