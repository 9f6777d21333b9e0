//! Test-runner facing driver built from the lease components.
//!
//! [`DeviceDriver`] is the capability a test runner selects at
//! configuration time; [`CloudDeviceDriver`] implements it for remote
//! emulator instances.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::allocation::{AllocationCoordinator, AllocationError};
use crate::control::{DeviceControl, DeviceControlError};
use crate::provider::{InstanceHandle, InstanceProvider, PreflightError, Recipe};
use crate::recipe::{ConfigurationError, RecipeResolver};

/// Errors surfaced by [`DeviceDriver`] operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when the device query resolves to no single recipe.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Raised when the provisioning tool is unusable.
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    /// Raised when a device cannot be allocated, released, or deleted.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// Raised when the connected device rejects a control call.
    #[error(transparent)]
    Control(#[from] DeviceControlError),
}

/// A device leased to the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcquiredDevice {
    /// Connected instance.
    pub handle: InstanceHandle,
    /// Recipe the instance runs.
    pub recipe: Recipe,
    /// Android API level reported by the device.
    pub api_level: u32,
}

impl AcquiredDevice {
    /// Device-control address.
    #[must_use]
    pub fn adb_name(&self) -> &str {
        &self.handle.adb_name
    }
}

/// Future returned by [`DeviceDriver`] operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Lifecycle a test runner drives for each worker.
pub trait DeviceDriver {
    /// Resolves `query` and leases a ready device.
    fn acquire<'a>(&'a self, query: &'a str) -> DriverFuture<'a, AcquiredDevice>;

    /// Installs the application under test and its test package.
    fn install<'a>(
        &'a self,
        device: &'a AcquiredDevice,
        app: &'a Utf8Path,
        test_app: &'a Utf8Path,
    ) -> DriverFuture<'a, ()>;

    /// Returns the device to the free pool.
    fn cleanup<'a>(&'a self, device: &'a AcquiredDevice) -> DriverFuture<'a, ()>;

    /// Deletes the device outright.
    fn shutdown<'a>(&'a self, device: &'a AcquiredDevice) -> DriverFuture<'a, ()>;
}

/// [`DeviceDriver`] for remote emulator instances.
#[derive(Debug)]
pub struct CloudDeviceDriver<P, Q, D> {
    coordinator: AllocationCoordinator<P>,
    resolver: Q,
    control: D,
    prepared: OnceCell<()>,
}

impl<P, Q, D> CloudDeviceDriver<P, Q, D>
where
    P: InstanceProvider + Send + Sync,
    Q: RecipeResolver + Send + Sync,
    D: DeviceControl + Send + Sync,
{
    /// Creates a driver.
    #[must_use]
    pub fn new(coordinator: AllocationCoordinator<P>, resolver: Q, control: D) -> Self {
        Self {
            coordinator,
            resolver,
            control,
            prepared: OnceCell::new(),
        }
    }

    /// Coordinator used to lease instances.
    #[must_use]
    pub const fn coordinator(&self) -> &AllocationCoordinator<P> {
        &self.coordinator
    }

    /// Runs the provider's preflight checks once per driver, then drops
    /// claims left behind by exited processes.
    ///
    /// A failed preparation is not cached, so a later call retries it.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Preflight`] when the tool is missing, too old,
    /// or unauthenticated, and [`DriverError::Allocation`] when stale claims
    /// cannot be cleared.
    pub async fn prepare(&self) -> Result<(), DriverError> {
        self.prepared
            .get_or_try_init(|| async {
                self.coordinator.provider().prepare().await?;
                self.coordinator.reclaim_orphaned_claims().await?;
                Ok::<(), DriverError>(())
            })
            .await?;
        Ok(())
    }

    /// Releases every device this process still holds. Call on normal exit.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Allocation`] when the runtime ledger cannot be
    /// updated.
    pub async fn release_all(&self) -> Result<usize, DriverError> {
        Ok(self.coordinator.release_all().await?)
    }

    async fn ready(
        &self,
        handle: InstanceHandle,
        recipe: Recipe,
    ) -> Result<AcquiredDevice, DeviceControlError> {
        let api_level = self.control.api_level(&handle.adb_name).await?;
        self.control.disable_animations(&handle.adb_name).await?;
        Ok(AcquiredDevice {
            handle,
            recipe,
            api_level,
        })
    }
}

impl<P, Q, D> DeviceDriver for CloudDeviceDriver<P, Q, D>
where
    P: InstanceProvider + Send + Sync,
    Q: RecipeResolver + Send + Sync,
    D: DeviceControl + Send + Sync,
{
    fn acquire<'a>(&'a self, query: &'a str) -> DriverFuture<'a, AcquiredDevice> {
        Box::pin(async move {
            self.prepare().await?;
            let recipe = self.resolver.resolve(query).await?;
            let handle = self.coordinator.allocate_device(&recipe).await?;
            let uuid = handle.uuid.clone();
            match self.ready(handle, recipe).await {
                Ok(device) => {
                    info!(
                        uuid = %device.handle.uuid,
                        adb_name = %device.adb_name(),
                        api_level = device.api_level,
                        "device acquired"
                    );
                    Ok(device)
                }
                Err(err) => {
                    warn!(%uuid, error = %err, "device failed to get ready; releasing it");
                    if let Err(release_err) = self.coordinator.deallocate_device(&uuid).await {
                        warn!(%uuid, error = %release_err, "failed to release device");
                    }
                    Err(err.into())
                }
            }
        })
    }

    fn install<'a>(
        &'a self,
        device: &'a AcquiredDevice,
        app: &'a Utf8Path,
        test_app: &'a Utf8Path,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.control.install(device.adb_name(), app, test_app).await?;
            Ok(())
        })
    }

    fn cleanup<'a>(&'a self, device: &'a AcquiredDevice) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.coordinator
                .deallocate_device(&device.handle.uuid)
                .await?;
            Ok(())
        })
    }

    fn shutdown<'a>(&'a self, device: &'a AcquiredDevice) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.coordinator.launcher().shutdown(&device.handle).await?;
            Ok(())
        })
    }
}
