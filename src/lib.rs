//! Leases remote cloud emulator instances to concurrent test workers.
//!
//! Instances are provisioned through an external tool, recorded in a
//! crash-surviving registry shared by every process of a run, handed out
//! with single-owner semantics, and swept at the end of the run (or reported
//! when the run is interrupted) so nothing is left billing.

pub mod allocation;
pub mod command;
pub mod config;
pub mod control;
pub mod driver;
pub mod events;
pub mod launcher;
pub mod logging;
pub mod provider;
pub mod recipe;
pub mod registry;
pub mod teardown;
pub mod test_support;

pub use allocation::{AllocationCoordinator, AllocationError};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, EmuleaseConfig};
pub use control::{AdbDeviceControl, DeviceControl, DeviceControlError};
pub use driver::{AcquiredDevice, CloudDeviceDriver, DeviceDriver, DriverError};
pub use events::{DeviceEvent, EventBus};
pub use launcher::InstanceLauncher;
pub use logging::init_tracing;
pub use provider::{
    CliProvider, InstanceHandle, InstanceProvider, InstanceState, PreflightError,
    ProvisioningError, Recipe,
};
pub use recipe::{ConfigurationError, ProviderRecipeResolver, RecipeResolver};
pub use registry::{DeviceRegistry, Registries, RegistryEntry, RegistryError, RegistryScope};
pub use teardown::{DeletionLeak, Remediation, Teardown, TeardownReport};
