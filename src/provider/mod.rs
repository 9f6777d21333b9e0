//! Provider abstraction for provisioning remote emulator instances.
//!
//! [`InstanceProvider`] is the narrow seam between the lease bookkeeping and
//! whatever actually creates instances. [`CliProvider`] implements it by
//! shelling out to the provisioning executable.

mod cli;
mod error;
mod preflight;
mod wire;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;

pub use cli::{CliProvider, DEFAULT_PROVIDER_BIN};
pub use error::{PreflightError, ProvisioningError};
pub use preflight::{DEFAULT_MIN_PROVIDER_VERSION, check_version};

/// Address reported by the provider before an ADB tunnel is established.
const DISCONNECTED_ADB_NAME: &str = "0.0.0.0";

/// Immutable descriptor of a provisionable hardware and OS image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Recipe {
    /// Provider identifier used to launch instances of this recipe.
    pub uuid: String,
    /// Human readable recipe name (for example `Pixel 6`).
    pub name: String,
    /// Operating system version shipped by the image.
    #[serde(default, alias = "android_version")]
    pub os_version: String,
    /// Hardware profile name.
    #[serde(default, alias = "screen")]
    pub hardware_profile: String,
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// Lifecycle state reported by the provider for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Instance is being allocated.
    Creating,
    /// Instance is starting.
    Starting,
    /// Guest OS is booting.
    Booting,
    /// Instance is ready for use.
    Online,
    /// Instance is being reset to a clean image.
    Recycling,
    /// Instance was reset and is ready again.
    Recycled,
    /// Instance is shutting down.
    Stopping,
    /// Instance deletion is in progress.
    Deleting,
    /// Instance no longer exists.
    Deleted,
    /// Provider reported a failure.
    Error,
    /// Any state this crate does not know about.
    Unknown(String),
}

impl InstanceState {
    /// Parses the provider's upper-case state string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATING" => Self::Creating,
            "STARTING" => Self::Starting,
            "BOOTING" => Self::Booting,
            "ONLINE" => Self::Online,
            "RECYCLING" => Self::Recycling,
            "RECYCLED" => Self::Recycled,
            "STOPPING" => Self::Stopping,
            "DELETING" => Self::Deleting,
            "DELETED" => Self::Deleted,
            "ERROR" => Self::Error,
            _ => Self::Unknown(value.to_owned()),
        }
    }

    /// Returns `true` when the instance can be handed to a caller.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Online | Self::Recycled)
    }
}

/// Handle describing one remote instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Stable provider identifier.
    pub uuid: String,
    /// Instance name chosen at creation time.
    pub name: String,
    /// Device-control address once the ADB tunnel is up.
    pub adb_name: String,
    /// Last state reported by the provider.
    pub state: InstanceState,
    /// Recipe the instance was launched from, when reported.
    pub recipe_uuid: Option<String>,
}

impl InstanceHandle {
    /// Returns `true` when the instance exposes a usable ADB address.
    #[must_use]
    pub fn is_adb_connected(&self) -> bool {
        let trimmed = self.adb_name.trim();
        !trimmed.is_empty() && trimmed != DISCONNECTED_ADB_NAME
    }

    /// Returns `true` when the instance was launched from `recipe`.
    #[must_use]
    pub fn matches_recipe(&self, recipe: &Recipe) -> bool {
        self.recipe_uuid.as_deref() == Some(recipe.uuid.as_str())
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisioningError>> + Send + 'a>>;

/// Future returned by [`InstanceProvider::prepare`].
pub type PreflightFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PreflightError>> + Send + 'a>>;

/// Operations every instance provider supports.
///
/// Implementations never retry; callers own the retry policy.
pub trait InstanceProvider {
    /// Verifies the provider is installed, recent enough, and authenticated.
    fn prepare(&self) -> PreflightFuture<'_>;

    /// Provisions a new instance of `recipe` named `name`.
    fn create<'a>(&'a self, recipe: &'a Recipe, name: &'a str)
    -> ProviderFuture<'a, InstanceHandle>;

    /// Deletes the instance. Deleting an absent instance succeeds.
    fn delete<'a>(&'a self, uuid: &'a str) -> ProviderFuture<'a, ()>;

    /// Lists every live instance visible to the account.
    fn list(&self) -> ProviderFuture<'_, Vec<InstanceHandle>>;

    /// Opens the ADB tunnel for an instance and returns the refreshed handle.
    fn connect<'a>(&'a self, uuid: &'a str) -> ProviderFuture<'a, InstanceHandle>;
}
