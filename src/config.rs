//! Configuration loading via `ortho-config`.

use std::env;
use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use semver::Version;
use serde::Deserialize;
use thiserror::Error;

use crate::command::CommandRunner;
use crate::launcher::DEFAULT_NAME_PREFIX;
use crate::provider::{CliProvider, DEFAULT_MIN_PROVIDER_VERSION, DEFAULT_PROVIDER_BIN};
use crate::registry::Registries;
use crate::teardown::{DEFAULT_CONSOLE_URL, Remediation};

/// Directory under the system temp dir used when no registry dir is set.
const DEFAULT_REGISTRY_SUBDIR: &str = "emulease";

/// Settings shared by every worker of a test run, derived from environment
/// variables, configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "EMULEASE",
    discovery(
        app_name = "emulease",
        env_var = "EMULEASE_CONFIG_PATH",
        config_file_name = "emulease.toml",
        dotfile_name = ".emulease.toml",
        project_file_name = "emulease.toml"
    )
)]
pub struct EmuleaseConfig {
    /// Provisioning executable. Defaults to `gmsaas`.
    #[ortho_config(default = DEFAULT_PROVIDER_BIN.to_owned())]
    pub provider_bin: String,
    /// Directory holding the registry ledgers. Every process of a run must
    /// point at the same directory.
    pub registry_dir: Option<String>,
    /// Prefix for names of launched instances.
    #[ortho_config(default = DEFAULT_NAME_PREFIX.to_owned())]
    pub instance_name_prefix: String,
    /// Oldest supported provisioning tool release.
    #[ortho_config(default = DEFAULT_MIN_PROVIDER_VERSION.to_owned())]
    pub min_provider_version: String,
    /// Console URL printed with leak reports.
    #[ortho_config(default = DEFAULT_CONSOLE_URL.to_owned())]
    pub console_url: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to emulease.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const PROVIDER_BIN: FieldMetadata =
    FieldMetadata::new("provisioning tool", "EMULEASE_PROVIDER_BIN", "provider_bin");
const NAME_PREFIX: FieldMetadata = FieldMetadata::new(
    "instance name prefix",
    "EMULEASE_INSTANCE_NAME_PREFIX",
    "instance_name_prefix",
);
const MIN_VERSION: FieldMetadata = FieldMetadata::new(
    "minimum provisioning tool version",
    "EMULEASE_MIN_PROVIDER_VERSION",
    "min_provider_version",
);
const CONSOLE_URL: FieldMetadata =
    FieldMetadata::new("console URL", "EMULEASE_CONSOLE_URL", "console_url");

impl EmuleaseConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("emulease")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the failing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidVersion`] when the version floor is not a
    /// semantic version.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.provider_bin, &PROVIDER_BIN)?;
        Self::require_field(&self.instance_name_prefix, &NAME_PREFIX)?;
        Self::require_field(&self.min_provider_version, &MIN_VERSION)?;
        Self::require_field(&self.console_url, &CONSOLE_URL)?;
        self.min_version().map(|_| ())
    }

    /// Parsed version floor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidVersion`] when the value is not a
    /// semantic version.
    pub fn min_version(&self) -> Result<Version, ConfigError> {
        let raw = self.min_provider_version.trim();
        Version::parse(raw.strip_prefix('v').unwrap_or(raw)).map_err(|err| {
            ConfigError::InvalidVersion {
                value: self.min_provider_version.clone(),
                message: err.to_string(),
            }
        })
    }

    /// Registry directory, falling back to `<tmp>/emulease`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NonUtf8Path`] when the fallback temp directory
    /// is not valid UTF-8.
    pub fn registry_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        if let Some(dir) = self
            .registry_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
        {
            return Ok(Utf8PathBuf::from(dir));
        }
        let temp = Utf8PathBuf::from_path_buf(env::temp_dir())
            .map_err(|path| ConfigError::NonUtf8Path(path.display().to_string()))?;
        Ok(temp.join(DEFAULT_REGISTRY_SUBDIR))
    }

    /// Opens both registry scopes under [`Self::registry_dir`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the registry dir cannot be determined.
    pub fn registries(&self) -> Result<Registries, ConfigError> {
        Ok(Registries::open(self.registry_dir()?))
    }

    /// Builds the provider for this configuration on top of `runner`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidVersion`] when the version floor is
    /// malformed.
    pub fn provider<R: CommandRunner>(&self, runner: R) -> Result<CliProvider<R>, ConfigError> {
        Ok(CliProvider::new(
            self.provider_bin.trim(),
            self.min_version()?,
            runner,
        ))
    }

    /// Remediation hints matching this configuration.
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        Remediation::new(self.provider_bin.trim(), self.console_url.trim())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when the version floor is not a semantic version.
    #[error(
        "invalid min_provider_version '{value}': {message}; set EMULEASE_MIN_PROVIDER_VERSION to a version such as 1.6.0"
    )]
    InvalidVersion {
        /// Configured value.
        value: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a derived path is not valid UTF-8.
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
