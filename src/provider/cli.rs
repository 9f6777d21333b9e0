//! Provider implementation that shells out to the provisioning executable.

use std::ffi::OsString;

use semver::Version;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner};

use super::wire::{
    InstanceListOutput, InstanceOutput, RecipeListOutput, VersionOutput, WhoAmIOutput,
    diagnostic_text,
};
use super::{
    InstanceHandle, InstanceProvider, PreflightError, PreflightFuture, ProviderFuture,
    ProvisioningError, Recipe, check_version,
};

/// Default provisioning executable name.
pub const DEFAULT_PROVIDER_BIN: &str = "gmsaas";

/// Diagnostics the tool prints when asked to stop an instance that is gone.
const ABSENT_INSTANCE_MARKERS: [&str; 3] = ["does not exist", "not found", "already deleted"];

/// Separators that end the clause naming what is missing.
const CLAUSE_BREAKS: [char; 5] = [',', ';', ':', '.', '\n'];

/// Drives the provisioning executable in `compactjson` mode.
#[derive(Clone, Debug)]
pub struct CliProvider<R: CommandRunner> {
    program: String,
    min_version: Version,
    runner: R,
}

impl CliProvider<ProcessCommandRunner> {
    /// Creates a provider wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(program: impl Into<String>, min_version: Version) -> Self {
        Self::new(program, min_version, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> CliProvider<R> {
    /// Creates a provider using the provided runner.
    #[must_use]
    pub fn new(program: impl Into<String>, min_version: Version, runner: R) -> Self {
        Self {
            program: program.into(),
            min_version,
            runner,
        }
    }

    /// Program invoked for every operation.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the version string reported by the tool.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError`] when the tool fails or prints malformed
    /// output.
    pub async fn version(&self) -> Result<String, ProvisioningError> {
        let parsed: VersionOutput = self.invoke_json("--version", &["--version"]).await?;
        Ok(parsed.version)
    }

    /// Returns the email of the authenticated account, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError`] when the tool fails or prints malformed
    /// output.
    pub async fn authenticated_email(&self) -> Result<Option<String>, ProvisioningError> {
        let parsed: WhoAmIOutput = self
            .invoke_json("auth whoami", &["auth", "whoami"])
            .await?;
        Ok(parsed
            .auth
            .email
            .filter(|email| !email.trim().is_empty()))
    }

    /// Lists recipes whose name contains `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError`] when the tool fails or prints malformed
    /// output.
    pub async fn recipes_by_name(&self, name: &str) -> Result<Vec<Recipe>, ProvisioningError> {
        let parsed: RecipeListOutput = self
            .invoke_json("recipes list", &["recipes", "list", "--name", name])
            .await?;
        Ok(parsed.recipes)
    }

    fn build_args(parts: &[&str]) -> Vec<OsString> {
        let mut args = vec![OsString::from("--format"), OsString::from("compactjson")];
        args.extend(parts.iter().map(OsString::from));
        args
    }

    async fn invoke(&self, parts: &[&str]) -> Result<CommandOutput, ProvisioningError> {
        let args = Self::build_args(parts);
        debug!(program = %self.program, args = ?args, "invoking provisioning tool");
        Ok(self.runner.run(&self.program, &args).await?)
    }

    fn command_failure(&self, operation: &str, output: &CommandOutput) -> ProvisioningError {
        ProvisioningError::CommandFailure {
            program: self.program.clone(),
            operation: operation.to_owned(),
            status: output.code,
            status_text: output.status_text(),
            diagnostic: diagnostic_text(&output.stdout, &output.stderr),
        }
    }

    async fn invoke_json<T>(&self, operation: &str, parts: &[&str]) -> Result<T, ProvisioningError>
    where
        T: DeserializeOwned,
    {
        let output = self.invoke(parts).await?;
        if !output.is_success() {
            return Err(self.command_failure(operation, &output));
        }
        parse_output(operation, &output.stdout)
    }
}

fn parse_output<T: DeserializeOwned>(operation: &str, stdout: &str) -> Result<T, ProvisioningError> {
    serde_json::from_str::<T>(stdout.trim()).map_err(|err| ProvisioningError::Parse {
        operation: operation.to_owned(),
        message: err.to_string(),
        raw: stdout.to_owned(),
    })
}

/// True when an absence marker refers to the instance itself.
///
/// The clause leading up to the marker must name an instance or the uuid
/// being stopped, so "API token not found" stays a failure.
fn reports_absent_instance(diagnostic: &str, uuid: &str) -> bool {
    let lowered = diagnostic.to_ascii_lowercase();
    let wanted = uuid.to_ascii_lowercase();
    ABSENT_INSTANCE_MARKERS.iter().any(|marker| {
        lowered.match_indices(marker).any(|(at, _)| {
            let subject = lowered
                .get(..at)
                .and_then(|before| before.rsplit(CLAUSE_BREAKS).next())
                .unwrap_or_default();
            subject.contains("instance") || (!wanted.is_empty() && subject.contains(&wanted))
        })
    })
}

impl<R> InstanceProvider for CliProvider<R>
where
    R: CommandRunner + Send + Sync,
{
    fn prepare(&self) -> PreflightFuture<'_> {
        Box::pin(async move {
            let version = self.version().await?;
            check_version(&self.program, &version, &self.min_version)?;
            if self.authenticated_email().await?.is_none() {
                return Err(PreflightError::Unauthenticated {
                    program: self.program.clone(),
                });
            }
            debug!(program = %self.program, %version, "provisioning tool ready");
            Ok(())
        })
    }

    fn create<'a>(
        &'a self,
        recipe: &'a Recipe,
        name: &'a str,
    ) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let parsed: InstanceOutput = self
                .invoke_json(
                    "instances start",
                    &["instances", "start", recipe.uuid.as_str(), name],
                )
                .await?;
            Ok(parsed.instance.into())
        })
    }

    fn delete<'a>(&'a self, uuid: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let output = self.invoke(&["instances", "stop", uuid]).await?;
            if output.is_success() {
                return Ok(());
            }
            let failure = self.command_failure("instances stop", &output);
            if let ProvisioningError::CommandFailure { diagnostic, .. } = &failure
                && reports_absent_instance(diagnostic, uuid)
            {
                warn!(%uuid, %diagnostic, "instance already absent; treating delete as done");
                return Ok(());
            }
            Err(failure)
        })
    }

    fn list(&self) -> ProviderFuture<'_, Vec<InstanceHandle>> {
        Box::pin(async move {
            let parsed: InstanceListOutput = self
                .invoke_json("instances list", &["instances", "list"])
                .await?;
            Ok(parsed
                .instances
                .into_iter()
                .map(InstanceHandle::from)
                .collect())
        })
    }

    fn connect<'a>(&'a self, uuid: &'a str) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let parsed: InstanceOutput = self
                .invoke_json("instances adbconnect", &["instances", "adbconnect", uuid])
                .await?;
            Ok(parsed.instance.into())
        })
    }
}
