//! Error types for the provisioning tool.

use thiserror::Error;

use crate::command::CommandError;

/// Raised when a create, delete, list, or connect call fails.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisioningError {
    /// Raised when the provisioning tool exits with a non-zero status.
    #[error("{program} {operation} exited with status {status_text}: {diagnostic}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Operation being attempted (for example `instances start`).
        operation: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Raw diagnostic text emitted by the tool.
        diagnostic: String,
    },
    /// Raised when the tool's output cannot be parsed.
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// Operation whose output was malformed.
        operation: String,
        /// Parser error message.
        message: String,
        /// Raw output that failed to parse.
        raw: String,
    },
    /// Raised when the tool cannot be started.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Raised by `prepare()` before any allocation is attempted.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PreflightError {
    /// Raised when the provisioning tool is not installed.
    #[error("{program} was not found: install it and make sure it is on your PATH")]
    MissingTool {
        /// Program that could not be started.
        program: String,
    },
    /// Raised when the installed tool is older than the supported floor.
    #[error("{program} version {found} is too old: version {minimum} or newer is required, upgrade it and retry")]
    VersionTooOld {
        /// Program whose version was checked.
        program: String,
        /// Version reported by the tool.
        found: String,
        /// Minimum supported version.
        minimum: String,
    },
    /// Raised when the reported version cannot be understood.
    #[error("{program} reported an unrecognised version '{found}'")]
    UnparsableVersion {
        /// Program whose version was checked.
        program: String,
        /// Raw version string.
        found: String,
    },
    /// Raised when no authenticated session exists.
    #[error("{program} is not authenticated: run '{program} auth login <email>' and retry")]
    Unauthenticated {
        /// Program that reported the missing session.
        program: String,
    },
    /// Raised when a preflight query itself fails.
    #[error("preflight check failed: {0}")]
    Provisioning(#[source] ProvisioningError),
}

impl From<ProvisioningError> for PreflightError {
    fn from(value: ProvisioningError) -> Self {
        match value {
            ProvisioningError::Runner(CommandError::NotFound { program }) => {
                Self::MissingTool { program }
            }
            other => Self::Provisioning(other),
        }
    }
}
