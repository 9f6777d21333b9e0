//! Error types for the device registry.

use camino::Utf8PathBuf;
use thiserror::Error;

use super::RegistryScope;

/// Errors raised while reading or updating a registry ledger.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when the ledger file or directory cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the ledger lock cannot be acquired.
    #[error("failed to lock {path}: {message}")]
    Lock {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the ledger contents are not valid JSON.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Ledger file path.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when an instance is registered twice in the same scope.
    #[error("instance {uuid} is already registered in the {scope} registry")]
    AlreadyRegistered {
        /// Instance identifier.
        uuid: String,
        /// Scope that already holds the entry.
        scope: RegistryScope,
    },
    /// Raised when the blocking registry task does not complete.
    #[error("registry task failed: {0}")]
    Task(String),
}
