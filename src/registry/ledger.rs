//! Locked, crash-safe access to a single registry file.
//!
//! Every ledger file `<name>.json` has a sibling `<name>.json.lock` that is
//! `flock`ed for the duration of a read-modify-write cycle. Writes land in a
//! temporary file, are fsync'd, and then renamed over the ledger. Temporary
//! files orphaned by a crash mid-write are removed the next time the ledger
//! is opened exclusively.

use std::io::{ErrorKind, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions};
use fs2::FileExt;
use tracing::{debug, warn};

use super::{RegistryEntry, RegistryError, RegistryScope};

/// Lock flavour requested when opening a ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum LockMode {
    Shared,
    Exclusive,
}

/// An open ledger holding its lock until dropped.
pub(super) struct Ledger {
    dir: Dir,
    path: Utf8PathBuf,
    file_name: &'static str,
    // Closing the descriptor releases the flock.
    _lock: std::fs::File,
}

impl Ledger {
    pub(super) fn open(
        root: &Utf8Path,
        scope: RegistryScope,
        mode: LockMode,
    ) -> Result<Self, RegistryError> {
        let file_name = scope.file_name();
        let path = root.join(file_name);
        let dir = open_root(root, true)?;

        let lock_name = format!("{file_name}.lock");
        let lock_path = root.join(&lock_name);
        let lock = dir
            .open_with(
                &lock_name,
                OpenOptions::new().read(true).write(true).create(true),
            )
            .map_err(|err| RegistryError::Io {
                path: lock_path.clone(),
                message: err.to_string(),
            })?
            .into_std();

        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&lock),
            LockMode::Exclusive => FileExt::lock_exclusive(&lock),
        };
        locked.map_err(|err| RegistryError::Lock {
            path: lock_path,
            message: err.to_string(),
        })?;

        let ledger = Self {
            dir,
            path,
            file_name,
            _lock: lock,
        };
        if mode == LockMode::Exclusive {
            ledger.remove_stale_temp_files();
        }
        Ok(ledger)
    }

    /// Deletes `<file>.<pid>.tmp` siblings. Writers hold the exclusive lock
    /// for the whole write, so any such file seen here is orphaned.
    fn remove_stale_temp_files(&self) {
        let prefix = format!("{}.", self.file_name);
        let listing = match self.dir.entries() {
            Ok(listing) => listing,
            Err(err) => {
                warn!(path = %self.path, error = %err, "cannot scan for stale ledger writes");
                return;
            }
        };
        let stale = listing
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().ok())
            .filter(|name| name.starts_with(&prefix) && name.ends_with(".tmp"));
        for name in stale {
            match self.dir.remove_file(&name) {
                Ok(()) => debug!(file = %name, "removed stale ledger write"),
                Err(err) => warn!(file = %name, error = %err, "cannot remove stale ledger write"),
            }
        }
    }

    pub(super) fn entries(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        read_entries(&self.dir, &self.path, self.file_name)
    }

    pub(super) fn store(&self, entries: &[RegistryEntry]) -> Result<(), RegistryError> {
        let io_error = |err: std::io::Error| RegistryError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        };
        let serialised = serde_json::to_string_pretty(entries).map_err(|err| RegistryError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;

        let temp_name = format!("{}.{}.tmp", self.file_name, process::id());
        let mut temp = self.dir.create(&temp_name).map_err(io_error)?;
        temp.write_all(serialised.as_bytes()).map_err(io_error)?;
        temp.sync_all().map_err(io_error)?;
        drop(temp);

        self.dir
            .rename(&temp_name, &self.dir, self.file_name)
            .map_err(io_error)
    }
}

/// Reads a ledger without taking its lock.
///
/// Used from the signal path, where waiting on another process is not an
/// option. A concurrent writer can only make this observe the previous
/// contents because writes are atomic renames.
pub(super) fn read_unlocked(
    root: &Utf8Path,
    scope: RegistryScope,
) -> Result<Vec<RegistryEntry>, RegistryError> {
    let file_name = scope.file_name();
    let path = root.join(file_name);
    let dir = open_root(root, false)?;
    read_entries(&dir, &path, file_name)
}

fn open_root(root: &Utf8Path, create: bool) -> Result<Dir, RegistryError> {
    let io_error = |err: std::io::Error| RegistryError::Io {
        path: root.to_path_buf(),
        message: err.to_string(),
    };
    if create {
        Dir::create_ambient_dir_all(root, ambient_authority()).map_err(io_error)?;
    }
    Dir::open_ambient_dir(root, ambient_authority()).map_err(io_error)
}

fn read_entries(
    dir: &Dir,
    path: &Utf8Path,
    file_name: &str,
) -> Result<Vec<RegistryEntry>, RegistryError> {
    let contents = match dir.read_to_string(file_name) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    };
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&contents).map_err(|err| RegistryError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
