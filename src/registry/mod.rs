//! Durable, cross-process ledgers of claimed emulator instances.
//!
//! Two scopes share one directory. The runtime ledger lists instances claimed
//! by a live allocation; the global ledger lists every instance this
//! installation launched and has not yet deleted, so a crashed run can be
//! swept later. All multi-ledger operations lock runtime before global.
//!
//! Runtime claims carry the pid of the process that made them. A process
//! drops its own claims on normal exit, and claims whose owner is no longer
//! running are pruned when the next run starts.

mod error;
mod ledger;
mod owners;

use std::collections::BTreeSet;
use std::fmt;
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::InstanceHandle;
use ledger::{Ledger, LockMode};

pub use error::RegistryError;

/// Named registry ledger.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RegistryScope {
    /// Claims held by live allocations.
    Runtime,
    /// Every launched instance that still needs deleting.
    Global,
}

impl RegistryScope {
    /// Ledger file name for the scope.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Runtime => "device.registry.json",
            Self::Global => "global-cleanup.registry.json",
        }
    }
}

impl fmt::Display for RegistryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime => f.write_str("runtime"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// One persisted claim.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistryEntry {
    /// Provider identifier of the instance.
    pub uuid: String,
    /// Instance name.
    pub name: String,
    /// Process that wrote the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Recipe the instance was launched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_uuid: Option<String>,
}

impl RegistryEntry {
    /// Creates an entry with no owner metadata.
    #[must_use]
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            pid: None,
            recipe_uuid: None,
        }
    }

    /// Creates an entry owned by the current process.
    #[must_use]
    pub fn for_instance(handle: &InstanceHandle) -> Self {
        Self {
            uuid: handle.uuid.clone(),
            name: handle.name.clone(),
            pid: Some(process::id()),
            recipe_uuid: handle.recipe_uuid.clone(),
        }
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, RegistryError>
where
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| RegistryError::Task(err.to_string()))?
}

/// A single registry scope backed by a file in `dir`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceRegistry {
    dir: Utf8PathBuf,
    scope: RegistryScope,
}

impl DeviceRegistry {
    /// Creates a handle to the `scope` ledger stored in `dir`.
    ///
    /// Nothing touches the filesystem until the first operation.
    #[must_use]
    pub fn new(dir: impl Into<Utf8PathBuf>, scope: RegistryScope) -> Self {
        Self {
            dir: dir.into(),
            scope,
        }
    }

    /// Scope of this ledger.
    #[must_use]
    pub const fn scope(&self) -> RegistryScope {
        self.scope
    }

    /// Directory holding the ledger.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Full path of the ledger file.
    #[must_use]
    pub fn path(&self) -> Utf8PathBuf {
        self.dir.join(self.scope.file_name())
    }

    /// Reads every entry under a shared lock.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the ledger cannot be locked, read, or
    /// parsed.
    pub async fn read_registered_devices(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let dir = self.dir.clone();
        let scope = self.scope;
        run_blocking(move || Ledger::open(&dir, scope, LockMode::Shared)?.entries()).await
    }

    /// Reads every entry without locking or awaiting.
    ///
    /// Any failure yields an empty list. Only meant for termination handlers.
    #[must_use]
    pub fn read_registered_devices_unsafe(&self) -> Vec<RegistryEntry> {
        ledger::read_unlocked(&self.dir, self.scope).unwrap_or_default()
    }

    /// Returns `true` when `uuid` has an entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the ledger cannot be read.
    pub async fn includes(&self, uuid: &str) -> Result<bool, RegistryError> {
        let entries = self.read_registered_devices().await?;
        Ok(entries.iter().any(|entry| entry.uuid == uuid))
    }

    /// Adds `entry`, persisting it before returning.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] when the uuid is already
    /// present, or another [`RegistryError`] when the ledger cannot be
    /// updated.
    pub async fn register_device(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        let dir = self.dir.clone();
        let scope = self.scope;
        run_blocking(move || {
            let ledger = Ledger::open(&dir, scope, LockMode::Exclusive)?;
            let mut entries = ledger.entries()?;
            insert_unique(&mut entries, entry, scope)?;
            ledger.store(&entries)
        })
        .await
    }

    /// Removes the entry for `uuid`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the ledger cannot be updated.
    pub async fn unregister_device(&self, uuid: &str) -> Result<bool, RegistryError> {
        let dir = self.dir.clone();
        let scope = self.scope;
        let target = uuid.to_owned();
        run_blocking(move || {
            let ledger = Ledger::open(&dir, scope, LockMode::Exclusive)?;
            let mut entries = ledger.entries()?;
            let removed = remove_uuid(&mut entries, &target);
            if removed {
                ledger.store(&entries)?;
            }
            Ok(removed)
        })
        .await
    }

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the ledger cannot be updated.
    pub async fn reset(&self) -> Result<(), RegistryError> {
        let dir = self.dir.clone();
        let scope = self.scope;
        run_blocking(move || Ledger::open(&dir, scope, LockMode::Exclusive)?.store(&[])).await
    }

    /// Removes every entry written by process `pid` and returns them.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the ledger cannot be updated.
    pub async fn unregister_owned_by(&self, pid: u32) -> Result<Vec<RegistryEntry>, RegistryError> {
        self.remove_matching(move |entries| {
            entries
                .into_iter()
                .partition(|entry| entry.pid == Some(pid))
        })
        .await
    }

    /// Removes entries whose owning process has exited and returns them.
    ///
    /// Entries without a recorded owner are kept.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the ledger cannot be updated.
    pub async fn unregister_orphans(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        self.remove_matching(|entries| {
            let owners = entries
                .iter()
                .filter_map(|entry| entry.pid)
                .collect::<BTreeSet<_>>();
            let alive = owners::running(&owners);
            entries
                .into_iter()
                .partition(|entry| entry.pid.is_some_and(|pid| !alive.contains(&pid)))
        })
        .await
    }

    /// Splits the ledger into `(removed, kept)` under the exclusive lock and
    /// stores the kept half.
    async fn remove_matching<F>(&self, split: F) -> Result<Vec<RegistryEntry>, RegistryError>
    where
        F: FnOnce(Vec<RegistryEntry>) -> (Vec<RegistryEntry>, Vec<RegistryEntry>) + Send + 'static,
    {
        let dir = self.dir.clone();
        let scope = self.scope;
        run_blocking(move || {
            let ledger = Ledger::open(&dir, scope, LockMode::Exclusive)?;
            let (removed, kept) = split(ledger.entries()?);
            if !removed.is_empty() {
                ledger.store(&kept)?;
            }
            Ok(removed)
        })
        .await
    }
}

fn insert_unique(
    entries: &mut Vec<RegistryEntry>,
    entry: RegistryEntry,
    scope: RegistryScope,
) -> Result<(), RegistryError> {
    if entries.iter().any(|existing| existing.uuid == entry.uuid) {
        return Err(RegistryError::AlreadyRegistered {
            uuid: entry.uuid,
            scope,
        });
    }
    entries.push(entry);
    Ok(())
}

fn remove_uuid(entries: &mut Vec<RegistryEntry>, uuid: &str) -> bool {
    let before = entries.len();
    entries.retain(|entry| entry.uuid != uuid);
    entries.len() != before
}

/// The runtime and global ledgers for one registry directory.
///
/// Construct once per process with [`Registries::open`] and clone the handle
/// where needed; clones address the same files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Registries {
    runtime: DeviceRegistry,
    global: DeviceRegistry,
}

impl Registries {
    /// Opens both scopes in `dir`.
    #[must_use]
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Self {
        let root = dir.into();
        Self {
            runtime: DeviceRegistry::new(root.clone(), RegistryScope::Runtime),
            global: DeviceRegistry::new(root, RegistryScope::Global),
        }
    }

    /// Runtime scope.
    #[must_use]
    pub const fn runtime(&self) -> &DeviceRegistry {
        &self.runtime
    }

    /// Global scope.
    #[must_use]
    pub const fn global(&self) -> &DeviceRegistry {
        &self.global
    }

    /// Records a freshly launched instance in both scopes in one locked step.
    ///
    /// The global entry is written first so a crash between the two writes
    /// still leaves the instance discoverable by the teardown sweep.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when either ledger cannot be updated or
    /// already lists the instance.
    pub async fn register_launched(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        let dir = self.runtime.dir.clone();
        run_blocking(move || {
            let runtime = Ledger::open(&dir, RegistryScope::Runtime, LockMode::Exclusive)?;
            let global = Ledger::open(&dir, RegistryScope::Global, LockMode::Exclusive)?;
            let mut runtime_entries = runtime.entries()?;
            let mut global_entries = global.entries()?;
            insert_unique(&mut global_entries, entry.clone(), RegistryScope::Global)?;
            insert_unique(&mut runtime_entries, entry, RegistryScope::Runtime)?;
            global.store(&global_entries)?;
            runtime.store(&runtime_entries)
        })
        .await
    }

    /// Claims the first candidate that is globally registered and not yet
    /// claimed, recording it in the runtime scope.
    ///
    /// Candidates are tried in order. Returns `None` when every candidate is
    /// taken or unknown to this installation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when either ledger cannot be read or the
    /// runtime ledger cannot be updated.
    pub async fn claim_first_free(
        &self,
        candidates: Vec<RegistryEntry>,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let dir = self.runtime.dir.clone();
        run_blocking(move || {
            let runtime = Ledger::open(&dir, RegistryScope::Runtime, LockMode::Exclusive)?;
            let known = Ledger::open(&dir, RegistryScope::Global, LockMode::Shared)?
                .entries()?
                .into_iter()
                .map(|entry| entry.uuid)
                .collect::<BTreeSet<_>>();
            let mut claimed = runtime.entries()?;
            let taken = claimed
                .iter()
                .map(|entry| entry.uuid.clone())
                .collect::<BTreeSet<_>>();

            let Some(choice) = candidates
                .into_iter()
                .find(|candidate| known.contains(&candidate.uuid) && !taken.contains(&candidate.uuid))
            else {
                return Ok(None);
            };
            debug!(uuid = %choice.uuid, "claiming registered instance");
            claimed.push(choice.clone());
            runtime.store(&claimed)?;
            Ok(Some(choice))
        })
        .await
    }

    /// Removes `uuid` from both scopes, runtime first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when either ledger cannot be updated.
    pub async fn unregister_everywhere(&self, uuid: &str) -> Result<(), RegistryError> {
        let dir = self.runtime.dir.clone();
        let target = uuid.to_owned();
        run_blocking(move || {
            let runtime = Ledger::open(&dir, RegistryScope::Runtime, LockMode::Exclusive)?;
            let global = Ledger::open(&dir, RegistryScope::Global, LockMode::Exclusive)?;
            let mut runtime_entries = runtime.entries()?;
            if remove_uuid(&mut runtime_entries, &target) {
                runtime.store(&runtime_entries)?;
            }
            let mut global_entries = global.entries()?;
            if remove_uuid(&mut global_entries, &target) {
                global.store(&global_entries)?;
            }
            Ok(())
        })
        .await
    }
}
