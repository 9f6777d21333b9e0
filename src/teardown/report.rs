//! Leak records and end-of-run summaries.

use std::fmt::Write as _;

use shell_escape::unix::escape;

use crate::registry::RegistryEntry;

/// Default location where leaked instances can be inspected and stopped.
pub const DEFAULT_CONSOLE_URL: &str = "https://cloud.geny.io/instances";

/// An instance whose deletion could not be confirmed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeletionLeak {
    /// Provider identifier.
    pub uuid: String,
    /// Instance name.
    pub name: String,
    /// Why deletion failed.
    pub error: String,
}

/// How a user can clean up leaked instances by hand.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Remediation {
    /// Provisioning executable used in the suggested command.
    pub provider_bin: String,
    /// Console URL listing live instances.
    pub console_url: String,
}

impl Remediation {
    /// Creates remediation hints for `provider_bin`.
    #[must_use]
    pub fn new(provider_bin: impl Into<String>, console_url: impl Into<String>) -> Self {
        Self {
            provider_bin: provider_bin.into(),
            console_url: console_url.into(),
        }
    }

    /// Shell command that deletes `uuid`.
    #[must_use]
    pub fn command_for(&self, uuid: &str) -> String {
        format!(
            "{} instances stop {}",
            escape(self.provider_bin.as_str().into()),
            escape(uuid.into())
        )
    }

    /// Renders one block per leftover entry, used by the signal path.
    #[must_use]
    pub fn render_leftovers(&self, entries: &[RegistryEntry]) -> String {
        let mut rendered = format!(
            "{} device(s) still registered and possibly running:\n",
            entries.len()
        );
        for entry in entries {
            writeln!(rendered, "  - {} ({})", entry.uuid, entry.name).ok();
            writeln!(rendered, "    run: {}", self.command_for(&entry.uuid)).ok();
        }
        writeln!(rendered, "  manage instances at {}", self.console_url).ok();
        rendered
    }
}

/// Outcome of a global cleanup sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TeardownReport {
    /// Entries whose instances were confirmed deleted.
    pub deleted: Vec<RegistryEntry>,
    /// Entries whose deletion failed.
    pub leaks: Vec<DeletionLeak>,
    remediation: Remediation,
}

impl TeardownReport {
    pub(super) const fn new(
        deleted: Vec<RegistryEntry>,
        leaks: Vec<DeletionLeak>,
        remediation: Remediation,
    ) -> Self {
        Self {
            deleted,
            leaks,
            remediation,
        }
    }

    /// Returns `true` when nothing leaked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Number of delete attempts made.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.deleted.len() + self.leaks.len()
    }

    /// Human readable summary with a remediation command per leak.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_clean() {
            return format!(
                "teardown completed successfully: {} device(s) deleted",
                self.deleted.len()
            );
        }
        let mut rendered = format!(
            "teardown completed with warnings: {} of {} device(s) could not be deleted\n",
            self.leaks.len(),
            self.attempted()
        );
        for leak in &self.leaks {
            writeln!(rendered, "  - {} ({}): {}", leak.uuid, leak.name, leak.error).ok();
            writeln!(rendered, "    run: {}", self.remediation.command_for(&leak.uuid)).ok();
        }
        write!(
            rendered,
            "  manage instances at {}",
            self.remediation.console_url
        )
        .ok();
        rendered
    }
}
