//! Liveness of the processes recorded as entry owners.

use std::collections::BTreeSet;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Returns the members of `pids` that name a running process.
pub(super) fn running(pids: &BTreeSet<u32>) -> BTreeSet<u32> {
    if pids.is_empty() {
        return BTreeSet::new();
    }
    let wanted = pids.iter().copied().map(Pid::from_u32).collect::<Vec<_>>();
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&wanted),
        true,
        ProcessRefreshKind::new(),
    );
    pids.iter()
        .copied()
        .filter(|pid| system.process(Pid::from_u32(*pid)).is_some())
        .collect()
}
