//! Out-of-process command execution used to drive the provisioning tool.
//!
//! Every call into the provider goes through [`CommandRunner`] so tests can
//! substitute a scripted double for the real executable.

mod types;

pub use types::{CommandError, CommandFuture, CommandOutput, CommandRunner, ProcessCommandRunner};
