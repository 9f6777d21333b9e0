//! End-of-run janitor for emulease.
//!
//! Deletes every instance still listed in the global registry and prints a
//! summary with a remediation command for each instance it could not
//! delete. With `--dry-run` it only lists what is left.

use std::io::Write as _;

use clap::Parser;
use emulease::{EmuleaseConfig, ProcessCommandRunner, Teardown, init_tracing};

#[derive(Debug, Parser)]
#[command(
    name = "emulease-janitor",
    about = "Delete emulator instances left registered by a test run"
)]
struct Cli {
    /// Directory holding the registry ledgers.
    #[arg(long)]
    registry_dir: Option<String>,
    /// Path to the provisioning executable.
    #[arg(long)]
    provider_bin: Option<String>,
    /// Console URL printed alongside leaks.
    #[arg(long)]
    console_url: Option<String>,
    /// List leftover instances without deleting them.
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(self, mut config: EmuleaseConfig) -> EmuleaseConfig {
        if let Some(dir) = self.registry_dir {
            config.registry_dir = Some(dir);
        }
        if let Some(bin) = self.provider_bin {
            config.provider_bin = bin;
        }
        if let Some(url) = self.console_url {
            config.console_url = url;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    init_tracing();
    let cli = Cli::parse();
    let dry_run = cli.dry_run;
    let loaded = EmuleaseConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    let config = cli.apply(loaded);
    config.validate().map_err(|err| err.to_string())?;
    let registries = config.registries().map_err(|err| err.to_string())?;

    if dry_run {
        let leftovers = registries
            .global()
            .read_registered_devices()
            .await
            .map_err(|err| err.to_string())?;
        let rendered = if leftovers.is_empty() {
            String::from("no devices registered")
        } else {
            config.remediation().render_leftovers(&leftovers)
        };
        writeln!(std::io::stdout(), "{}", rendered.trim_end()).map_err(|err| err.to_string())?;
        return Ok(());
    }

    let provider = config
        .provider(ProcessCommandRunner)
        .map_err(|err| err.to_string())?;
    let teardown = Teardown::new(provider, registries, config.remediation());
    let report = teardown
        .global_cleanup()
        .await
        .map_err(|err| err.to_string())?;
    writeln!(std::io::stdout(), "{}", report.summary()).map_err(|err| err.to_string())?;
    if report.is_clean() {
        Ok(())
    } else {
        Err(format!(
            "{} of {} device(s) could not be deleted",
            report.leaks.len(),
            report.attempted()
        ))
    }
}
