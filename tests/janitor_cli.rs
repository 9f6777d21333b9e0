//! Behavioural tests for the `emulease-janitor` binary.

use assert_cmd::cargo::cargo_bin_cmd;
use camino::Utf8PathBuf;
use predicates::prelude::*;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const GLOBAL_LEDGER: &str = "global-cleanup.registry.json";

struct JanitorDir {
    temp: TempDir,
    root: Utf8PathBuf,
}

impl JanitorDir {
    fn seed_global(&self, uuids: &[&str]) {
        let entries = uuids
            .iter()
            .map(|uuid| format!("{{\"uuid\":\"{uuid}\",\"name\":\"emulease-{uuid}\"}}"))
            .collect::<Vec<_>>()
            .join(",");
        std::fs::write(self.root.join(GLOBAL_LEDGER), format!("[{entries}]"))
            .unwrap_or_else(|err| panic!("seed ledger: {err}"));
    }

    fn global_ledger(&self) -> String {
        std::fs::read_to_string(self.root.join(GLOBAL_LEDGER)).unwrap_or_default()
    }

    #[cfg(unix)]
    fn fake_provider(&self, exit_code: i32, stderr: &str) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt as _;

        let path = self.root.join("fake-gmsaas");
        let script = format!("#!/bin/sh\necho '{stderr}' >&2\nexit {exit_code}\n");
        std::fs::write(&path, script).unwrap_or_else(|err| panic!("write script: {err}"));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|err| panic!("chmod script: {err}"));
        path
    }

    fn janitor(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("emulease-janitor");
        cmd.current_dir(self.temp.path())
            .env_remove("EMULEASE_CONFIG_PATH")
            .env("RUST_LOG", "off")
            .arg("--registry-dir")
            .arg(self.root.as_str());
        cmd
    }
}

#[fixture]
fn janitor_dir() -> JanitorDir {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(temp.path().join("registry"))
        .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
    std::fs::create_dir_all(&root).unwrap_or_else(|err| panic!("mkdir: {err}"));
    JanitorDir { temp, root }
}

#[rstest]
fn empty_registry_is_a_successful_no_op(janitor_dir: JanitorDir) {
    janitor_dir
        .janitor()
        .arg("--provider-bin")
        .arg("emulease-missing-provider")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "teardown completed successfully: 0 device(s) deleted",
        ));
}

#[rstest]
fn dry_run_lists_leftovers_without_deleting(janitor_dir: JanitorDir) {
    janitor_dir.seed_global(&["a1", "b2"]);

    janitor_dir
        .janitor()
        .arg("--provider-bin")
        .arg("emulease-missing-provider")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("a1 (emulease-a1)"))
        .stdout(predicate::str::contains("emulease-missing-provider instances stop b2"));

    assert!(janitor_dir.global_ledger().contains("b2"));
}

#[cfg(unix)]
#[rstest]
fn confirmed_deletes_empty_the_registry(janitor_dir: JanitorDir) {
    janitor_dir.seed_global(&["a1"]);
    let provider = janitor_dir.fake_provider(0, "");

    janitor_dir
        .janitor()
        .arg("--provider-bin")
        .arg(provider.as_str())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 device(s) deleted"));

    assert!(!janitor_dir.global_ledger().contains("a1"));
}

#[cfg(unix)]
#[rstest]
fn failed_deletes_are_reported_with_remediation(janitor_dir: JanitorDir) {
    janitor_dir.seed_global(&["a1"]);
    let provider = janitor_dir.fake_provider(1, "backend timeout");

    janitor_dir
        .janitor()
        .arg("--provider-bin")
        .arg(provider.as_str())
        .arg("--console-url")
        .arg("https://console.example/instances")
        .assert()
        .failure()
        .stdout(predicate::str::contains("teardown completed with warnings"))
        .stdout(predicate::str::contains("backend timeout"))
        .stdout(predicate::str::contains("instances stop a1"))
        .stdout(predicate::str::contains("https://console.example/instances"))
        .stderr(predicate::str::contains("1 of 1 device(s) could not be deleted"));

    assert!(janitor_dir.global_ledger().contains("a1"));
}
