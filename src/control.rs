//! Device-control capability used once an instance is connected.
//!
//! [`DeviceControl`] is the seam the driver talks to after allocation.
//! [`AdbDeviceControl`] implements it with the `adb` executable through the
//! same [`CommandRunner`] used for the provisioning tool.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use thiserror::Error;
use tracing::debug;

use crate::command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};

/// Default device-control executable.
pub const DEFAULT_ADB_BIN: &str = "adb";

/// Global settings zeroed to make UI tests deterministic.
const ANIMATION_SETTINGS: [&str; 3] = [
    "window_animation_scale",
    "transition_animation_scale",
    "animator_duration_scale",
];

/// Raised when a device-control call fails.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeviceControlError {
    /// Raised when the control tool exits with a non-zero status.
    #[error("{operation} on {adb_name} exited with status {status_text}: {diagnostic}")]
    CommandFailure {
        /// Operation being attempted.
        operation: String,
        /// Device address.
        adb_name: String,
        /// Human readable exit status.
        status_text: String,
        /// Diagnostic text printed by the tool.
        diagnostic: String,
    },
    /// Raised when the device reports an unreadable API level.
    #[error("device {adb_name} reported an invalid API level '{raw}'")]
    InvalidApiLevel {
        /// Device address.
        adb_name: String,
        /// Raw property value.
        raw: String,
    },
    /// Raised when the control tool cannot be started.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Future returned by [`DeviceControl`] operations.
pub type ControlFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, DeviceControlError>> + Send + 'a>>;

/// Operations available on a connected device.
pub trait DeviceControl {
    /// Returns the Android API level of the device.
    fn api_level<'a>(&'a self, adb_name: &'a str) -> ControlFuture<'a, u32>;

    /// Turns off system animations.
    fn disable_animations<'a>(&'a self, adb_name: &'a str) -> ControlFuture<'a, ()>;

    /// Installs the application and its instrumentation package.
    fn install<'a>(
        &'a self,
        adb_name: &'a str,
        app: &'a Utf8Path,
        test_app: &'a Utf8Path,
    ) -> ControlFuture<'a, ()>;
}

/// [`DeviceControl`] backed by the `adb` executable.
#[derive(Clone, Debug)]
pub struct AdbDeviceControl<R: CommandRunner> {
    program: String,
    runner: R,
}

impl AdbDeviceControl<ProcessCommandRunner> {
    /// Creates a controller using `adb` from `PATH`.
    #[must_use]
    pub fn with_process_runner() -> Self {
        Self::new(DEFAULT_ADB_BIN, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AdbDeviceControl<R> {
    /// Creates a controller invoking `program` through `runner`.
    #[must_use]
    pub fn new(program: impl Into<String>, runner: R) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }

    async fn invoke(
        &self,
        operation: &str,
        adb_name: &str,
        parts: &[&str],
    ) -> Result<CommandOutput, DeviceControlError> {
        let mut args = vec![OsString::from("-s"), OsString::from(adb_name)];
        args.extend(parts.iter().map(OsString::from));
        debug!(program = %self.program, %adb_name, %operation, "invoking device control");
        let output = self.runner.run(&self.program, &args).await?;
        if !output.is_success() {
            let stderr = output.stderr.trim();
            return Err(DeviceControlError::CommandFailure {
                operation: operation.to_owned(),
                adb_name: adb_name.to_owned(),
                status_text: output.status_text(),
                diagnostic: if stderr.is_empty() {
                    output.stdout.trim().to_owned()
                } else {
                    stderr.to_owned()
                },
            });
        }
        Ok(output)
    }
}

impl<R> DeviceControl for AdbDeviceControl<R>
where
    R: CommandRunner + Send + Sync,
{
    fn api_level<'a>(&'a self, adb_name: &'a str) -> ControlFuture<'a, u32> {
        Box::pin(async move {
            let output = self
                .invoke(
                    "getprop",
                    adb_name,
                    &["shell", "getprop", "ro.build.version.sdk"],
                )
                .await?;
            let raw = output.stdout.trim();
            raw.parse::<u32>()
                .map_err(|_| DeviceControlError::InvalidApiLevel {
                    adb_name: adb_name.to_owned(),
                    raw: raw.to_owned(),
                })
        })
    }

    fn disable_animations<'a>(&'a self, adb_name: &'a str) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            for setting in ANIMATION_SETTINGS {
                self.invoke(
                    "settings put",
                    adb_name,
                    &["shell", "settings", "put", "global", setting, "0"],
                )
                .await?;
            }
            Ok(())
        })
    }

    fn install<'a>(
        &'a self,
        adb_name: &'a str,
        app: &'a Utf8Path,
        test_app: &'a Utf8Path,
    ) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            for package in [app, test_app] {
                self.invoke(
                    "install",
                    adb_name,
                    &["install", "-r", "-g", package.as_str()],
                )
                .await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    fn control(runner: &ScriptedRunner) -> AdbDeviceControl<ScriptedRunner> {
        AdbDeviceControl::new("adb", runner.clone())
    }

    #[rstest]
    #[case("34\n", Ok(34))]
    #[case("  29  ", Ok(29))]
    #[case("", Err(()))]
    #[case("S", Err(()))]
    #[tokio::test]
    async fn api_level_is_read_from_build_properties(
        #[case] stdout: &str,
        #[case] expected: Result<u32, ()>,
    ) {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), stdout, "");

        let level = control(&runner).api_level("127.0.0.1:5555").await;

        assert_eq!(level.map_err(|_| ()), expected);
        assert_eq!(
            runner.commands(),
            vec!["adb -s 127.0.0.1:5555 shell getprop ro.build.version.sdk"]
        );
    }

    #[tokio::test]
    async fn animations_are_disabled_one_setting_at_a_time() {
        let runner = ScriptedRunner::new();
        for _ in ANIMATION_SETTINGS {
            runner.push_success();
        }

        control(&runner)
            .disable_animations("emu:1")
            .await
            .expect("disable");

        let commands = runner.commands();
        assert_eq!(commands.len(), 3);
        assert!(
            commands
                .iter()
                .all(|command| command.starts_with("adb -s emu:1 shell settings put global"))
        );
        assert!(commands.iter().all(|command| command.ends_with(" 0")));
    }

    #[tokio::test]
    async fn install_stops_at_the_first_failure() {
        let runner = ScriptedRunner::new();
        runner.push_failure(1, "INSTALL_FAILED_INSUFFICIENT_STORAGE");

        let err = control(&runner)
            .install(
                "emu:1",
                Utf8Path::new("/tmp/app.apk"),
                Utf8Path::new("/tmp/app-test.apk"),
            )
            .await
            .expect_err("install");

        assert_eq!(
            err,
            DeviceControlError::CommandFailure {
                operation: String::from("install"),
                adb_name: String::from("emu:1"),
                status_text: String::from("1"),
                diagnostic: String::from("INSTALL_FAILED_INSUFFICIENT_STORAGE"),
            }
        );
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn install_pushes_both_packages() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_success();

        control(&runner)
            .install(
                "emu:1",
                Utf8Path::new("/tmp/app.apk"),
                Utf8Path::new("/tmp/app-test.apk"),
            )
            .await
            .expect("install");

        assert_eq!(
            runner.commands(),
            vec![
                "adb -s emu:1 install -r -g /tmp/app.apk",
                "adb -s emu:1 install -r -g /tmp/app-test.apk",
            ]
        );
    }
}
