//! Tests for configuration loading and validation.

use camino::Utf8PathBuf;
use emulease::config::{ConfigError, EmuleaseConfig};
use emulease::test_support::{EnvGuard, ScriptedRunner};
use rstest::*;
use tempfile::TempDir;

#[fixture]
fn valid_config() -> EmuleaseConfig {
    EmuleaseConfig {
        provider_bin: String::from("gmsaas"),
        registry_dir: Some(String::from("/var/tmp/emulease-ci")),
        instance_name_prefix: String::from("emulease"),
        min_provider_version: String::from("1.6.0"),
        console_url: String::from("https://cloud.geny.io/instances"),
    }
}

#[rstest]
fn valid_config_passes_validation(valid_config: EmuleaseConfig) {
    valid_config
        .validate()
        .unwrap_or_else(|err| panic!("valid config: {err}"));
}

/// Every required field names its environment variable and TOML key.
#[rstest]
#[case::provider_bin(
    |cfg: &mut EmuleaseConfig| cfg.provider_bin.clear(),
    "EMULEASE_PROVIDER_BIN",
    "provider_bin"
)]
#[case::name_prefix(
    |cfg: &mut EmuleaseConfig| cfg.instance_name_prefix = String::from("  "),
    "EMULEASE_INSTANCE_NAME_PREFIX",
    "instance_name_prefix"
)]
#[case::min_version(
    |cfg: &mut EmuleaseConfig| cfg.min_provider_version.clear(),
    "EMULEASE_MIN_PROVIDER_VERSION",
    "min_provider_version"
)]
#[case::console_url(
    |cfg: &mut EmuleaseConfig| cfg.console_url.clear(),
    "EMULEASE_CONSOLE_URL",
    "console_url"
)]
fn missing_fields_produce_actionable_errors(
    mut valid_config: EmuleaseConfig,
    #[case] mutate: fn(&mut EmuleaseConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    mutate(&mut valid_config);

    let error = valid_config.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "error should mention {env_var}: {message}");
    assert!(message.contains(toml_key), "error should mention {toml_key}: {message}");
    assert!(message.contains("emulease.toml"), "error should mention the file: {message}");
}

#[rstest]
fn malformed_version_floor_is_rejected(mut valid_config: EmuleaseConfig) {
    valid_config.min_provider_version = String::from("one.six");

    let error = valid_config.validate().expect_err("bad version");

    assert!(matches!(error, ConfigError::InvalidVersion { .. }), "got {error:?}");
}

#[rstest]
fn version_floor_accepts_a_leading_v(mut valid_config: EmuleaseConfig) {
    valid_config.min_provider_version = String::from("v1.7.2");

    let version = valid_config.min_version().expect("version");

    assert_eq!(version.to_string(), "1.7.2");
}

#[rstest]
#[case(Some("/srv/emulease"), Some("/srv/emulease"))]
#[case(Some("   "), None)]
#[case(None, None)]
fn registry_dir_falls_back_to_the_temp_dir(
    mut valid_config: EmuleaseConfig,
    #[case] configured: Option<&str>,
    #[case] expected: Option<&str>,
) {
    valid_config.registry_dir = configured.map(str::to_owned);

    let dir = valid_config.registry_dir().expect("registry dir");

    match expected {
        Some(path) => assert_eq!(dir, Utf8PathBuf::from(path)),
        None => assert!(dir.ends_with("emulease"), "unexpected fallback {dir}"),
    }
}

#[rstest]
fn provider_and_remediation_follow_the_configured_binary(mut valid_config: EmuleaseConfig) {
    valid_config.provider_bin = String::from("/opt/gmsaas/bin/gmsaas");
    valid_config.console_url = String::from("https://console.example");

    let provider = valid_config
        .provider(ScriptedRunner::new())
        .expect("provider");
    let remediation = valid_config.remediation();

    assert_eq!(provider.program(), "/opt/gmsaas/bin/gmsaas");
    assert_eq!(
        remediation.command_for("a1"),
        "/opt/gmsaas/bin/gmsaas instances stop a1"
    );
    assert_eq!(remediation.console_url, "https://console.example");
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let registry = tmp.path().join("ledgers").to_string_lossy().into_owned();
    let _guard = EnvGuard::set_vars(&[
        ("EMULEASE_PROVIDER_BIN", "/usr/local/bin/gmsaas"),
        ("EMULEASE_REGISTRY_DIR", registry.as_str()),
    ])
    .await;

    let config = EmuleaseConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("load config: {err}"));

    assert_eq!(config.provider_bin, "/usr/local/bin/gmsaas");
    assert_eq!(config.registry_dir.as_deref(), Some(registry.as_str()));
    assert_eq!(config.instance_name_prefix, "emulease");
    assert_eq!(config.min_provider_version, "1.6.0");
}

#[tokio::test]
async fn configuration_file_is_discovered() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = tmp.path().join("emulease.toml");
    std::fs::write(
        &path,
        "instance_name_prefix = \"nightly\"\nconsole_url = \"https://console.example\"\n",
    )
    .unwrap_or_else(|err| panic!("write config: {err}"));
    let path_text = path.to_string_lossy().into_owned();
    let _guard = EnvGuard::set_vars(&[("EMULEASE_CONFIG_PATH", path_text.as_str())]).await;

    let config = EmuleaseConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("load config: {err}"));

    assert_eq!(config.instance_name_prefix, "nightly");
    assert_eq!(config.console_url, "https://console.example");
    assert_eq!(config.provider_bin, "gmsaas");
}
