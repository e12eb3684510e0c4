//! HarnessConfig loading from files and environment

use std::io::Write;
use std::path::PathBuf;

use serial_test::serial;
use svc_harness::{HarnessConfig, HarnessError};

fn clear_env() {
    for key in [
        "HARNESS_BIN_DIR",
        "HARNESS_INSTALL_COMMAND",
        "HARNESS_PROBE_INTERVAL_MS",
        "HARNESS_OUTPUT_DRAIN_TIMEOUT_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_defaults_without_sources() {
    clear_env();
    let config = HarnessConfig::from_env().unwrap();
    assert_eq!(config, HarnessConfig::default());
}

#[test]
#[serial]
fn test_file_values() {
    clear_env();
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
bin_dir = "/opt/services/bin"
install_command = ["make", "install-{{artifact}}"]
probe_interval_ms = 25
"#
    )
    .unwrap();

    let config = HarnessConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.bin_dir, PathBuf::from("/opt/services/bin"));
    assert_eq!(config.install_command, vec!["make", "install-{artifact}"]);
    assert_eq!(config.probe_interval_ms, 25);
    assert_eq!(config.output_drain_timeout_ms, 1000);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    clear_env();
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "bin_dir = \"/from/file\"").unwrap();

    std::env::set_var("HARNESS_BIN_DIR", "/from/env");
    std::env::set_var("HARNESS_INSTALL_COMMAND", "go install {artifact}");
    let config = HarnessConfig::load(Some(file.path()));
    clear_env();

    let config = config.unwrap();
    assert_eq!(config.bin_dir, PathBuf::from("/from/env"));
    assert_eq!(config.install_command, vec!["go", "install", "{artifact}"]);
}

#[test]
#[serial]
fn test_missing_file_is_ignored() {
    clear_env();
    let config = HarnessConfig::load(Some(std::path::Path::new("/nonexistent/harness.toml"))).unwrap();
    assert_eq!(config, HarnessConfig::default());
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    clear_env();
    std::env::set_var("HARNESS_OUTPUT_DRAIN_TIMEOUT_MS", "0");
    let result = HarnessConfig::from_env();
    clear_env();

    assert!(matches!(result, Err(HarnessError::Config(_))));
}
