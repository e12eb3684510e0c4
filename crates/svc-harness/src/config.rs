//! Harness and per-service configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{HarnessError, Result};

/// Environment prefix for harness settings (`HARNESS_BIN_DIR`, ...)
pub const ENV_PREFIX: &str = "HARNESS";

/// Placeholder replaced by the artifact identifier in `install_command`
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

/// Harness-wide settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding installed artifacts
    pub bin_dir: PathBuf,
    /// Installer argv template
    pub install_command: Vec<String>,
    /// Pause between readiness dial attempts
    pub probe_interval_ms: u64,
    /// Bound on draining output after the process exits
    pub output_drain_timeout_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("target/debug"),
            install_command: ["cargo", "build", "--quiet", "--bin", ARTIFACT_PLACEHOLDER]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_interval_ms: 10,
            output_drain_timeout_ms: 1000,
        }
    }
}

impl HarnessConfig {
    /// Load from environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from an optional TOML file, overridden by `HARNESS_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("install_command"),
        );

        let config: HarnessConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the harness cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.install_command.is_empty() {
            return Err(HarnessError::Config(
                "install_command must not be empty".to_string(),
            ));
        }
        if self.probe_interval_ms == 0 {
            return Err(HarnessError::Config(
                "probe_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.output_drain_timeout_ms == 0 {
            return Err(HarnessError::Config(
                "output_drain_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the artifact directory
    pub fn bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = dir.into();
        self
    }

    /// Set the readiness dial interval
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn probe_interval_duration(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }

    /// Path of the runnable binary for an artifact identifier.
    ///
    /// Only the last path segment of the identifier names the binary, so
    /// `tools/echo-server` resolves to `<bin_dir>/echo-server`.
    pub fn program_for(&self, artifact: &str) -> PathBuf {
        self.bin_dir.join(artifact_basename(artifact))
    }
}

/// Last `/`-separated segment of an artifact identifier
pub fn artifact_basename(artifact: &str) -> &str {
    artifact
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(artifact)
}

/// Configuration of one supervised service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Executable path
    pub program: PathBuf,
    /// Command arguments
    pub args: Vec<String>,
    /// Readiness port (None = ready as soon as spawned)
    pub port: Option<u16>,
    /// Environment variables (added to parent env)
    pub env: HashMap<String, String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Output label (None = derived from program and port)
    pub label: Option<String>,
}

impl ServiceConfig {
    /// Create new service configuration
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            port: None,
            env: HashMap::new(),
            working_dir: None,
            label: None,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set readiness port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Override the output label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Prefix written before every output line.
    ///
    /// Defaults to the program name followed by the port right-aligned to
    /// five columns, e.g. `echo-server 9001   `.
    pub fn output_label(&self) -> String {
        if let Some(ref label) = self.label {
            return label.clone();
        }
        let name = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        let port = self.port.map(|p| p.to_string()).unwrap_or_default();
        format!("{}{:>5}   ", name, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_label_pads_port() {
        let config = ServiceConfig::new("/opt/bin/echo-server").port(9001);
        assert_eq!(config.output_label(), "echo-server 9001   ");

        let config = ServiceConfig::new("sleep");
        assert_eq!(config.output_label(), "sleep        ");
    }

    #[test]
    fn test_explicit_label_wins() {
        let config = ServiceConfig::new("sleep").label("[db] ");
        assert_eq!(config.output_label(), "[db] ");
    }

    #[test]
    fn test_program_for_uses_basename() {
        let config = HarnessConfig::default().bin_dir("/tmp/bin");
        assert_eq!(
            config.program_for("github.com/acme/tools/echo-server"),
            PathBuf::from("/tmp/bin/echo-server")
        );
        assert_eq!(config.program_for("echo-server"), PathBuf::from("/tmp/bin/echo-server"));
    }

    #[test]
    fn test_validate_rejects_empty_install_command() {
        let mut config = HarnessConfig::default();
        config.install_command.clear();
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_drain_timeout() {
        let config = HarnessConfig {
            output_drain_timeout_ms: 0,
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_dial_interval() {
        let config = HarnessConfig::default().probe_interval(Duration::ZERO);
        match config.validate() {
            Err(HarnessError::Config(message)) => assert!(message.contains("probe_interval_ms")),
            other => panic!("Expected config error, got {other:?}"),
        }
    }
}
