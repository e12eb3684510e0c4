//! Error types for service supervision

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by an [`Installer`](crate::Installer).
///
/// Cloneable so every concurrent caller waiting on the same artifact
/// receives the identical failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFailure {
    /// Artifact identifier that failed to install
    pub artifact: String,
    /// Installer exit code (None when it never ran or died by signal)
    pub status: Option<i32>,
    /// Combined installer output, verbatim
    pub output: String,
}

impl fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "installing {} exited with {}", self.artifact, code)?,
            None => write!(f, "installing {} failed", self.artifact)?,
        }
        if !self.output.is_empty() {
            write!(f, ":\n{}", self.output)?;
        }
        Ok(())
    }
}

/// Service harness errors
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Artifact build/install failed
    #[error("{0}")]
    Install(InstallFailure),

    /// OS refused to start the process
    #[error("Failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Start called on a service whose process is still running
    #[error("Process is still running (PID: {pid})")]
    AlreadyRunning { pid: u32 },

    /// Start called on a service that already ran to completion
    #[error("Process already exited with code {code}")]
    AlreadyExited { code: i32 },

    /// Readiness port never became reachable
    #[error("Port {port} never became ready: {source}")]
    NotReady {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Firewall command failed
    #[error("`{command}` failed (status {status:?}): {output}")]
    Firewall {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// The harness was torn down by `kill_all`
    #[error("Harness has been shut down")]
    ShutDown,

    /// Invalid configuration
    #[error("Invalid harness configuration: {0}")]
    Config(String),
}

impl From<InstallFailure> for HarnessError {
    fn from(failure: InstallFailure) -> Self {
        HarnessError::Install(failure)
    }
}

impl From<config::ConfigError> for HarnessError {
    fn from(err: config::ConfigError) -> Self {
        HarnessError::Config(err.to_string())
    }
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_failure_display_includes_output() {
        let failure = InstallFailure {
            artifact: "echo-server".to_string(),
            status: Some(101),
            output: "error[E0425]: cannot find value".to_string(),
        };
        let msg = HarnessError::from(failure).to_string();
        assert!(msg.contains("echo-server exited with 101"));
        assert!(msg.ends_with("error[E0425]: cannot find value"));
    }

    #[test]
    fn test_not_ready_keeps_dial_error() {
        let err = HarnessError::NotReady {
            port: 9001,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().to_lowercase().contains("refused"));
    }
}
