//! One-time artifact installation

use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    config::{HarnessConfig, ARTIFACT_PLACEHOLDER},
    error::{InstallFailure, Result},
};

/// Builds or installs a runnable artifact
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, artifact: &str) -> std::result::Result<(), InstallFailure>;
}

/// Runs an external command, capturing its combined output.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    argv: Vec<String>,
}

impl CommandInstaller {
    /// `argv` may contain `{artifact}`, replaced on each install.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.install_command.iter().cloned())
    }

    /// Concrete argv for one artifact
    pub fn command_for(&self, artifact: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace(ARTIFACT_PLACEHOLDER, artifact))
            .collect()
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, artifact: &str) -> std::result::Result<(), InstallFailure> {
        let argv = self.command_for(artifact);
        let failure = |status, output| InstallFailure {
            artifact: artifact.to_string(),
            status,
            output,
        };

        let Some((program, args)) = argv.split_first() else {
            return Err(failure(None, "install command is empty".to_string()));
        };

        info!(artifact, command = %argv.join(" "), "Installing artifact");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| failure(None, format!("{}: {}", program, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        warn!(artifact, status = %output.status, "Install failed");
        Err(failure(output.status.code(), combined))
    }
}

type InstallFuture = Shared<BoxFuture<'static, std::result::Result<(), InstallFailure>>>;

enum Entry {
    Installed,
    InFlight { generation: u64, future: InstallFuture },
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Remembers which artifacts were already installed.
///
/// Concurrent requests for one artifact share a single in-flight build and
/// all see its result. Different artifacts build independently. A failed
/// build is forgotten, so a later request tries again.
#[derive(Default)]
pub struct InstallCache {
    state: Mutex<CacheState>,
}

impl InstallCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `build` unless `artifact` is installed or already being built.
    pub async fn ensure_installed<F, Fut>(&self, artifact: &str, build: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), InstallFailure>> + Send + 'static,
    {
        let (generation, future) = {
            let mut state = self.state.lock();
            match state.entries.get(artifact) {
                Some(Entry::Installed) => {
                    debug!(artifact, "Artifact already installed");
                    return Ok(());
                }
                Some(Entry::InFlight { generation, future }) => {
                    debug!(artifact, "Joining in-flight install");
                    (*generation, future.clone())
                }
                None => {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    let future = build().boxed().shared();
                    state.entries.insert(
                        artifact.to_string(),
                        Entry::InFlight {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.lock();
        let current = matches!(
            state.entries.get(artifact),
            Some(Entry::InFlight { generation: g, .. }) if *g == generation
        );
        if current {
            if result.is_ok() {
                state.entries.insert(artifact.to_string(), Entry::Installed);
            } else {
                state.entries.remove(artifact);
            }
        }
        result.map_err(Into::into)
    }

    pub fn is_installed(&self, artifact: &str) -> bool {
        matches!(self.state.lock().entries.get(artifact), Some(Entry::Installed))
    }
}
