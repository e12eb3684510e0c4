//! Harness - installs artifacts, runs services, tears everything down

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::{
    config::{HarnessConfig, ServiceConfig},
    error::{HarnessError, Result},
    install::{CommandInstaller, InstallCache, Installer},
    output::SharedSink,
    registry::ServiceRegistry,
    service::Service,
};

/// Owns everything a test process needs to run external services.
///
/// Construct one per test binary and share it (e.g. in a `OnceLock` or an
/// `Arc`); call [`kill_all`](Self::kill_all) at teardown.
pub struct Harness {
    config: HarnessConfig,
    installer: Arc<dyn Installer>,
    cache: InstallCache,
    registry: ServiceRegistry,
    sink: SharedSink,
    shutdown: CancellationToken,
    starting: TaskTracker,
}

impl Harness {
    /// Create a harness using the configured install command
    pub fn new(config: HarnessConfig) -> Self {
        let installer = Arc::new(CommandInstaller::from_config(&config));
        Self::with_installer(config, installer)
    }

    /// Create a harness with a custom installer
    pub fn with_installer(config: HarnessConfig, installer: Arc<dyn Installer>) -> Self {
        Self {
            config,
            installer,
            cache: InstallCache::new(),
            registry: ServiceRegistry::new(),
            sink: SharedSink::stderr(),
            shutdown: CancellationToken::new(),
            starting: TaskTracker::new(),
        }
    }

    /// Send service output to `sink` instead of stderr
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Install `artifact` once per harness
    pub async fn install(&self, artifact: &str) -> Result<()> {
        let installer = Arc::clone(&self.installer);
        let owned = artifact.to_string();
        self.cache
            .ensure_installed(artifact, move || async move { installer.install(&owned).await })
            .await
    }

    /// Install `artifact`, start it with `flags`, and wait for `port`.
    ///
    /// # Examples
    /// ```no_run
    /// use svc_harness::{Harness, HarnessConfig};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let harness = Harness::new(HarnessConfig::from_env()?);
    /// let cancel = CancellationToken::new();
    /// let server = harness
    ///     .run_service(&cancel, "echo-server", &["--port", "9001"], Some(9001))
    ///     .await?;
    /// assert_eq!(server.state(), None);
    /// harness.kill_all().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_service<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        artifact: &str,
        flags: &[S],
        port: Option<u16>,
    ) -> Result<Arc<Service>> {
        self.install(artifact).await?;

        let mut config = ServiceConfig::new(self.config.program_for(artifact))
            .args(flags.iter().map(|f| f.as_ref().to_string()));
        config.port = port;
        self.run(cancel, config).await
    }

    /// Start an already-installed program and register it.
    pub async fn run(&self, cancel: &CancellationToken, config: ServiceConfig) -> Result<Arc<Service>> {
        if self.shutdown.is_cancelled() {
            return Err(HarnessError::ShutDown);
        }

        // Cancelled by the caller only; teardown reaches it just while starting.
        let token = cancel.child_token();
        let service = Arc::new(
            Service::new(config)
                .with_sink(self.sink.clone())
                .with_settings(&self.config),
        );

        self.starting
            .track_future(async {
                self.start_unless_shut_down(&service, &token).await?;
                self.registry.register(Arc::clone(&service)).await;
                Ok::<_, HarnessError>(())
            })
            .await?;

        debug!(pid = ?service.pid(), "Service running");
        Ok(service)
    }

    /// Start `service`, cancelling `token` if the harness is torn down
    /// before the start completes.
    async fn start_unless_shut_down(
        &self,
        service: &Service,
        token: &CancellationToken,
    ) -> Result<()> {
        let start = service.start(token);
        tokio::pin!(start);
        tokio::select! {
            result = &mut start => result,
            _ = self.shutdown.cancelled() => {
                debug!("Harness shutting down, cancelling start");
                token.cancel();
                start.await
            }
        }
    }

    /// Number of services started through this harness
    pub async fn registered(&self) -> usize {
        self.registry.len().await
    }

    /// Kill every service, newest first.
    ///
    /// Services still starting are cancelled and waited for, so no
    /// process started before this call outlives it. Registered services
    /// are only killed by the registry walk. The harness refuses new
    /// services afterwards.
    pub async fn kill_all(&self) {
        info!("Tearing down harness");
        self.shutdown.cancel();
        self.starting.close();
        self.starting.wait().await;
        self.registry.kill_all().await;
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(HarnessConfig::default())
    }
}
