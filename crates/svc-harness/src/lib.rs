//! # svc-harness
//!
//! **Purpose**: Run external service binaries from tests and make sure
//! they are gone when the tests are.
//!
//! ## Features
//!
//! - **One-time Install**: Each artifact is built once per harness, even
//!   under concurrent requests
//! - **Readiness**: `start` returns only once the service's TCP port
//!   accepts connections
//! - **Exit Tracking**: Exit code is recorded exactly once and visible to
//!   every waiter
//! - **Cancellation**: Cancelling the start token force-kills the process
//! - **Teardown**: `kill_all` kills every service, newest first
//! - **Labelled Output**: Service output is forwarded line by line with a
//!   per-service prefix
//! - **Fault Injection**: iptables helpers to block a service's port
//!
//! ## Usage
//!
//! ```rust,no_run
//! use svc_harness::{Harness, HarnessConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let harness = Harness::new(HarnessConfig::from_env()?);
//! let cancel = CancellationToken::new();
//!
//! let db = harness
//!     .run_service(&cancel, "echo-server", &["--port", "9001"], Some(9001))
//!     .await?;
//! assert!(db.is_running());
//!
//! // Suite teardown
//! harness.kill_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod firewall;
pub mod harness;
pub mod install;
pub mod output;
pub mod readiness;
pub mod registry;
pub mod service;

pub use config::{HarnessConfig, ServiceConfig};
pub use error::{HarnessError, InstallFailure, Result};
pub use firewall::FirewallRules;
pub use harness::Harness;
pub use install::{CommandInstaller, InstallCache, Installer};
pub use output::{LinePrefixer, SharedSink};
pub use readiness::ReadinessProbe;
pub use registry::ServiceRegistry;
pub use service::Service;

/// Route `tracing` output through the test harness's captured writer.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}
