//! TCP readiness probing

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Polls a loopback port until something accepts a connection.
///
/// Gives up when the cancellation token fires or the supervised process
/// has exited, returning the last dial error.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    port: u16,
    interval: Duration,
}

impl ReadinessProbe {
    pub fn new(port: u16, interval: Duration) -> Self {
        Self { port, interval }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Loopback address being probed
    pub fn address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Wait until the port accepts a connection.
    ///
    /// `exit` is the owning service's exit-state cell; once it holds a
    /// code there is no point dialing again.
    pub async fn wait_ready(
        &self,
        cancel: &CancellationToken,
        exit: &watch::Receiver<Option<i32>>,
    ) -> Result<()> {
        let address = self.address();
        let mut last_error: Option<io::Error> = None;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = TcpStream::connect(address) => Some(res),
            };

            match dialed {
                Some(Ok(stream)) => {
                    drop(stream);
                    debug!(port = self.port, attempts, "Port is accepting connections");
                    return Ok(());
                }
                Some(Err(e)) => last_error = Some(e),
                None => {}
            }

            if cancel.is_cancelled() || exit.borrow().is_some() {
                let source = last_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::TimedOut, "readiness probe cancelled")
                });
                debug!(
                    port = self.port,
                    attempts,
                    cancelled = cancel.is_cancelled(),
                    error = %source,
                    "Giving up on readiness"
                );
                return Err(HarnessError::NotReady {
                    port: self.port,
                    source,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(self.interval) => {}
            }
        }
    }
}
