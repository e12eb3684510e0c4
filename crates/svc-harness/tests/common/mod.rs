//! Shared helpers for svc-harness integration tests

#![allow(dead_code)]

use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use svc_harness::{Harness, HarnessConfig, InstallFailure, Installer, SharedSink};

pub const ECHO_SERVER: &str = "echo-server";

/// Directory cargo built the test binaries into
pub fn bin_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_echo-server"))
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default()
}

/// A port nothing is listening on (at the time of the call)
pub fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// In-memory sink for service output
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Installer that only counts calls; cargo already built the binaries.
#[derive(Default)]
pub struct PrebuiltInstaller {
    pub calls: AtomicUsize,
}

impl PrebuiltInstaller {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Installer for PrebuiltInstaller {
    async fn install(&self, _artifact: &str) -> Result<(), InstallFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn harness() -> (Harness, Arc<PrebuiltInstaller>, Capture) {
    svc_harness::init_test_logging();
    let installer = Arc::new(PrebuiltInstaller::default());
    let capture = Capture::default();
    let harness = Harness::with_installer(HarnessConfig::default().bin_dir(bin_dir()), installer.clone())
        .with_sink(SharedSink::new(capture.clone()));
    (harness, installer, capture)
}
