//! Supervised service process
//!
//! A [`Service`] owns one external process for its whole life:
//! `Starting -> Running -> Exited`. The exit code is published exactly
//! once through a watch channel, so any number of waiters (including ones
//! that arrive late) observe the same value.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{HarnessConfig, ServiceConfig},
    error::{HarnessError, Result},
    output::{forward, LinePrefixer, SharedSink},
    readiness::ReadinessProbe,
};

/// Exit code recorded for a process killed by a signal
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Requests handled by the reaper, which is the only owner of the child.
#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Kill,
}

/// Written once by `start`, read-only afterwards.
struct Handle {
    pid: u32,
    control: mpsc::UnboundedSender<Control>,
}

#[derive(Default)]
struct Tasks {
    /// Reaper and cancellation watcher
    lifecycle: Vec<JoinHandle<()>>,
    /// Output forwarders
    output: Vec<JoinHandle<()>>,
}

/// One supervised external process
pub struct Service {
    config: ServiceConfig,
    sink: SharedSink,
    probe_interval: Duration,
    drain_timeout: Duration,
    handle: Mutex<Option<Handle>>,
    tasks: Mutex<Tasks>,
    exit: Arc<watch::Sender<Option<i32>>>,
}

impl Service {
    /// Create a service that has not been started yet
    pub fn new(config: ServiceConfig) -> Self {
        let defaults = HarnessConfig::default();
        let (exit, _) = watch::channel(None);
        Self {
            config,
            sink: SharedSink::stderr(),
            probe_interval: defaults.probe_interval_duration(),
            drain_timeout: defaults.output_drain_timeout(),
            handle: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            exit: Arc::new(exit),
        }
    }

    /// Send labelled output to `sink` instead of stderr
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Take probe and drain timing from harness settings
    pub fn with_settings(mut self, settings: &HarnessConfig) -> Self {
        self.probe_interval = settings.probe_interval_duration();
        self.drain_timeout = settings.output_drain_timeout();
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Prefix on every forwarded output line
    pub fn label(&self) -> String {
        self.config.output_label()
    }

    /// Process ID, once started
    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().map(|h| h.pid)
    }

    /// Spawn the process and, if a port is configured, wait for it to
    /// accept connections.
    ///
    /// Cancelling `cancel` at any point force-kills the process. A failed
    /// readiness probe kills the process before the error is returned.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        self.spawn(cancel)?;

        if let Some(port) = self.config.port {
            let probe = ReadinessProbe::new(port, self.probe_interval);
            let exit = self.exit.subscribe();
            if let Err(e) = probe.wait_ready(cancel, &exit).await {
                warn!(
                    program = %self.config.program.display(),
                    port,
                    error = %e,
                    "Service never became ready, killing it"
                );
                self.kill().await;
                return Err(e);
            }
        }
        Ok(())
    }

    fn spawn(&self, cancel: &CancellationToken) -> Result<()> {
        let mut handle = self.handle.lock();
        if let Some(ref running) = *handle {
            return Err(match self.state() {
                Some(code) => HarnessError::AlreadyExited { code },
                None => HarnessError::AlreadyRunning { pid: running.pid },
            });
        }

        debug!(
            program = %self.config.program.display(),
            args = ?self.config.args,
            "Spawning service"
        );

        let spawn_failed = |source| HarnessError::Spawn {
            program: self.config.program.clone(),
            source,
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        let combined = combined_output(&mut cmd).map_err(spawn_failed)?;
        #[cfg(not(unix))]
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        #[cfg_attr(unix, allow(unused_mut))]
        let mut child = cmd.spawn().map_err(spawn_failed)?;
        // Release our copies of the write end so EOF arrives with the child's exit.
        drop(cmd);
        let pid = child.id().unwrap_or(0);

        info!(
            pid,
            program = %self.config.program.display(),
            port = ?self.config.port,
            "Service spawned"
        );

        let label = self.label();
        let mut output = Vec::with_capacity(2);
        #[cfg(unix)]
        {
            let out = LinePrefixer::new(label, self.sink.clone());
            output.push(tokio::spawn(forward(combined, out)));
        }
        #[cfg(not(unix))]
        {
            if let Some(stdout) = child.stdout.take() {
                let out = LinePrefixer::new(label.clone(), self.sink.clone());
                output.push(tokio::spawn(forward(stdout, out)));
            }
            if let Some(stderr) = child.stderr.take() {
                let out = LinePrefixer::new(label, self.sink.clone());
                output.push(tokio::spawn(forward(stderr, out)));
            }
        }

        let (control, control_rx) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(reap(child, pid, control_rx, Arc::clone(&self.exit)));
        let watcher = tokio::spawn(watch_cancellation(
            pid,
            cancel.clone(),
            control.clone(),
            self.exit.subscribe(),
        ));

        *handle = Some(Handle { pid, control });
        let mut tasks = self.tasks.lock();
        tasks.lifecycle.extend([reaper, watcher]);
        tasks.output.extend(output);
        Ok(())
    }

    /// Snapshot of the exit-state cell: `None` while running or unstarted
    pub fn state(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some() && self.state().is_none()
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// Waiting on a service that was never started blocks until it is
    /// started and exits.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit.subscribe();
        match next_exit(&mut rx).await {
            Some(code) => code,
            // `self` owns the sender, so the channel cannot close here.
            None => unreachable!("exit-state channel closed while service alive"),
        }
    }

    /// Ask the process to terminate (SIGTERM) and wait for it to exit.
    ///
    /// Identical to [`wait`](Self::wait) if the process already exited.
    pub async fn stop(&self) -> i32 {
        if self.state().is_none() {
            self.send(Control::Terminate);
        }
        let code = self.wait().await;
        self.join_tasks().await;
        code
    }

    /// Force-kill the process and wait until its exit is recorded.
    ///
    /// No-op if the process already exited or was never started.
    pub async fn kill(&self) {
        if self.state().is_some() {
            return;
        }
        if !self.send(Control::Kill) {
            return;
        }
        self.wait().await;
        self.join_tasks().await;
    }

    /// Returns false if the service was never started.
    fn send(&self, request: Control) -> bool {
        match *self.handle.lock() {
            Some(ref running) => {
                debug!(pid = running.pid, ?request, "Signalling service");
                // The reaper may already be gone; that is fine.
                let _ = running.control.send(request);
                true
            }
            None => false,
        }
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());

        for task in tasks.lifecycle {
            if let Err(e) = task.await {
                warn!(error = %e, "Service watcher task failed");
            }
        }

        // A grandchild that inherited the pipes can keep them open forever.
        for task in tasks.output {
            let abort = task.abort_handle();
            match tokio::time::timeout(self.drain_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Output forwarder ended abnormally"),
                Err(_) => {
                    debug!(
                        program = %self.config.program.display(),
                        "Output still open after exit, detaching"
                    );
                    abort.abort();
                }
            }
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("program", &self.config.program)
            .field("args", &self.config.args)
            .field("port", &self.config.port)
            .field("pid", &self.pid())
            .field("exit", &self.state())
            .finish()
    }
}

async fn next_exit(rx: &mut watch::Receiver<Option<i32>>) -> Option<i32> {
    rx.wait_for(Option::is_some).await.ok().and_then(|state| *state)
}

/// Owns the child until it exits, then publishes the exit code.
async fn reap(
    mut child: Child,
    pid: u32,
    mut control: mpsc::UnboundedReceiver<Control>,
    exit: Arc<watch::Sender<Option<i32>>>,
) {
    let waited = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = control.recv() => match request {
                Control::Kill => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid, error = %e, "Kill failed");
                    }
                }
                Control::Terminate => terminate(&mut child, pid),
            },
        }
    };

    let status = match waited {
        Ok(status) => status,
        Err(e) => {
            // The OS no longer lets us wait on our own child; nothing the
            // harness reports afterwards could be trusted.
            error!(pid, error = %e, "Lost track of service process");
            std::process::abort();
        }
    };

    let code = exit_code(&status);
    info!(pid, exit_code = code, %status, "Service exited");
    exit.send_if_modified(|state| {
        if state.is_none() {
            *state = Some(code);
            true
        } else {
            false
        }
    });
}

/// Force-kills the process when `cancel` fires before it exits.
async fn watch_cancellation(
    pid: u32,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    mut exit: watch::Receiver<Option<i32>>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(pid, "Cancelled, killing service");
            let _ = control.send(Control::Kill);
        }
        _ = next_exit(&mut exit) => {}
    }
}

/// Point the child's stdout and stderr at one pipe, so the two streams
/// reach the forwarder in the order the child wrote them.
#[cfg(unix)]
fn combined_output(cmd: &mut Command) -> std::io::Result<tokio::net::unix::pipe::Receiver> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::AsRawFd;

    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        // Other children spawned concurrently must not inherit either end.
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    cmd.stdout(Stdio::from(write.try_clone()?))
        .stderr(Stdio::from(write));
    tokio::net::unix::pipe::Receiver::from_owned_fd(read)
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: u32) {
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "Kill failed");
    }
}

/// Exit code, or [`SIGNALED_EXIT_CODE`] if the process died from a signal
pub fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_CODE)
}
