//! Label-prefixed, line-buffered forwarding of service output

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Cloneable handle to the writer all service output ends up in.
///
/// Every `write_all` happens under one lock, so prefixed lines from
/// different services (or stdout/stderr of one service) never interleave
/// mid-line.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink writing to the harness process's stderr
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl Default for SharedSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl std::fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSink").finish_non_exhaustive()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// Writer that prepends a fixed label to every line.
///
/// Input may arrive in arbitrary chunks. Complete lines go to the sink
/// immediately; a trailing partial line is held until a later write
/// completes it or [`finish`](Self::finish) is called. `write` always
/// reports the whole input as consumed, even when the sink fails: output
/// is dropped (with one warning) so the child's pipe keeps draining.
pub struct LinePrefixer<W: Write> {
    prefix: Vec<u8>,
    partial: Vec<u8>,
    sink: W,
    sink_failed: bool,
}

impl<W: Write> LinePrefixer<W> {
    pub fn new(prefix: impl Into<String>, sink: W) -> Self {
        Self {
            prefix: prefix.into().into_bytes(),
            partial: Vec::new(),
            sink,
            sink_failed: false,
        }
    }

    /// Bytes of an unterminated line waiting for its newline
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }

    /// Emit any held partial line, terminated with a newline.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.partial.is_empty() {
            return self.sink.flush();
        }
        let mut line = Vec::with_capacity(self.prefix.len() + self.partial.len() + 1);
        line.extend_from_slice(&self.prefix);
        line.append(&mut self.partial);
        line.push(b'\n');
        self.sink.write_all(&line)?;
        self.sink.flush()
    }

    fn emit_line(&mut self, tail: &[u8]) -> io::Result<()> {
        let mut line =
            Vec::with_capacity(self.prefix.len() + self.partial.len() + tail.len());
        line.extend_from_slice(&self.prefix);
        line.append(&mut self.partial);
        line.extend_from_slice(tail);
        self.sink.write_all(&line)
    }
}

impl<W: Write> Write for LinePrefixer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos + 1);
            if let Err(e) = self.emit_line(line) {
                if !self.sink_failed {
                    warn!(error = %e, "Output sink failed, dropping service output");
                    self.sink_failed = true;
                }
            }
            rest = tail;
        }
        self.partial.extend_from_slice(rest);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W: Write> Drop for LinePrefixer<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Copy a child's output stream into a prefixer until EOF.
///
/// Reading continues past sink failures so the child never sees a closed
/// pipe.
pub(crate) async fn forward<R>(mut reader: R, mut out: LinePrefixer<SharedSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = out.write_all(&buf[..n]) {
                    debug!(error = %e, "Dropped service output");
                }
            }
            Err(e) => {
                debug!(error = %e, "Service output stream closed");
                break;
            }
        }
    }
    if let Err(e) = out.finish() {
        warn!(error = %e, "Failed to flush service output");
    }
}
