//! Device log access, file capture, and marker bookkeeping.
//!
//! [`DeviceLog`] wraps log-related device commands. [`LogCapture`]
//! continuously drains a live log process into a local sink file while
//! letting callers record named start/end byte positions; positions are
//! captured with the producer truly paused (SIGSTOP) so no marker can land
//! inside an in-flight write. Marker offsets become available, line-justified,
//! once the session closes.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error};

pub mod demux;
mod justify;

use crate::device::process::{ProcessError, RemoteProcess, SCOPE_STOP_TIMEOUT};
use crate::device::{CommandRunner, Device, DeviceError};
use justify::{justify_end, justify_start};

/// How long the drain loop waits for further bytes before treating the pipe
/// as quiescent during a marker flush or final close.
const FLUSH_IDLE: Duration = Duration::from_millis(50);

const DRAIN_BUF_SIZE: usize = 8 * 1024;

/// Errors raised by log capture sessions.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Raised when the requested sink file already exists. Capture never
    /// overwrites a previous run's log.
    #[error("capture sink already exists: '{path}'")]
    SinkExists {
        /// The sink path that was refused.
        path: Utf8PathBuf,
    },
    /// Raised when marking or closing a session that has already stopped.
    #[error("log capture session is already closed")]
    Closed,
    /// Raised when reading the stream or writing the sink failed.
    #[error("log capture i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// Raised when the log-producing process could not be controlled.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Log-related operations on a device.
#[derive(Clone, Debug)]
pub struct DeviceLog<R: CommandRunner> {
    device: Device<R>,
}

impl<R: CommandRunner> DeviceLog<R> {
    /// Wraps log access around a device bridge.
    pub const fn new(device: Device<R>) -> Self {
        Self { device }
    }

    /// Clears all log buffers on the device.
    ///
    /// # Errors
    ///
    /// Propagates command execution failures.
    pub async fn clear(&self) -> Result<(), DeviceError> {
        self.device
            .execute_remote_cmd(&["logcat", "-b", "all", "-c"])
            .await?;
        Ok(())
    }

    /// Spawns a continuous log stream with the given extra logcat options.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Launch`] when the log command cannot start.
    pub fn logcat(&self, options: &[&str]) -> Result<RemoteProcess, ProcessError> {
        let mut args = vec!["logcat"];
        args.extend_from_slice(options);
        self.device.spawn_remote_cmd(&args)
    }

    /// Starts capturing the device log to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::SinkExists`] when `sink` already exists, or
    /// the launch/open failure otherwise.
    pub async fn capture_to_file(
        &self,
        sink: impl Into<Utf8PathBuf>,
    ) -> Result<LogCapture, CaptureError> {
        let process = self.logcat(&[])?;
        LogCapture::open(process, sink).await
    }
}

enum DrainRequest {
    Mark {
        key: String,
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    Close {
        reply: oneshot::Sender<Result<BTreeMap<String, u64>, CaptureError>>,
    },
}

/// A running log capture session.
///
/// The session owns the log-producing process and a background drain task
/// copying its output to the sink. Marker capture and close requests are
/// serviced one at a time by that task, so no two marker captures can
/// interleave and none can race a stream write.
pub struct LogCapture {
    requests: mpsc::Sender<DrainRequest>,
    drain: Option<JoinHandle<()>>,
    sink: Utf8PathBuf,
    closed: bool,
}

impl LogCapture {
    /// Begins draining `process` output into the file at `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::SinkExists`] when the sink file already
    /// exists, an i/o error when it cannot be created, or
    /// [`ProcessError::OutputUnavailable`] when the process output was
    /// already consumed elsewhere.
    pub async fn open(
        mut process: RemoteProcess,
        sink: impl Into<Utf8PathBuf>,
    ) -> Result<Self, CaptureError> {
        let sink = sink.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(sink.as_std_path())
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    CaptureError::SinkExists { path: sink.clone() }
                } else {
                    CaptureError::Io(err)
                }
            })?;
        let reader = process.take_stdout()?;
        let (requests, request_rx) = mpsc::channel(4);
        let drain = tokio::spawn(drain_stream(process, reader, file, request_rx));
        debug!(sink = %sink, "log capture session opened");
        Ok(Self {
            requests,
            drain: Some(drain),
            sink,
            closed: false,
        })
    }

    /// Returns the sink file path.
    #[must_use]
    pub fn sink_path(&self) -> &Utf8Path {
        &self.sink
    }

    /// Records the current write position under `name` as a start marker.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Closed`] on a stopped session, or the
    /// pause/flush failure otherwise.
    pub async fn mark_start(&self, name: &str) -> Result<(), CaptureError> {
        self.mark(format!("{name}.start")).await
    }

    /// Records the current write position under `name` as an end marker.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Closed`] on a stopped session, or the
    /// pause/flush failure otherwise.
    pub async fn mark_end(&self, name: &str) -> Result<(), CaptureError> {
        self.mark(format!("{name}.end")).await
    }

    async fn mark(&self, key: String) -> Result<(), CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }
        let (reply, ack) = oneshot::channel();
        self.requests
            .send(DrainRequest::Mark { key, reply })
            .await
            .map_err(|_| CaptureError::Closed)?;
        ack.await.map_err(|_| CaptureError::Closed)?
    }

    /// Stops the log producer, drains the remaining output, and closes the
    /// sink. The session cannot be used afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Closed`] when already closed, or the final
    /// drain failure otherwise.
    pub async fn close(&mut self) -> Result<CaptureResult, CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }
        self.closed = true;
        let (reply, ack) = oneshot::channel();
        self.requests
            .send(DrainRequest::Close { reply })
            .await
            .map_err(|_| CaptureError::Closed)?;
        let raw_markers = ack.await.map_err(|_| CaptureError::Closed)??;
        if let Some(handle) = self.drain.take() {
            if let Err(err) = handle.await {
                debug!(error = %err, "log capture drain task ended abnormally");
            }
        }
        debug!(sink = %self.sink, markers = raw_markers.len(), "log capture session closed");
        Ok(CaptureResult {
            sink: self.sink.clone(),
            raw_markers,
        })
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        // A session dropped without close (cancellation, panic) must not
        // leave the drain task or the log producer running.
        if let Some(handle) = self.drain.take() {
            handle.abort();
        }
    }
}

/// Markers and sink of a finished capture session.
#[derive(Clone, Debug)]
pub struct CaptureResult {
    sink: Utf8PathBuf,
    raw_markers: BTreeMap<String, u64>,
}

impl CaptureResult {
    /// Returns the sink file the session wrote to.
    #[must_use]
    pub fn sink_path(&self) -> &Utf8Path {
        &self.sink
    }

    /// Returns the marker offsets exactly as captured, without
    /// line justification.
    #[must_use]
    pub const fn raw_markers(&self) -> &BTreeMap<String, u64> {
        &self.raw_markers
    }

    /// Returns the line-justified marker table: start markers are pulled
    /// back to the preceding line boundary, end markers pushed forward to
    /// the following one.
    ///
    /// # Errors
    ///
    /// Returns an i/o error when the sink file cannot be read back.
    pub async fn markers(&self) -> Result<BTreeMap<String, u64>, CaptureError> {
        let bytes = tokio::fs::read(self.sink.as_std_path()).await?;
        Ok(self
            .raw_markers
            .iter()
            .map(|(key, &offset)| {
                let raw = usize::try_from(offset).unwrap_or(usize::MAX);
                let justified = if key.ends_with(".end") {
                    justify_end(&bytes, raw)
                } else {
                    justify_start(&bytes, raw)
                };
                (key.clone(), u64::try_from(justified).unwrap_or(u64::MAX))
            })
            .collect())
    }

    /// Writes the line-justified marker table to `path` as one
    /// `name.start=offset` / `name.end=offset` line per marker, replacing
    /// any previous table at that path.
    ///
    /// # Errors
    ///
    /// Returns an i/o error when the old table cannot be removed or the new
    /// one cannot be written.
    pub async fn write_marker_table(&self, path: &Utf8Path) -> Result<(), CaptureError> {
        let markers = self.markers().await?;
        match tokio::fs::remove_file(path.as_std_path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(CaptureError::Io(err)),
        }
        let mut table = String::new();
        for (key, offset) in &markers {
            table.push_str(&format!("{key}={offset}\n"));
        }
        tokio::fs::write(path.as_std_path(), table).await?;
        Ok(())
    }
}

async fn drain_stream(
    mut process: RemoteProcess,
    mut reader: ChildStdout,
    mut sink: File,
    mut requests: mpsc::Receiver<DrainRequest>,
) {
    let mut buf = vec![0_u8; DRAIN_BUF_SIZE];
    let mut written: u64 = 0;
    let mut markers = BTreeMap::new();
    let mut eof = false;
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(DrainRequest::Mark { key, reply }) => {
                    let result = capture_marker(
                        &process, &mut reader, &mut sink, &mut buf, &mut written, &mut markers, key,
                    )
                    .await;
                    if reply.send(result).is_err() {
                        debug!("marker requester went away before acknowledgement");
                    }
                }
                Some(DrainRequest::Close { reply }) => {
                    let result = finish(
                        &mut process, &mut reader, &mut sink, &mut buf, &mut written,
                    )
                    .await
                    .map(|()| std::mem::take(&mut markers));
                    if reply.send(result).is_err() {
                        debug!("capture closer went away before acknowledgement");
                    }
                    return;
                }
                None => {
                    // Session handle dropped without close; kill the
                    // producer rather than drain forever.
                    if let Err(err) = process.stop(true, Some(SCOPE_STOP_TIMEOUT)).await {
                        debug!(error = %err, "failed to stop orphaned log producer");
                    }
                    return;
                }
            },
            read = reader.read(&mut buf), if !eof => match read {
                Ok(0) => eof = true,
                Ok(n) => {
                    if let Err(err) = write_chunk(&mut sink, &buf, n, &mut written).await {
                        error!(error = %err, "log capture sink write failed, stopping copy");
                        eof = true;
                    }
                }
                Err(err) => {
                    error!(error = %err, "log capture stream read failed");
                    eof = true;
                }
            },
        }
    }
}

/// The pause/flush/record/resume critical section. The producer is paused
/// with a synchronous OS-level stop before the pipe is drained, so the
/// recorded offset can never split an in-flight write; requests are handled
/// serially by the drain task, so two captures can never interleave.
async fn capture_marker(
    process: &RemoteProcess,
    reader: &mut ChildStdout,
    sink: &mut File,
    buf: &mut [u8],
    written: &mut u64,
    markers: &mut BTreeMap<String, u64>,
    key: String,
) -> Result<(), CaptureError> {
    process.pause()?;
    let drained = drain_pending(reader, sink, buf, written).await;
    let offset = *written;
    let resumed = process.resume();
    drained?;
    resumed?;
    match markers.entry(key) {
        Entry::Occupied(slot) => {
            error!(marker = %slot.key(), "duplicate marker name, keeping first offset");
        }
        Entry::Vacant(slot) => {
            slot.insert(offset);
        }
    }
    Ok(())
}

async fn finish(
    process: &mut RemoteProcess,
    reader: &mut ChildStdout,
    sink: &mut File,
    buf: &mut [u8],
    written: &mut u64,
) -> Result<(), CaptureError> {
    if let Err(err) = process.stop(false, Some(SCOPE_STOP_TIMEOUT)).await {
        debug!(error = %err, "graceful stop of log producer incomplete, forcing kill");
        if let Err(kill_err) = process.stop(true, Some(SCOPE_STOP_TIMEOUT)).await {
            error!(error = %kill_err, "failed to kill log producer on close");
        }
    }
    drain_pending(reader, sink, buf, written).await?;
    Ok(())
}

/// Copies buffered pipe content to the sink until end-of-data or a short
/// idle window elapses, then flushes the sink.
async fn drain_pending(
    reader: &mut ChildStdout,
    sink: &mut File,
    buf: &mut [u8],
    written: &mut u64,
) -> Result<(), CaptureError> {
    loop {
        match tokio::time::timeout(FLUSH_IDLE, reader.read(buf)).await {
            Err(_) | Ok(Ok(0)) => break,
            Ok(Ok(n)) => write_chunk(sink, buf, n, written).await?,
            Ok(Err(err)) => return Err(CaptureError::Io(err)),
        }
    }
    sink.flush().await?;
    Ok(())
}

async fn write_chunk(
    sink: &mut File,
    buf: &[u8],
    n: usize,
    written: &mut u64,
) -> Result<(), std::io::Error> {
    let chunk = buf.get(..n).unwrap_or(buf);
    sink.write_all(chunk).await?;
    if let Ok(len) = u64::try_from(chunk.len()) {
        *written += len;
    }
    Ok(())
}
