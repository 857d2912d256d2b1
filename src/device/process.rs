//! Remote process monitoring and scoped lifecycle control.
//!
//! A [`RemoteProcess`] wraps a spawned adb child and exposes a lazy,
//! single-pass line stream with an optional per-read unresponsive timeout,
//! plus explicit wait/stop/pause control. A [`ProcessScope`] owns a
//! `RemoteProcess` and guarantees termination (graceful, then forced) on
//! every exit path.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Budget for each of the graceful and forced termination attempts made when
/// a [`ProcessScope`] exits.
pub const SCOPE_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors raised by remote process control.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Raised when the command could not be spawned at all. Launch failures
    /// are fatal to the operation that needed the process; they are never
    /// retried.
    #[error("failed to launch '{program}': {message}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Raised when no output line arrived within the unresponsive window.
    /// The process is left running; the caller decides whether to kill it.
    #[error("remote process produced no output within {timeout:?}")]
    Unresponsive {
        /// The window that elapsed.
        timeout: Duration,
    },
    /// Raised when the process did not exit within the wait budget. The
    /// process is not killed.
    #[error("remote process did not exit within {timeout:?}")]
    WaitTimeout {
        /// The budget that elapsed.
        timeout: Duration,
    },
    /// Raised when waiting on the process failed at the OS level.
    #[error("failed to wait on remote process: {message}")]
    Wait {
        /// Operating system error text.
        message: String,
    },
    /// Raised when a control signal could not be delivered to the process.
    #[error("failed to signal remote process: {message}")]
    Signal {
        /// Operating system error text.
        message: String,
    },
    /// Raised when the line stream or raw output was requested after the
    /// other access mode already consumed the process output.
    #[error("process output is no longer available in the requested mode")]
    OutputUnavailable,
    /// Raised by [`ProcessScope::exit`] when the wrapped process exited with
    /// a non-zero code while the scope was already unwinding with an error.
    #[error("remote command failed on device with exit code {code}")]
    CommandFailed {
        /// The non-zero exit code observed.
        code: i32,
    },
}

/// A spawned remote command with line-oriented output monitoring.
///
/// Standard error is merged into the line stream alongside standard output,
/// matching the combined view callers get from the device transport. The
/// line sequence is lazy, single-pass, and non-restartable.
#[derive(Debug)]
pub struct RemoteProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    line_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl RemoteProcess {
    /// Spawns `program` with `args`, capturing its output for monitoring.
    ///
    /// The child is configured to be killed if the handle is dropped while
    /// still running, so no remote process can outlive its owner.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Launch`] when the command cannot be started.
    pub fn spawn<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Self, ProcessError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ProcessError::Launch {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(Self::from_child(child))
    }

    /// Wraps an already-spawned child.
    pub fn from_child(mut child: Child) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Self {
            child,
            stdout,
            stderr,
            line_rx: None,
        }
    }

    /// Returns the OS process id, or `None` once the child has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Returns the exit code if the process has exited, `None` while it is
    /// still running or when it was terminated by a signal.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    /// Returns `true` once the process has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Produces the next decoded output line, or `None` at end of stream.
    ///
    /// The first call starts background pump tasks that merge stdout and
    /// stderr into a single ordered channel of lines. When
    /// `unresponsive_timeout` is set it bounds the wait for this line only;
    /// the window resets on every received line. On elapse the process is
    /// left running; suite-level policy decides its fate.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Unresponsive`] when the window elapses, or
    /// [`ProcessError::OutputUnavailable`] if the raw output was already
    /// taken via [`RemoteProcess::take_stdout`].
    pub async fn next_line(
        &mut self,
        unresponsive_timeout: Option<Duration>,
    ) -> Result<Option<String>, ProcessError> {
        self.ensure_line_pumps()?;
        let rx = self
            .line_rx
            .as_mut()
            .ok_or(ProcessError::OutputUnavailable)?;
        match unresponsive_timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx.recv())
                .await
                .map_err(|_| ProcessError::Unresponsive { timeout }),
            None => Ok(rx.recv().await),
        }
    }

    /// Hands the raw standard-output pipe to the caller, bypassing line
    /// decoding. Standard error is drained in the background at trace level.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::OutputUnavailable`] if line monitoring has
    /// already started or the pipe was taken before.
    pub fn take_stdout(&mut self) -> Result<ChildStdout, ProcessError> {
        if self.line_rx.is_some() {
            return Err(ProcessError::OutputUnavailable);
        }
        let stdout = self
            .stdout
            .take()
            .ok_or(ProcessError::OutputUnavailable)?;
        if let Some(stderr) = self.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(line, "remote process stderr");
                }
            });
        }
        Ok(stdout)
    }

    /// Suspends the process with a true OS-level pause (SIGSTOP). No further
    /// bytes can be produced until [`RemoteProcess::resume`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Signal`] when the signal cannot be delivered.
    pub fn pause(&self) -> Result<(), ProcessError> {
        self.signal(Signal::SIGSTOP)
    }

    /// Resumes a process previously paused with [`RemoteProcess::pause`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Signal`] when the signal cannot be delivered.
    pub fn resume(&self) -> Result<(), ProcessError> {
        self.signal(Signal::SIGCONT)
    }

    /// Suspends the caller until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::WaitTimeout`] when `timeout` elapses first;
    /// the process is not killed.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<(), ProcessError> {
        match timeout {
            Some(budget) => match tokio::time::timeout(budget, self.child.wait()).await {
                Ok(result) => Self::map_wait(result),
                Err(_) => Err(ProcessError::WaitTimeout { timeout: budget }),
            },
            None => Self::map_wait(self.child.wait().await),
        }
    }

    /// Requests termination (SIGTERM, or SIGKILL when `force`) and then
    /// waits for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Signal`] if the signal cannot be sent, or any
    /// error from [`RemoteProcess::wait`].
    pub async fn stop(
        &mut self,
        force: bool,
        timeout: Option<Duration>,
    ) -> Result<(), ProcessError> {
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        self.signal(signal)?;
        self.wait(timeout).await
    }

    fn ensure_line_pumps(&mut self) -> Result<(), ProcessError> {
        if self.line_rx.is_some() {
            return Ok(());
        }
        let stdout = self
            .stdout
            .take()
            .ok_or(ProcessError::OutputUnavailable)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_lines(stdout, tx.clone()));
        if let Some(stderr) = self.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx));
        }
        self.line_rx = Some(rx);
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        // A reaped child has no pid; signalling it is a no-op, not an error.
        let Some(raw_pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(raw_pid).map_err(|_| ProcessError::Signal {
            message: format!("pid {raw_pid} out of range"),
        })?;
        kill(Pid::from_raw(pid), signal).map_err(|err| ProcessError::Signal {
            message: format!("{} to pid {pid}: {err}", signal.as_str()),
        })
    }

    fn map_wait(result: std::io::Result<std::process::ExitStatus>) -> Result<(), ProcessError> {
        result.map(|_| ()).map_err(|err| ProcessError::Wait {
            message: err.to_string(),
        })
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Scoped ownership of a [`RemoteProcess`] guaranteeing termination.
///
/// Callers drive the process through [`ProcessScope::process`] and finish
/// with [`ProcessScope::exit`], which performs a graceful stop followed by a
/// forced kill when needed. Dropping the scope without calling `exit` (a
/// cancellation or panic path) still kills a live child via the kill-on-drop
/// configuration of the underlying handle.
#[derive(Debug)]
pub struct ProcessScope {
    process: RemoteProcess,
}

impl ProcessScope {
    /// Wraps a spawned process in a scope.
    pub fn new(process: RemoteProcess) -> Self {
        Self { process }
    }

    /// Borrows the wrapped process.
    pub fn process(&mut self) -> &mut RemoteProcess {
        &mut self.process
    }

    /// Exits the scope, terminating the process if it is still running.
    ///
    /// A still-running process first receives a graceful stop bounded by
    /// [`SCOPE_STOP_TIMEOUT`]; if it survives, a forced kill with the same
    /// budget. A kill failure after both attempts is logged, not escalated.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::CommandFailed`] when the process exited with
    /// a non-zero code and `pending_error` indicates the scope is already
    /// unwinding because of a failure.
    pub async fn exit(self, pending_error: bool) -> Result<(), ProcessError> {
        let mut process = self.process;
        if !process.has_exited() {
            if let Some(pid) = process.id() {
                debug!(pid, "terminating remote process on scope exit");
            }
            if let Err(err) = process.stop(false, Some(SCOPE_STOP_TIMEOUT)).await {
                debug!(error = %err, "graceful stop incomplete, forcing kill");
                if let Err(kill_err) = process.stop(true, Some(SCOPE_STOP_TIMEOUT)).await {
                    error!(error = %kill_err, "failed to kill remote process on scope exit");
                }
            }
        }
        if pending_error {
            if let Some(code) = process.exit_code() {
                if code != 0 {
                    return Err(ProcessError::CommandFailed { code });
                }
            }
        }
        Ok(())
    }
}
