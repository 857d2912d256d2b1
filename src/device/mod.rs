//! Bridge to a remotely connected device through the `adb` command.
//!
//! [`Device`] is a thin, minimally embellished wrapper over the adb binary:
//! it formulates `adb -s <serial> …` invocations, executes one-shot commands
//! with captured output and a timeout, and spawns long-running commands for
//! line-by-line monitoring. One-shot execution goes through the
//! [`CommandRunner`] seam so tests can script device responses.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

pub(crate) mod lock;
pub mod process;

use process::{ProcessError, ProcessScope, RemoteProcess};

/// Default budget for short adb commands (queries, settings).
pub const TIMEOUT_ADB_CMD: Duration = Duration::from_secs(10);

/// Budget for long-running adb commands (installs, pushes).
pub const TIMEOUT_LONG_ADB_CMD: Duration = Duration::from_secs(240);

/// Errors raised by device command execution.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Raised when the configured adb binary does not exist.
    #[error("invalid adb path given: '{path}'")]
    InvalidAdbPath {
        /// The path that failed validation.
        path: Utf8PathBuf,
    },
    /// Raised when the adb command could not be spawned.
    #[error("failed to launch '{program}': {message}")]
    LaunchFailure {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Raised when a remote command exited with a failing code.
    #[error(
        "failed to execute '{command}' on device {device_id} \
         (exit code {return_code:?}):\n{stdout}\n{stderr}"
    )]
    CommandExecutionFailure {
        /// Device serial the command ran against.
        device_id: String,
        /// The remote command arguments as one display string.
        command: String,
        /// Exit code, absent when the process died to a signal.
        return_code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when a one-shot command did not finish within its budget.
    #[error("'{command}' did not complete within {timeout:?}")]
    CommandTimeout {
        /// The remote command arguments as one display string.
        command: String,
        /// The budget that elapsed.
        timeout: Duration,
    },
}

/// Result of running a one-shot external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over one-shot command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::LaunchFailure`] if the command cannot be
    /// started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
    ) -> impl Future<Output = Result<CommandOutput, DeviceError>> + Send;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeviceError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|err| DeviceError::LaunchFailure {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A USB- or network-connected device addressed by its adb serial.
#[derive(Clone, Debug)]
pub struct Device<R: CommandRunner = ProcessCommandRunner> {
    device_id: String,
    adb_path: Utf8PathBuf,
    runner: R,
}

impl Device<ProcessCommandRunner> {
    /// Creates a device bridge using the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidAdbPath`] when `adb_path` is not a file.
    pub fn new(
        device_id: impl Into<String>,
        adb_path: impl Into<Utf8PathBuf>,
    ) -> Result<Self, DeviceError> {
        Self::with_runner(device_id, adb_path, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Device<R> {
    /// Creates a device bridge with the provided runner.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidAdbPath`] when `adb_path` is not a file.
    pub fn with_runner(
        device_id: impl Into<String>,
        adb_path: impl Into<Utf8PathBuf>,
        runner: R,
    ) -> Result<Self, DeviceError> {
        let adb_path = adb_path.into();
        if !adb_path.is_file() {
            return Err(DeviceError::InvalidAdbPath { path: adb_path });
        }
        Ok(Self {
            device_id: device_id.into(),
            adb_path,
            runner,
        })
    }

    /// Returns the unique serial id of this device.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the configured adb binary path.
    #[must_use]
    pub fn adb_path(&self) -> &Utf8Path {
        &self.adb_path
    }

    fn formulate_adb_args(&self, args: &[&str]) -> Vec<OsString> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push(OsString::from("-s"));
        full.push(OsString::from(&self.device_id));
        full.extend(args.iter().map(OsString::from));
        full
    }

    /// Executes a one-shot command on this device with the default budget.
    ///
    /// # Errors
    ///
    /// See [`Device::execute_remote_cmd_timeout`].
    pub async fn execute_remote_cmd(&self, args: &[&str]) -> Result<CommandOutput, DeviceError> {
        self.execute_remote_cmd_timeout(args, TIMEOUT_ADB_CMD).await
    }

    /// Executes a one-shot command on this device, failing on a non-zero
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::LaunchFailure`] if adb cannot be started,
    /// [`DeviceError::CommandTimeout`] when the budget elapses, or
    /// [`DeviceError::CommandExecutionFailure`] carrying the captured output
    /// on a failing exit code.
    pub async fn execute_remote_cmd_timeout(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, DeviceError> {
        let output = self.execute_remote_cmd_unchecked(args, timeout).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(DeviceError::CommandExecutionFailure {
            device_id: self.device_id.clone(),
            command: args.join(" "),
            return_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Executes a one-shot command, returning the output regardless of the
    /// exit code. Used by best-effort paths that log rather than raise.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::LaunchFailure`] or
    /// [`DeviceError::CommandTimeout`] only.
    pub async fn execute_remote_cmd_unchecked(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, DeviceError> {
        let full_args = self.formulate_adb_args(args);
        debug!(device = %self.device_id, command = %args.join(" "), ?timeout, "executing remote command");
        tokio::time::timeout(timeout, self.runner.run(self.adb_path.as_str(), &full_args))
            .await
            .map_err(|_| DeviceError::CommandTimeout {
                command: args.join(" "),
                timeout,
            })?
    }

    /// Spawns a long-running command on this device for line monitoring,
    /// wrapped in a termination-guaranteeing [`ProcessScope`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Launch`] when adb cannot be started; launch
    /// failures are fatal to the operation and never retried.
    pub fn monitor_remote_cmd(&self, args: &[&str]) -> Result<ProcessScope, ProcessError> {
        self.spawn_remote_cmd(args).map(ProcessScope::new)
    }

    /// Spawns a long-running command on this device without scope wrapping.
    /// Callers take over lifecycle responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Launch`] when adb cannot be started.
    pub fn spawn_remote_cmd(&self, args: &[&str]) -> Result<RemoteProcess, ProcessError> {
        let full_args = self.formulate_adb_args(args);
        debug!(device = %self.device_id, command = %args.join(" "), "spawning remote command");
        RemoteProcess::spawn(self.adb_path.as_str(), &full_args)
    }

    /// Returns a system property from the device, or `None` when the
    /// property is absent or the query fails (failures are logged).
    pub async fn get_system_property(&self, key: &str) -> Option<String> {
        match self.execute_remote_cmd(&["shell", "getprop", key]).await {
            Ok(output) => {
                let value = output.stdout.trim();
                if value.is_empty() {
                    None
                } else {
                    Some(value.to_owned())
                }
            }
            Err(err) => {
                error!(key, error = %err, "unable to get system property");
                None
            }
        }
    }

    /// Returns the installed version of `package`, or `None` when the
    /// package is absent or the query fails.
    pub async fn get_version(&self, package: &str) -> Option<String> {
        let completed = match self
            .execute_remote_cmd(&["shell", "dumpsys", "package", package])
            .await
        {
            Ok(output) => output,
            Err(err) => {
                error!(package, error = %err, "unable to get package version");
                return None;
            }
        };
        completed
            .stdout
            .lines()
            .filter(|line| line.contains("versionName"))
            .find_map(|line| line.split_once('='))
            .map(|(_, version)| version.trim().to_owned())
    }

    /// Lists items of a given kind (`package`, `instrumentation`) known to
    /// the device's package manager.
    ///
    /// # Errors
    ///
    /// Propagates command execution failures.
    pub async fn list(&self, kind: &str) -> Result<Vec<String>, DeviceError> {
        let completed = self
            .execute_remote_cmd(&["shell", "pm", "list", kind])
            .await?;
        Ok(completed.stdout.lines().map(str::to_owned).collect())
    }

    /// Lists all packages installed on the device.
    ///
    /// # Errors
    ///
    /// Propagates command execution failures.
    pub async fn list_installed_packages(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .list("package")
            .await?
            .into_iter()
            .filter(|item| item.contains("package"))
            .map(|item| item.replace("package:", "").trim().to_owned())
            .collect())
    }

    /// Lists instrumentation runners registered on the device.
    ///
    /// # Errors
    ///
    /// Propagates command execution failures.
    pub async fn list_instrumentation(&self) -> Result<Vec<String>, DeviceError> {
        self.list("instrumentation").await
    }
}
