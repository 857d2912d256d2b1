//! File transfer to and from device storage.

use camino::Utf8Path;
use tracing::debug;

use crate::device::{CommandRunner, Device, DeviceError, TIMEOUT_LONG_ADB_CMD};

/// Abstraction over device file storage so the orchestrator's artifact
/// handling can be scripted in tests.
pub trait DeviceStorage: Send + Sync {
    /// Copies a local file or directory to `remote` on the device.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the transfer fails or times out.
    fn push(
        &self,
        local: &Utf8Path,
        remote: &str,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Removes a file (or directory tree, when `recursive`) from the device.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the removal command fails.
    fn remove(
        &self,
        remote: &str,
        recursive: bool,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

/// Device storage backed by `adb push` and `adb shell rm`.
#[derive(Clone, Debug)]
pub struct AdbDeviceStorage<R: CommandRunner> {
    device: Device<R>,
}

impl<R: CommandRunner> AdbDeviceStorage<R> {
    /// Wraps storage access around a device bridge.
    pub const fn new(device: Device<R>) -> Self {
        Self { device }
    }
}

impl<R: CommandRunner> DeviceStorage for AdbDeviceStorage<R> {
    async fn push(&self, local: &Utf8Path, remote: &str) -> Result<(), DeviceError> {
        debug!(local = %local, remote, "pushing file to device");
        self.device
            .execute_remote_cmd_timeout(&["push", local.as_str(), remote], TIMEOUT_LONG_ADB_CMD)
            .await?;
        Ok(())
    }

    async fn remove(&self, remote: &str, recursive: bool) -> Result<(), DeviceError> {
        debug!(remote, recursive, "removing file from device");
        let args: &[&str] = if recursive {
            &["shell", "rm", "-r", remote]
        } else {
            &["shell", "rm", remote]
        };
        self.device.execute_remote_cmd(args).await?;
        Ok(())
    }
}
