//! Installed application control and instrumentation launching.
//!
//! [`Application`] manages one installed package: staged install under the
//! per-device lock, data clearing, and dangerous-permission grants.
//! [`TestApplication`] adds the instrumentation runner surface used to start
//! remote test runs.

use std::borrow::Cow;
use std::collections::BTreeSet;

use camino::Utf8Path;
use serde::Deserialize;
use shell_escape::escape;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::lock::lock_device;
use crate::device::process::{ProcessError, ProcessScope};
use crate::device::{CommandRunner, Device, DeviceError, TIMEOUT_LONG_ADB_CMD};

/// Permissions Android classifies as dangerous; only these can be granted
/// through the package manager, everything else is filtered before granting.
pub const DANGEROUS_PERMISSIONS: &[&str] = &[
    "android.permission.ACCEPT_HANDOVER",
    "android.permission.ACCESS_BACKGROUND_LOCATION",
    "android.permission.ACCESS_COARSE_LOCATION",
    "android.permission.ACCESS_FINE_LOCATION",
    "android.permission.ACCESS_MEDIA_LOCATION",
    "android.permission.ACTIVITY_RECOGNITION",
    "android.permission.ADD_VOICEMAIL",
    "android.permission.ANSWER_PHONE_CALLS",
    "android.permission.BODY_SENSORS",
    "android.permission.CALL_PHONE",
    "android.permission.CALL_PRIVILEGED",
    "android.permission.CAMERA",
    "android.permission.GET_ACCOUNTS",
    "android.permission.PROCESS_OUTGOING_CALLS",
    "android.permission.READ_CALENDAR",
    "android.permission.READ_CALL_LOG",
    "android.permission.READ_CONTACTS",
    "android.permission.READ_EXTERNAL_STORAGE",
    "android.permission.READ_PHONE_NUMBERS",
    "android.permission.READ_PHONE_STATE",
    "android.permission.READ_SMS",
    "android.permission.READ_MMS",
    "android.permission.RECEIVE_SMS",
    "android.permission.RECEIVE_WAP_PUSH",
    "android.permission.RECORD_AUDIO",
    "android.permission.SEND_SMS",
    "android.permission.USE_SIP",
    "android.permission.WRITE_CALENDAR",
    "android.permission.WRITE_CALL_LOG",
    "android.permission.WRITE_CONTACTS",
    "android.permission.WRITE_EXTERNAL_STORAGE",
];

/// Errors raised by application management.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// A device command failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A monitored process failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// The on-device package manager rejected the install.
    #[error("install of {package} failed with exit code {code}")]
    InstallFailed {
        /// Package that failed to install.
        package: String,
        /// Exit code of the install command.
        code: i32,
    },
    /// The application a test app targets is not installed on the device.
    #[error("target application {package} is not installed on the device")]
    TargetNotInstalled {
        /// The missing package.
        package: String,
    },
}

/// Declared identity and permission requirements of an application,
/// normally loaded from a plan or manifest file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ApplicationManifest {
    /// Android package name.
    pub package_name: String,
    /// Permissions the application declares.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Manifest of an instrumentation test application.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TestManifest {
    /// Package name of the test application itself.
    pub package_name: String,
    /// Permissions the test application declares.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Instrumentation runner class registered by the test application.
    pub runner: String,
    /// Package name of the application under test.
    pub target_package: String,
}

/// An application installed on a device.
#[derive(Clone, Debug)]
pub struct Application<R: CommandRunner> {
    device: Device<R>,
    package_name: String,
    permissions: BTreeSet<String>,
    granted_permissions: BTreeSet<String>,
}

impl<R: CommandRunner> Application<R> {
    /// Installs the apk at `apk_path` and returns a handle for the package.
    ///
    /// The apk is staged to device-local storage, installed through the
    /// on-device package manager while holding the per-device lock (two
    /// installs to one device never interleave), and the staged copy is
    /// removed on every path, success or failure.
    ///
    /// # Errors
    ///
    /// Returns the push or install failure; staged-copy removal failures are
    /// only logged.
    pub async fn install(
        device: Device<R>,
        apk_path: &Utf8Path,
        manifest: &ApplicationManifest,
        as_upgrade: bool,
    ) -> Result<Self, ApplicationError> {
        let mut extra = Vec::new();
        if as_upgrade {
            extra.push("-r");
        }
        staged_install(&device, apk_path, &manifest.package_name, &extra).await?;
        Ok(Self::for_installed(device, manifest))
    }

    /// Wraps an already-installed package without touching the device.
    pub fn for_installed(device: Device<R>, manifest: &ApplicationManifest) -> Self {
        Self {
            device,
            package_name: manifest.package_name.clone(),
            permissions: manifest.permissions.iter().cloned().collect(),
            granted_permissions: BTreeSet::new(),
        }
    }

    /// Returns the Android package name.
    #[must_use]
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Returns the permissions the application declares.
    #[must_use]
    pub const fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    /// Returns the permissions granted so far through this handle.
    #[must_use]
    pub const fn granted_permissions(&self) -> &BTreeSet<String> {
        &self.granted_permissions
    }

    /// Returns the installed version of the package, if queryable.
    pub async fn version(&self) -> Option<String> {
        self.device.get_version(&self.package_name).await
    }

    /// Returns the pid of the application if it is running.
    pub async fn pid(&self) -> Option<String> {
        let completed = self
            .device
            .execute_remote_cmd(&["shell", "pidof", "-s", &self.package_name])
            .await
            .ok()?;
        completed
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|pid| !pid.is_empty())
            .map(str::to_owned)
    }

    /// Uninstalls the package. Best-effort: failures are logged, never
    /// raised, since uninstall runs on cleanup paths.
    pub async fn uninstall(&self) {
        match self
            .device
            .execute_remote_cmd_unchecked(&["uninstall", &self.package_name], TIMEOUT_LONG_ADB_CMD)
            .await
        {
            Ok(completed) if !completed.is_success() => {
                warn!(
                    package = %self.package_name,
                    code = ?completed.code,
                    stderr = %completed.stderr,
                    "failed to uninstall package"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(package = %self.package_name, error = %err, "uninstall command failed");
            }
        }
    }

    /// Grants the requested permissions (or, with `None`, the declared
    /// ones), filtered to the dangerous-permission list. Grants are issued
    /// one by one; individual failures are logged and do not stop the rest.
    pub async fn grant_permissions(&mut self, permissions: Option<&[String]>) {
        let requested: Vec<String> = permissions.map_or_else(
            || self.permissions.iter().cloned().collect(),
            <[String]>::to_vec,
        );
        let filtered: Vec<String> = requested
            .iter()
            .map(|p| p.trim().to_owned())
            .filter(|p| DANGEROUS_PERMISSIONS.contains(&p.as_str()))
            .collect();
        if filtered.is_empty() {
            info!(
                package = %self.package_name,
                "no dangerous permissions requested, nothing to grant"
            );
            return;
        }
        for permission in filtered {
            if let Err(err) = self
                .device
                .execute_remote_cmd(&["shell", "pm", "grant", &self.package_name, &permission])
                .await
            {
                warn!(
                    package = %self.package_name,
                    permission = %permission,
                    error = %err,
                    "failed to grant permission"
                );
            }
            self.granted_permissions.insert(permission);
        }
    }

    /// Re-grants every permission previously granted through this handle,
    /// used after a data clear wipes the grant state on the device.
    pub async fn regrant_permissions(&mut self) {
        let prior: Vec<String> = self.granted_permissions.iter().cloned().collect();
        if !prior.is_empty() {
            self.grant_permissions(Some(&prior)).await;
        }
    }

    /// Clears the application's on-device data, re-granting previously
    /// granted permissions unless told otherwise.
    ///
    /// # Errors
    ///
    /// Returns the device failure from the clear command.
    pub async fn clear_data(&mut self, regrant: bool) -> Result<(), ApplicationError> {
        self.device
            .execute_remote_cmd(&["shell", "pm", "clear", &self.package_name])
            .await?;
        if regrant {
            self.regrant_permissions().await;
        } else {
            self.granted_permissions.clear();
        }
        Ok(())
    }
}

/// The application-control contract the orchestrator consumes for pre-suite
/// preparation.
pub trait ApplicationControl: Send {
    /// Clears on-device data for the application under test; with `regrant`
    /// the previously granted permissions are granted again.
    fn clear_data(
        &mut self,
        regrant: bool,
    ) -> impl Future<Output = Result<(), ApplicationError>> + Send;

    /// Grants the application's declared dangerous permissions.
    fn grant_declared_permissions(&mut self) -> impl Future<Output = ()> + Send;
}

impl<R: CommandRunner> ApplicationControl for Application<R> {
    async fn clear_data(&mut self, regrant: bool) -> Result<(), ApplicationError> {
        Self::clear_data(self, regrant).await
    }

    async fn grant_declared_permissions(&mut self) {
        self.grant_permissions(None).await;
    }
}

/// An installed instrumentation test application.
#[derive(Clone, Debug)]
pub struct TestApplication<R: CommandRunner> {
    app: Application<R>,
    runner: String,
    target_package: String,
}

impl<R: CommandRunner> TestApplication<R> {
    /// Installs the test apk (always with `-t`) and returns a handle.
    ///
    /// # Errors
    ///
    /// Returns the push or install failure.
    pub async fn install(
        device: Device<R>,
        apk_path: &Utf8Path,
        manifest: &TestManifest,
    ) -> Result<Self, ApplicationError> {
        staged_install(&device, apk_path, &manifest.package_name, &["-t"]).await?;
        Ok(Self::for_installed(device, manifest))
    }

    /// Wraps an already-installed test package without touching the device.
    pub fn for_installed(device: Device<R>, manifest: &TestManifest) -> Self {
        let app_manifest = ApplicationManifest {
            package_name: manifest.package_name.clone(),
            permissions: manifest.permissions.clone(),
        };
        Self {
            app: Application::for_installed(device, &app_manifest),
            runner: manifest.runner.clone(),
            target_package: manifest.target_package.clone(),
        }
    }

    /// Returns the underlying application handle.
    pub const fn application(&mut self) -> &mut Application<R> {
        &mut self.app
    }

    /// Returns the instrumentation runner class.
    #[must_use]
    pub fn runner(&self) -> &str {
        &self.runner
    }

    /// Lists all instrumentation runners the device knows for this package.
    ///
    /// # Errors
    ///
    /// Propagates command execution failures.
    pub async fn list_runners(&self) -> Result<Vec<String>, DeviceError> {
        Ok(self
            .app
            .device
            .list_instrumentation()
            .await?
            .into_iter()
            .filter(|line| line.contains(&self.app.package_name))
            .filter_map(|line| {
                line.replace("instrumentation:", "")
                    .split_whitespace()
                    .next()
                    .map(str::to_owned)
            })
            .collect())
    }

    /// Starts an instrumentation run with the given instrument arguments,
    /// returning a scope that guarantees the remote runner's termination.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::TargetNotInstalled`] when the application
    /// under test is missing, or the launch failure otherwise.
    pub async fn run(&self, options: &[String]) -> Result<ProcessScope, ApplicationError> {
        let installed = self.app.device.list_installed_packages().await?;
        if !installed.contains(&self.target_package) {
            return Err(ApplicationError::TargetNotInstalled {
                package: self.target_package.clone(),
            });
        }
        let args = instrument_args(&self.app.package_name, &self.runner, options);
        debug!(command = %args.join(" "), "starting instrumentation run");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self.app.device.monitor_remote_cmd(&arg_refs)?)
    }
}

/// Builds the remote instrument command. Each caller argument is quoted so
/// spaces survive the trip through the device shell.
fn instrument_args(package: &str, runner: &str, options: &[String]) -> Vec<String> {
    let mut args = vec![
        "shell".to_owned(),
        "am".to_owned(),
        "instrument".to_owned(),
        "-w".to_owned(),
    ];
    args.extend(
        options
            .iter()
            .map(|option| escape(Cow::Borrowed(option.as_str())).into_owned()),
    );
    args.push("-r".to_owned());
    args.push(format!("{package}/{runner}"));
    args
}

/// Pushes the apk to device-local storage, installs it through the package
/// manager under the per-device lock, and always removes the staged copy.
async fn staged_install<R: CommandRunner>(
    device: &Device<R>,
    apk_path: &Utf8Path,
    package: &str,
    extra_args: &[&str],
) -> Result<(), ApplicationError> {
    let remote_path = format!("/data/local/tmp/{package}");
    let result = push_and_install(device, apk_path, package, &remote_path, extra_args).await;
    if let Err(err) = device
        .execute_remote_cmd(&["shell", "rm", &remote_path])
        .await
    {
        debug!(remote = %remote_path, error = %err, "failed to remove staged apk");
    }
    result
}

async fn push_and_install<R: CommandRunner>(
    device: &Device<R>,
    apk_path: &Utf8Path,
    package: &str,
    remote_path: &str,
    extra_args: &[&str],
) -> Result<(), ApplicationError> {
    device
        .execute_remote_cmd_timeout(&["push", apk_path.as_str(), remote_path], TIMEOUT_LONG_ADB_CMD)
        .await?;
    let _guard = lock_device(device.device_id()).await;
    let mut args = vec!["shell", "pm", "install"];
    args.extend_from_slice(extra_args);
    args.push(remote_path);
    let mut scope = device.monitor_remote_cmd(&args)?;
    scope.process().wait(Some(TIMEOUT_LONG_ADB_CMD)).await?;
    let code = scope.process().exit_code();
    scope.exit(false).await?;
    match code {
        Some(0) | None => Ok(()),
        Some(code) => Err(ApplicationError::InstallFailed {
            package: package.to_owned(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::{
        Application, ApplicationControl, ApplicationError, ApplicationManifest, TestApplication,
        TestManifest, instrument_args,
    };
    use crate::device::Device;
    use crate::test_support::ScriptedRunner;

    fn manifest(permissions: &[&str]) -> ApplicationManifest {
        ApplicationManifest {
            package_name: "com.example.app".to_owned(),
            permissions: permissions.iter().map(|&p| p.to_owned()).collect(),
        }
    }

    fn scripted_device(runner: ScriptedRunner) -> Device<ScriptedRunner> {
        Device::with_runner("emulator-5554", "/bin/sh", runner).expect("device")
    }

    #[tokio::test]
    async fn install_stages_then_removes_the_apk() {
        let runner = ScriptedRunner::new();
        let device = scripted_device(runner.clone());

        Application::install(device, Utf8Path::new("/tmp/app.apk"), &manifest(&[]), false)
            .await
            .expect("install succeeds");

        let commands = runner.command_strings();
        assert_eq!(commands.len(), 2, "push and staged-copy removal: {commands:?}");
        assert!(commands.first().expect("push").contains("push /tmp/app.apk"));
        assert!(
            commands
                .last()
                .expect("rm")
                .ends_with("shell rm /data/local/tmp/com.example.app")
        );
    }

    #[tokio::test]
    async fn failed_push_still_removes_the_staged_path() {
        let runner = ScriptedRunner::new();
        runner.push_failure(1, "device full");
        let device = scripted_device(runner.clone());

        let result =
            Application::install(device, Utf8Path::new("/tmp/app.apk"), &manifest(&[]), false)
                .await;
        assert!(matches!(result, Err(ApplicationError::Device(_))));
        assert!(
            runner
                .command_strings()
                .last()
                .expect("rm attempted")
                .contains("shell rm /data/local/tmp/")
        );
    }

    #[tokio::test]
    async fn grants_filter_out_non_dangerous_permissions() {
        let runner = ScriptedRunner::new();
        let device = scripted_device(runner.clone());
        let mut app = Application::for_installed(
            device,
            &manifest(&["android.permission.CAMERA", "android.permission.INTERNET"]),
        );

        app.grant_permissions(None).await;

        assert_eq!(
            runner.command_strings(),
            vec![
                "/bin/sh -s emulator-5554 shell pm grant com.example.app \
                 android.permission.CAMERA"
                    .to_owned()
            ]
        );
        assert!(app.granted_permissions().contains("android.permission.CAMERA"));
        assert!(!app.granted_permissions().contains("android.permission.INTERNET"));
    }

    #[tokio::test]
    async fn control_contract_grants_the_declared_permissions() {
        let runner = ScriptedRunner::new();
        let device = scripted_device(runner.clone());
        let mut app =
            Application::for_installed(device, &manifest(&["android.permission.RECORD_AUDIO"]));

        ApplicationControl::grant_declared_permissions(&mut app).await;

        assert_eq!(
            runner.command_strings(),
            vec![
                "/bin/sh -s emulator-5554 shell pm grant com.example.app \
                 android.permission.RECORD_AUDIO"
                    .to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn clear_data_regrants_previous_permissions() {
        let runner = ScriptedRunner::new();
        let device = scripted_device(runner.clone());
        let mut app =
            Application::for_installed(device, &manifest(&["android.permission.CAMERA"]));
        app.grant_permissions(None).await;

        app.clear_data(true).await.expect("clear");
        let commands = runner.command_strings();
        assert!(commands.iter().any(|c| c.contains("pm clear com.example.app")));
        assert_eq!(
            commands
                .iter()
                .filter(|c| c.contains("pm grant com.example.app android.permission.CAMERA"))
                .count(),
            2,
            "grant before clear plus regrant after: {commands:?}"
        );

        app.clear_data(false).await.expect("clear without regrant");
        assert!(app.granted_permissions().is_empty());
    }

    #[tokio::test]
    async fn pid_parses_the_first_output_line() {
        let runner = ScriptedRunner::new();
        runner.push_stdout("12345\n");
        runner.push_stdout("\n");
        let device = scripted_device(runner);
        let app = Application::for_installed(device, &manifest(&[]));

        assert_eq!(app.pid().await, Some("12345".to_owned()));
        assert_eq!(app.pid().await, None);
    }

    #[tokio::test]
    async fn run_refuses_a_missing_target_application() {
        let runner = ScriptedRunner::new();
        runner.push_stdout("package:com.unrelated\n");
        let device = scripted_device(runner);
        let test_manifest = TestManifest {
            package_name: "com.example.test".to_owned(),
            permissions: Vec::new(),
            runner: "androidx.test.runner.AndroidJUnitRunner".to_owned(),
            target_package: "com.example.app".to_owned(),
        };
        let app = TestApplication::for_installed(device, &test_manifest);

        let result = app.run(&[]).await;
        assert!(matches!(
            result,
            Err(ApplicationError::TargetNotInstalled { .. })
        ));
    }

    #[test]
    fn instrument_command_quotes_arguments_with_spaces() {
        let args = instrument_args(
            "com.example.test",
            "androidx.test.runner.AndroidJUnitRunner",
            &["-e".to_owned(), "class".to_owned(), "com.example.FooTest#a b".to_owned()],
        );
        assert_eq!(
            args,
            vec![
                "shell".to_owned(),
                "am".to_owned(),
                "instrument".to_owned(),
                "-w".to_owned(),
                "-e".to_owned(),
                "class".to_owned(),
                "'com.example.FooTest#a b'".to_owned(),
                "-r".to_owned(),
                "com.example.test/androidx.test.runner.AndroidJUnitRunner".to_owned(),
            ]
        );
    }

    #[test]
    fn test_manifest_deserializes_from_json() {
        let json = r#"{
            "package_name": "com.example.test",
            "runner": "androidx.test.runner.AndroidJUnitRunner",
            "target_package": "com.example.app"
        }"#;
        let parsed: TestManifest = serde_json::from_str(json).expect("valid manifest");
        assert_eq!(parsed.package_name, "com.example.test");
        assert!(parsed.permissions.is_empty());
    }
}
