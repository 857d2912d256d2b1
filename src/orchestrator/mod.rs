//! Top-level test orchestration across suites.
//!
//! The [`Orchestrator`] drives a sequence of [`TestSuiteDescriptor`]s:
//! per-suite preparation (data clear, artifact upload), the instrumentation
//! run feeding a fresh status parser, per-test and whole-plan time budgets,
//! and guaranteed per-suite and final teardown. A failing suite never stops
//! later suites; only the plan-level time budget aborts the remaining plan,
//! and even that unwinds through the same teardown path.

use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::{ApplicationControl, ApplicationError, TestApplication};
use crate::device::CommandRunner;
use crate::device::process::{ProcessError, ProcessScope, RemoteProcess, SCOPE_STOP_TIMEOUT};
use crate::devicelog::demux::TagDemultiplexer;
use crate::devicelog::{CaptureError, LogCapture};
use crate::listener::{TestExecutionListener, TestRunListener, TestSuiteListener};
use crate::parser::StatusProtocolParser;
use crate::storage::DeviceStorage;

/// One (local, remote) file pair uploaded before a suite and removed after.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct UploadArtifact {
    /// Local file or directory to upload.
    pub local: Utf8PathBuf,
    /// Remote path to upload to, and later remove.
    pub remote: String,
    /// Whether removal needs to recurse (the artifact is a directory).
    #[serde(default)]
    pub directory: bool,
}

/// Description of one instrumentation suite to execute.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct TestSuiteDescriptor {
    /// Suite name, used for listener notifications and log markers.
    pub name: String,
    /// Extra arguments appended to the instrument command.
    #[serde(default)]
    pub instrument_args: Vec<String>,
    /// Ordered `-e key value` test parameters.
    #[serde(default)]
    pub test_parameters: Vec<(String, String)>,
    /// Artifacts uploaded before the suite runs.
    #[serde(default)]
    pub uploads: Vec<UploadArtifact>,
    /// Whether on-device application state is cleared before the suite.
    #[serde(default)]
    pub clean_data_on_start: bool,
}

impl TestSuiteDescriptor {
    /// Builds the instrument argument list for this suite: the ordered test
    /// parameters first, then the free-form arguments.
    #[must_use]
    pub fn instrument_arguments(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.test_parameters.len() * 3 + self.instrument_args.len());
        for (key, value) in &self.test_parameters {
            args.push("-e".to_owned());
            args.push(key.clone());
            args.push(value.clone());
        }
        args.extend(self.instrument_args.iter().cloned());
        args
    }
}

/// Errors raised while loading a suite plan.
#[derive(Debug, Error)]
pub enum PlanLoadError {
    /// The plan file could not be read.
    #[error("failed to read suite plan: {0}")]
    Io(#[from] std::io::Error),
    /// The plan content is not valid.
    #[error("failed to parse suite plan: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parses a JSON array of suite descriptors.
///
/// # Errors
///
/// Returns [`PlanLoadError::Parse`] on malformed content.
pub fn plan_from_json(text: &str) -> Result<Vec<TestSuiteDescriptor>, PlanLoadError> {
    Ok(serde_json::from_str(text)?)
}

/// Loads a suite plan from a JSON file.
///
/// # Errors
///
/// Returns [`PlanLoadError::Io`] when the file cannot be read, or
/// [`PlanLoadError::Parse`] on malformed content.
pub async fn plan_from_file(path: &Utf8Path) -> Result<Vec<TestSuiteDescriptor>, PlanLoadError> {
    let text = tokio::fs::read_to_string(path.as_std_path()).await?;
    plan_from_json(&text)
}

/// Errors raised by orchestration itself (suite failures are reported to
/// listeners instead).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The whole suite plan exceeded its overall time budget. The remaining
    /// plan is aborted; teardown has already run.
    #[error("suite plan exceeded its overall time budget of {budget:?}")]
    SuitePlanTimeout {
        /// The budget that elapsed.
        budget: Duration,
    },
    /// Final log capture teardown failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The orchestrator configuration is unusable.
    #[error("invalid orchestrator configuration: {reason}")]
    InvalidConfig {
        /// Human-readable description of the problem.
        reason: String,
    },
}

/// Time budgets and artifact paths for an orchestration run.
#[derive(Clone, Debug, Default)]
pub struct OrchestratorConfig {
    test_timeout: Option<Duration>,
    plan_timeout: Option<Duration>,
    marker_table_path: Option<Utf8PathBuf>,
}

impl OrchestratorConfig {
    /// Starts building a configuration.
    #[must_use]
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Returns the per-test output timeout, if configured.
    #[must_use]
    pub const fn test_timeout(&self) -> Option<Duration> {
        self.test_timeout
    }

    /// Returns the overall suite-plan budget, if configured.
    #[must_use]
    pub const fn plan_timeout(&self) -> Option<Duration> {
        self.plan_timeout
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Clone, Debug, Default)]
pub struct OrchestratorConfigBuilder {
    test_timeout: Option<Duration>,
    plan_timeout: Option<Duration>,
    marker_table_path: Option<Utf8PathBuf>,
}

impl OrchestratorConfigBuilder {
    /// Sets the window within which each single test must produce output.
    #[must_use]
    pub const fn test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = Some(timeout);
        self
    }

    /// Sets the overall budget for the whole suite plan.
    #[must_use]
    pub const fn plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = Some(timeout);
        self
    }

    /// Sets where the line-justified marker table is written after the run.
    /// Defaults to the capture sink path with a `.markers` suffix.
    #[must_use]
    pub fn marker_table_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.marker_table_path = Some(path.into());
        self
    }

    /// Validates and produces the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConfig`] for zero time budgets.
    pub fn build(self) -> Result<OrchestratorConfig, OrchestratorError> {
        if self.test_timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::InvalidConfig {
                reason: "per-test timeout must be non-zero".to_owned(),
            });
        }
        if self.plan_timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::InvalidConfig {
                reason: "suite plan timeout must be non-zero".to_owned(),
            });
        }
        Ok(OrchestratorConfig {
            test_timeout: self.test_timeout,
            plan_timeout: self.plan_timeout,
            marker_table_path: self.marker_table_path,
        })
    }
}

/// Launches instrumentation runs; implemented by [`TestApplication`] and
/// scripted in tests.
pub trait InstrumentationLauncher: Send {
    /// Starts the remote instrumentation with the given instrument
    /// arguments, returning the scope owning the run.
    fn launch(
        &mut self,
        instrument_args: &[String],
    ) -> impl Future<Output = Result<ProcessScope, ApplicationError>> + Send;
}

impl<R: CommandRunner> InstrumentationLauncher for TestApplication<R> {
    async fn launch(&mut self, instrument_args: &[String]) -> Result<ProcessScope, ApplicationError> {
        self.run(instrument_args).await
    }
}

/// Tracks which named test is currently executing so timeouts can be
/// attributed to it.
#[derive(Debug, Default)]
pub struct TestTimer {
    current: Option<String>,
}

impl TestTimer {
    /// Returns the qualified name of the in-flight test, if any.
    #[must_use]
    pub fn current_test(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl TestExecutionListener for TestTimer {
    fn test_started(&mut self, test_name: &str) {
        self.current = Some(test_name.to_owned());
    }

    fn test_ended(&mut self, _test_name: &str) {
        self.current = None;
    }
}

#[derive(Clone, Copy, Debug)]
struct PlanDeadline {
    at: tokio::time::Instant,
    budget: Duration,
}

enum SuiteFailure {
    Failed(String),
    PlanTimeout(Duration),
}

/// Bounds a suspension point by the remaining plan budget.
async fn bounded<F: Future>(
    deadline: Option<PlanDeadline>,
    future: F,
) -> Result<F::Output, SuiteFailure> {
    match deadline {
        Some(plan) => tokio::time::timeout_at(plan.at, future)
            .await
            .map_err(|_| SuiteFailure::PlanTimeout(plan.budget)),
        None => Ok(future.await),
    }
}

struct TagMonitor {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

fn spawn_tag_monitor(mut process: RemoteProcess, mut demux: TagDemultiplexer) -> TagMonitor {
    let (stop, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    if let Err(err) = process.stop(false, Some(SCOPE_STOP_TIMEOUT)).await {
                        debug!(error = %err, "graceful stop of tag monitor incomplete, forcing kill");
                        if let Err(kill_err) = process.stop(true, Some(SCOPE_STOP_TIMEOUT)).await {
                            error!(error = %kill_err, "failed to kill tag monitor process");
                        }
                    }
                    return;
                }
                next = process.next_line(None) => match next {
                    Ok(Some(line)) => demux.demux_line(&line),
                    Ok(None) => return,
                    Err(err) => {
                        debug!(error = %err, "tag monitor stream failed");
                        return;
                    }
                },
            }
        }
    });
    TagMonitor { stop, task }
}

/// Drives test suites to completion against one device.
pub struct Orchestrator<A, S, L>
where
    A: ApplicationControl,
    S: DeviceStorage,
    L: InstrumentationLauncher,
{
    config: OrchestratorConfig,
    app: A,
    storage: S,
    launcher: L,
    run_listeners: Vec<Box<dyn TestRunListener>>,
    suite_listeners: Vec<Box<dyn TestSuiteListener>>,
    log_capture: Option<LogCapture>,
    tag_monitor: Option<(RemoteProcess, TagDemultiplexer)>,
    background: Vec<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,
}

impl<A, S, L> Orchestrator<A, S, L>
where
    A: ApplicationControl,
    S: DeviceStorage,
    L: InstrumentationLauncher,
{
    /// Creates an orchestrator over the given collaborators.
    pub fn new(config: OrchestratorConfig, app: A, storage: S, launcher: L) -> Self {
        Self {
            config,
            app,
            storage,
            launcher,
            run_listeners: Vec::new(),
            suite_listeners: Vec::new(),
            log_capture: None,
            tag_monitor: None,
            background: Vec::new(),
        }
    }

    /// Registers a test lifecycle listener; listeners are notified in
    /// registration order.
    pub fn add_run_listener(&mut self, listener: Box<dyn TestRunListener>) {
        self.run_listeners.push(listener);
    }

    /// Registers a suite lifecycle listener.
    pub fn add_suite_listener(&mut self, listener: Box<dyn TestSuiteListener>) {
        self.suite_listeners.push(listener);
    }

    /// Attaches an open log capture session. The orchestrator marks each
    /// suite's span in it and closes it, writing the marker table, during
    /// final teardown.
    pub fn attach_log_capture(&mut self, capture: LogCapture) {
        self.log_capture = Some(capture);
    }

    /// Attaches a device-log process whose lines are fanned out to the
    /// demultiplexer's tag handlers for the duration of the run.
    pub fn attach_tag_monitor(&mut self, process: RemoteProcess, demux: TagDemultiplexer) {
        self.tag_monitor = Some((process, demux));
    }

    /// Registers a background task started with suite execution and
    /// cancelled, not awaited, when execution completes.
    pub fn add_background_task(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.background.push(Box::pin(task));
    }

    /// Executes every suite in order and performs final teardown.
    ///
    /// A failing suite is reported to suite listeners and does not stop
    /// later suites.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::SuitePlanTimeout`] when the overall
    /// budget elapses (the remaining plan is abandoned), or
    /// [`OrchestratorError::Capture`] when closing the log capture fails.
    pub async fn execute(
        &mut self,
        suites: impl IntoIterator<Item = TestSuiteDescriptor>,
    ) -> Result<(), OrchestratorError> {
        let deadline = self.config.plan_timeout.map(|budget| PlanDeadline {
            at: tokio::time::Instant::now() + budget,
            budget,
        });
        let background: Vec<JoinHandle<()>> =
            self.background.drain(..).map(tokio::spawn).collect();
        let tag_monitor = self
            .tag_monitor
            .take()
            .map(|(process, demux)| spawn_tag_monitor(process, demux));

        let result = self.run_suites(suites, deadline).await;

        for task in background {
            task.abort();
        }
        if let Some(monitor) = tag_monitor {
            if monitor.stop.send(()).is_err() {
                debug!("tag monitor already finished");
            }
            if let Err(err) = monitor.task.await {
                debug!(error = %err, "tag monitor task ended abnormally");
            }
        }
        let teardown = self.final_teardown().await;
        result.and(teardown)
    }

    async fn run_suites(
        &mut self,
        suites: impl IntoIterator<Item = TestSuiteDescriptor>,
        deadline: Option<PlanDeadline>,
    ) -> Result<(), OrchestratorError> {
        for suite in suites {
            self.run_suite(&suite, deadline).await?;
        }
        Ok(())
    }

    /// Runs one suite with its guaranteed teardown: suite-ended always
    /// fires after any suite-failed, and artifact removal is attempted for
    /// every declared upload on every path.
    async fn run_suite(
        &mut self,
        suite: &TestSuiteDescriptor,
        deadline: Option<PlanDeadline>,
    ) -> Result<(), OrchestratorError> {
        info!(suite = %suite.name, "starting test suite");
        self.mark_capture(&suite.name, true).await;
        let outcome = self.drive_suite(suite, deadline).await;

        let mut plan_timeout = None;
        if let Err(failure) = outcome {
            let message = match failure {
                SuiteFailure::Failed(message) => message,
                SuiteFailure::PlanTimeout(budget) => {
                    plan_timeout = Some(budget);
                    format!("suite plan time budget of {budget:?} exceeded")
                }
            };
            error!(suite = %suite.name, error = %message, "test suite failed");
            for listener in &mut self.suite_listeners {
                listener.test_suite_failed(&suite.name, &message);
            }
        }
        for listener in &mut self.suite_listeners {
            listener.test_suite_ended(&suite.name);
        }
        self.remove_artifacts(suite).await;
        self.mark_capture(&suite.name, false).await;

        match plan_timeout {
            Some(budget) => Err(OrchestratorError::SuitePlanTimeout { budget }),
            None => Ok(()),
        }
    }

    async fn drive_suite(
        &mut self,
        suite: &TestSuiteDescriptor,
        deadline: Option<PlanDeadline>,
    ) -> Result<(), SuiteFailure> {
        let prepared = if suite.clean_data_on_start {
            self.clear_application_data(deadline).await
        } else {
            Ok(())
        };
        // Suite-started fires even when preparation failed, so listeners
        // always see a started/ended pair.
        for listener in &mut self.suite_listeners {
            listener.test_suite_started(&suite.name);
        }
        prepared?;
        self.upload_artifacts(suite, deadline).await?;
        self.run_instrumentation(suite, deadline).await
    }

    async fn clear_application_data(
        &mut self,
        deadline: Option<PlanDeadline>,
    ) -> Result<(), SuiteFailure> {
        bounded(deadline, self.app.clear_data(true))
            .await?
            .map_err(|err| SuiteFailure::Failed(format!("failed to clear application data: {err}")))
    }

    async fn upload_artifacts(
        &mut self,
        suite: &TestSuiteDescriptor,
        deadline: Option<PlanDeadline>,
    ) -> Result<(), SuiteFailure> {
        for artifact in &suite.uploads {
            bounded(deadline, self.storage.push(&artifact.local, &artifact.remote))
                .await?
                .map_err(|err| {
                    SuiteFailure::Failed(format!(
                        "failed to upload '{}' to '{}': {err}",
                        artifact.local, artifact.remote
                    ))
                })?;
        }
        Ok(())
    }

    async fn run_instrumentation(
        &mut self,
        suite: &TestSuiteDescriptor,
        deadline: Option<PlanDeadline>,
    ) -> Result<(), SuiteFailure> {
        let args = suite.instrument_arguments();
        let mut scope = bounded(deadline, self.launcher.launch(&args))
            .await?
            .map_err(|err| {
                SuiteFailure::Failed(format!("failed to launch instrumentation: {err}"))
            })?;

        let mut timer = TestTimer::default();
        let mut parser =
            StatusProtocolParser::with_execution_listener(&mut self.run_listeners, &mut timer);
        let test_timeout = self.config.test_timeout;
        let streamed = loop {
            match bounded(deadline, scope.process().next_line(test_timeout)).await {
                Ok(Ok(Some(line))) => parser.parse_line(&line),
                Ok(Ok(None)) => break Ok(()),
                Ok(Err(ProcessError::Unresponsive { timeout })) => {
                    // The remote process is shared by every test in the
                    // suite, so one unresponsive test ends the whole run.
                    let subject = parser.in_flight_test().map_or_else(
                        || "instrumentation".to_owned(),
                        |test| format!("test {test}"),
                    );
                    break Err(SuiteFailure::Failed(format!(
                        "{subject} produced no output within {timeout:?}, stopping suite"
                    )));
                }
                Ok(Err(err)) => {
                    break Err(SuiteFailure::Failed(format!(
                        "instrumentation stream failed: {err}"
                    )));
                }
                Err(plan_elapsed) => break Err(plan_elapsed),
            }
        };
        parser.close();
        drop(parser);

        let pending_error = streamed.is_err();
        let exited = scope.exit(pending_error).await;
        match (streamed, exited) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) => Err(SuiteFailure::Failed(format!(
                "instrumentation run failed: {err}"
            ))),
            (Err(SuiteFailure::Failed(message)), Err(err)) => Err(SuiteFailure::Failed(
                format!("{message}; instrumentation run failed: {err}"),
            )),
            (Err(failure), Err(err)) => {
                warn!(error = %err, "instrumentation run failure during plan budget unwind");
                Err(failure)
            }
            (Err(failure), Ok(())) => Err(failure),
        }
    }

    /// Removal is attempted for every declared artifact; failures are
    /// logged, never raised.
    async fn remove_artifacts(&mut self, suite: &TestSuiteDescriptor) {
        for artifact in &suite.uploads {
            if let Err(err) = self.storage.remove(&artifact.remote, artifact.directory).await {
                error!(
                    remote = %artifact.remote,
                    error = %err,
                    "failed to remove uploaded artifact"
                );
            }
        }
    }

    async fn mark_capture(&self, name: &str, start: bool) {
        let Some(capture) = &self.log_capture else {
            return;
        };
        let marked = if start {
            capture.mark_start(name).await
        } else {
            capture.mark_end(name).await
        };
        if let Err(err) = marked {
            warn!(suite = name, error = %err, "failed to mark device log capture");
        }
    }

    async fn final_teardown(&mut self) -> Result<(), OrchestratorError> {
        let Some(mut capture) = self.log_capture.take() else {
            return Ok(());
        };
        let result = capture.close().await?;
        let table_path = self.config.marker_table_path.clone().unwrap_or_else(|| {
            Utf8PathBuf::from(format!("{}.markers", result.sink_path()))
        });
        result.write_marker_table(&table_path).await?;
        info!(table = %table_path, "wrote device log marker table");
        Ok(())
    }
}
