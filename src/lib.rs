//! Core library for the Ruslan instrumentation test orchestrator.
//!
//! The crate drives instrumentation test suites on a remotely connected
//! Android device: it spawns and supervises remote processes, decodes the
//! instrumentation status protocol into test lifecycle events, captures the
//! device log with consistent position markers, and orchestrates per-suite
//! setup, time budgets, and guaranteed teardown.

pub mod application;
pub mod device;
pub mod devicelog;
pub mod listener;
pub mod orchestrator;
pub mod parser;
pub mod storage;
pub mod test_support;

pub use application::{
    Application, ApplicationControl, ApplicationError, ApplicationManifest, DANGEROUS_PERMISSIONS,
    TestApplication, TestManifest,
};
pub use device::process::{ProcessError, ProcessScope, RemoteProcess, SCOPE_STOP_TIMEOUT};
pub use device::{
    CommandOutput, CommandRunner, Device, DeviceError, ProcessCommandRunner, TIMEOUT_ADB_CMD,
    TIMEOUT_LONG_ADB_CMD,
};
pub use devicelog::demux::{LogTagHandler, LogcatPriority, TagDemultiplexer};
pub use devicelog::{CaptureError, CaptureResult, DeviceLog, LogCapture};
pub use listener::{TestExecutionListener, TestRunListener, TestSuiteListener};
pub use orchestrator::{
    InstrumentationLauncher, Orchestrator, OrchestratorConfig, OrchestratorConfigBuilder,
    OrchestratorError, PlanLoadError, TestSuiteDescriptor, TestTimer, UploadArtifact,
    plan_from_file, plan_from_json,
};
pub use parser::{StatusCode, StatusProtocolParser, TestParsingResult};
pub use storage::{AdbDeviceStorage, DeviceStorage};
