//! Scripted orchestrator collaborators for behavioural tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file
//! in `tests/`). Placing shared doubles under `tests/common/` avoids creating
//! an additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/doubles.rs"]
//! mod doubles;
//! ```
//!
//! The launcher double runs real `sh` children so the instrumentation path is
//! exercised end to end: process supervision, the line stream, and the status
//! protocol parser all see genuine pipe traffic.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8Path;
use ruslan::{
    ApplicationControl, ApplicationError, DeviceError, DeviceStorage, InstrumentationLauncher,
    ProcessScope, RemoteProcess, TestRunListener, TestSuiteListener,
};
use tracing_subscriber::EnvFilter;

/// Routes orchestrator tracing output through the test harness so a failing
/// scenario carries its logs. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Shared, ordered record of everything the orchestrator and its
/// collaborators did.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    /// Snapshot of every recorded event, in order.
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Index of the first event starting with `prefix`; panics with the full
    /// event list when no event matches.
    pub fn index_of(&self, prefix: &str) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|event| event.starts_with(prefix))
            .unwrap_or_else(|| panic!("no event starts with '{prefix}', got {events:?}"))
    }

    /// Whether any event starts with `prefix`.
    pub fn contains(&self, prefix: &str) -> bool {
        self.events()
            .iter()
            .any(|event| event.starts_with(prefix))
    }

    /// Number of events starting with `prefix`.
    pub fn count_of(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }

    /// Asserts that each listed prefix matches an event, in the given
    /// relative order.
    pub fn assert_order(&self, prefixes: &[&str]) {
        let mut last = None;
        for prefix in prefixes {
            let index = self.index_of(prefix);
            if let Some((previous_index, previous)) = last {
                assert!(
                    index > previous_index,
                    "'{prefix}' (index {index}) should follow '{previous}' \
                     (index {previous_index}), got {:?}",
                    self.events()
                );
            }
            last = Some((index, *prefix));
        }
    }
}

/// Suite lifecycle listener that records events into the shared log.
pub struct SuiteRecorder {
    log: EventLog,
}

impl SuiteRecorder {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl TestSuiteListener for SuiteRecorder {
    fn test_suite_started(&mut self, suite_name: &str) {
        self.log.record(format!("suite-started:{suite_name}"));
    }

    fn test_suite_failed(&mut self, suite_name: &str, error: &str) {
        self.log.record(format!("suite-failed:{suite_name}:{error}"));
    }

    fn test_suite_ended(&mut self, suite_name: &str) {
        self.log.record(format!("suite-ended:{suite_name}"));
    }
}

/// Test lifecycle listener that records events into the shared log.
pub struct RunRecorder {
    log: EventLog,
}

impl RunRecorder {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl TestRunListener for RunRecorder {
    fn test_started(&mut self, class_name: &str, test_name: &str) {
        self.log
            .record(format!("test-started:{class_name}#{test_name}"));
    }

    fn test_failed(&mut self, class_name: &str, test_name: &str, _stack_trace: &str) {
        self.log
            .record(format!("test-failed:{class_name}#{test_name}"));
    }

    fn test_ignored(&mut self, class_name: &str, test_name: &str) {
        self.log
            .record(format!("test-ignored:{class_name}#{test_name}"));
    }

    fn test_assumption_failure(&mut self, class_name: &str, test_name: &str, _stack_trace: &str) {
        self.log
            .record(format!("test-assumption-failure:{class_name}#{test_name}"));
    }

    fn test_ended(&mut self, class_name: &str, test_name: &str, _captured_output: &str) {
        self.log
            .record(format!("test-ended:{class_name}#{test_name}"));
    }

    fn test_run_failed(&mut self, message: &str) {
        self.log.record(format!("run-failed:{message}"));
    }
}

/// Scripted application control that records invocations and optionally
/// fails data clearing.
pub struct ScriptedApp {
    log: EventLog,
    fail_clear: bool,
}

impl ScriptedApp {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_clear: false,
        }
    }

    #[allow(dead_code, reason = "only the orchestration target drives clear failures")]
    pub fn with_failing_clear(log: EventLog) -> Self {
        Self {
            log,
            fail_clear: true,
        }
    }
}

impl ApplicationControl for ScriptedApp {
    async fn clear_data(&mut self, regrant: bool) -> Result<(), ApplicationError> {
        self.log.record(format!("clear-data:regrant={regrant}"));
        if self.fail_clear {
            return Err(ApplicationError::Device(
                DeviceError::CommandExecutionFailure {
                    device_id: "emulator-5554".to_owned(),
                    command: "shell pm clear com.example.app".to_owned(),
                    return_code: Some(1),
                    stdout: String::new(),
                    stderr: "Failed".to_owned(),
                },
            ));
        }
        Ok(())
    }

    async fn grant_declared_permissions(&mut self) {
        self.log.record("grant-permissions");
    }
}

/// Scripted device storage that records transfers and fails pushes to the
/// configured remote paths.
pub struct ScriptedStorage {
    log: EventLog,
    failing_remotes: Mutex<HashSet<String>>,
}

impl ScriptedStorage {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            failing_remotes: Mutex::new(HashSet::new()),
        }
    }

    #[allow(dead_code, reason = "only the orchestration target drives push failures")]
    pub fn fail_push_to(&self, remote: &str) {
        self.failing_remotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote.to_owned());
    }

    fn fails(&self, remote: &str) -> bool {
        self.failing_remotes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(remote)
    }
}

impl DeviceStorage for ScriptedStorage {
    async fn push(&self, local: &Utf8Path, remote: &str) -> Result<(), DeviceError> {
        self.log.record(format!("push:{local}->{remote}"));
        if self.fails(remote) {
            return Err(DeviceError::CommandExecutionFailure {
                device_id: "emulator-5554".to_owned(),
                command: format!("push {local} {remote}"),
                return_code: Some(1),
                stdout: String::new(),
                stderr: "no space left on device".to_owned(),
            });
        }
        Ok(())
    }

    async fn remove(&self, remote: &str, recursive: bool) -> Result<(), DeviceError> {
        self.log
            .record(format!("remove:{remote}:recursive={recursive}"));
        Ok(())
    }
}

/// Scripted instrumentation launcher backed by real `sh` children. Each
/// launch pops the next queued shell script; an empty queue yields an
/// immediately succeeding run with no output.
pub struct ScriptedLauncher {
    log: EventLog,
    scripts: VecDeque<String>,
}

impl ScriptedLauncher {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            scripts: VecDeque::new(),
        }
    }

    pub fn enqueue_script(&mut self, script: impl Into<String>) {
        self.scripts.push_back(script.into());
    }
}

impl InstrumentationLauncher for ScriptedLauncher {
    async fn launch(&mut self, instrument_args: &[String]) -> Result<ProcessScope, ApplicationError> {
        self.log
            .record(format!("launch:{}", instrument_args.join(" ")));
        let script = self
            .scripts
            .pop_front()
            .unwrap_or_else(|| "exit 0".to_owned());
        let process =
            RemoteProcess::spawn("sh", &["-c", &script]).map_err(ApplicationError::Process)?;
        Ok(ProcessScope::new(process))
    }
}

/// Shell script printing the status protocol stream of one passing test.
pub fn one_passing_test_script(class: &str, test: &str) -> String {
    script_printing(&[
        format!("INSTRUMENTATION_STATUS: class={class}"),
        format!("INSTRUMENTATION_STATUS: test={test}"),
        "INSTRUMENTATION_STATUS: numtests=1".to_owned(),
        "INSTRUMENTATION_STATUS_CODE: 1".to_owned(),
        format!("INSTRUMENTATION_STATUS: class={class}"),
        format!("INSTRUMENTATION_STATUS: test={test}"),
        "INSTRUMENTATION_STATUS: stream=.".to_owned(),
        "INSTRUMENTATION_STATUS_CODE: 0".to_owned(),
        "INSTRUMENTATION_RESULT: stream=OK (1 test)".to_owned(),
        "INSTRUMENTATION_CODE: -1".to_owned(),
        "Time: 0.01".to_owned(),
    ])
}

/// Shell script that announces a test start and then goes silent.
#[allow(dead_code, reason = "only the orchestration target drives hung runs")]
pub fn hanging_test_script(class: &str, test: &str) -> String {
    let mut script = printing_commands(&[
        format!("INSTRUMENTATION_STATUS: class={class}"),
        format!("INSTRUMENTATION_STATUS: test={test}"),
        "INSTRUMENTATION_STATUS: numtests=1".to_owned(),
        "INSTRUMENTATION_STATUS_CODE: 1".to_owned(),
    ]);
    script.push_str("sleep 30");
    script
}

/// Shell script printing the given lines, one per output line.
pub fn script_printing(lines: &[String]) -> String {
    let mut script = printing_commands(lines);
    script.push_str("exit 0");
    script
}

/// One `printf` command per line. The lines must not contain single quotes.
fn printing_commands(lines: &[String]) -> String {
    let mut script = String::new();
    for line in lines {
        assert!(!line.contains('\''), "unquotable script line: {line}");
        script.push_str("printf '%s\\n' '");
        script.push_str(line);
        script.push_str("'; ");
    }
    script
}
