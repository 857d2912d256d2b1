//! Decoder for the instrumentation raw-output status protocol.
//!
//! The remote test runner reports progress as a sequential stream of
//! key=value "status bundles", each terminated by a status-code line. This
//! module turns that stream into discrete test lifecycle callbacks on
//! registered [`TestRunListener`]s. The protocol is strictly sequential: at
//! most one test result is in flight at any time.

use std::time::Duration;

use tracing::{debug, warn};

use crate::listener::{TestExecutionListener, TestRunListener};

/// Prefix of a per-test key=value status line.
pub const PREFIX_STATUS: &str = "INSTRUMENTATION_STATUS: ";
/// Prefix of the line that finalizes a status bundle with a code.
pub const PREFIX_STATUS_CODE: &str = "INSTRUMENTATION_STATUS_CODE: ";
/// Prefix of a run-level (not per-test) key=value line.
pub const PREFIX_RESULT: &str = "INSTRUMENTATION_RESULT: ";
/// Prefix reported when the instrumentation itself failed to run.
pub const PREFIX_FAILED: &str = "INSTRUMENTATION_FAILED: ";
/// Prefix of the final run code, marking the run as finished.
pub const PREFIX_FINAL_CODE: &str = "INSTRUMENTATION_CODE: ";
/// Prefix of the elapsed-time telemetry line.
pub const PREFIX_TIME: &str = "Time: ";
/// Banner emitted by the runner when the run had failures.
pub const FAILURE_BANNER: &str = "FAILURES!!!";

const KEY_TEST: &str = "test";
const KEY_CLASS: &str = "class";
const KEY_NUMTESTS: &str = "numtests";
const KEY_STACK: &str = "stack";
const KEY_STREAM: &str = "stream";
const KEY_SHORT_MESSAGE: &str = "shortMsg";

/// Message reported when the stream produced no results at all.
pub const MSG_NO_RESULTS: &str = "No test results, instrumentation may have failed";
const MSG_INCOMPLETE_TEST: &str = "Test failed to run to completion; stream ended mid-test";

/// Status codes carried by `INSTRUMENTATION_STATUS_CODE` lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusCode {
    /// A test began executing (1).
    Start,
    /// Intermediate progress for the current test (2).
    InProgress,
    /// The test passed (0).
    Pass,
    /// The test ended with an unexpected error (-1); also the mapping for
    /// any unrecognized code.
    Error,
    /// The test failed an assertion (-2).
    Fail,
    /// The test was skipped (-3).
    Skipped,
    /// A test assumption did not hold (-4).
    AssumptionViolation,
}

impl StatusCode {
    /// Maps a raw protocol integer to a status code; unknown values are
    /// treated as [`StatusCode::Error`].
    #[must_use]
    pub const fn from_raw(value: i32) -> Self {
        match value {
            1 => Self::Start,
            2 => Self::InProgress,
            0 => Self::Pass,
            -2 => Self::Fail,
            -3 => Self::Skipped,
            -4 => Self::AssumptionViolation,
            _ => Self::Error,
        }
    }

    /// Returns `true` for codes that end the in-flight test.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Start | Self::InProgress)
    }
}

/// Accumulated state of the test result currently being parsed.
///
/// Created when a new status bundle begins, mutated as key/value lines
/// arrive, and complete only once code, test name, and class are all set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestParsingResult {
    /// Status code reported for this bundle.
    pub code: Option<StatusCode>,
    /// Fully qualified class owning the test.
    pub class_name: Option<String>,
    /// Name of the individual test.
    pub test_name: Option<String>,
    /// Total test count declared for the run, when present.
    pub num_tests: Option<u32>,
    /// Stack trace text, possibly spanning multiple lines.
    pub stack_trace: Option<String>,
    /// Free-form stream text reported for the test.
    pub stream: Option<String>,
}

impl TestParsingResult {
    /// Returns `true` once code, test name, and class are all present.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.code.is_some() && self.class_name.is_some() && self.test_name.is_some()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ParserState {
    Idle,
    InKeyValue,
    InResultKeyValue,
}

/// State machine decoding the instrumentation status stream into lifecycle
/// callbacks.
///
/// Listeners are invoked in registration order. Malformed lines are logged
/// and skipped; parse problems are never fatal to the run.
pub struct StatusProtocolParser<'a> {
    listeners: &'a mut [Box<dyn TestRunListener>],
    execution_listener: Option<&'a mut dyn TestExecutionListener>,
    state: ParserState,
    current_key: Option<String>,
    current_value: String,
    current: TestParsingResult,
    started: Option<(String, String)>,
    expected_count: Option<u32>,
    completed_count: u32,
    results_reported: bool,
    saw_terminal_marker: bool,
    saw_failure_banner: bool,
    reported_run_failed: bool,
    closed: bool,
    elapsed: Option<Duration>,
}

impl<'a> StatusProtocolParser<'a> {
    /// Creates a parser reporting to the given listeners.
    #[must_use]
    pub fn new(listeners: &'a mut [Box<dyn TestRunListener>]) -> Self {
        Self {
            listeners,
            execution_listener: None,
            state: ParserState::Idle,
            current_key: None,
            current_value: String::new(),
            current: TestParsingResult::default(),
            started: None,
            expected_count: None,
            completed_count: 0,
            results_reported: false,
            saw_terminal_marker: false,
            saw_failure_banner: false,
            reported_run_failed: false,
            closed: false,
            elapsed: None,
        }
    }

    /// Creates a parser that additionally notifies an execution-timing
    /// listener as named tests begin and end.
    #[must_use]
    pub fn with_execution_listener(
        listeners: &'a mut [Box<dyn TestRunListener>],
        execution_listener: &'a mut dyn TestExecutionListener,
    ) -> Self {
        let mut parser = Self::new(listeners);
        parser.execution_listener = Some(execution_listener);
        parser
    }

    /// Returns the declared total test count, once seen.
    #[must_use]
    pub const fn expected_test_count(&self) -> Option<u32> {
        self.expected_count
    }

    /// Returns the number of tests that reached a terminal state.
    #[must_use]
    pub const fn completed_test_count(&self) -> u32 {
        self.completed_count
    }

    /// Returns the elapsed run duration reported by the runner, if any.
    #[must_use]
    pub const fn elapsed_time(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Returns the qualified name of the test currently in flight: started
    /// but not yet reported terminal.
    #[must_use]
    pub fn in_flight_test(&self) -> Option<String> {
        self.started
            .as_ref()
            .map(|(class_name, test_name)| qualified_name(class_name, test_name))
    }

    /// Feeds one raw output line into the state machine.
    pub fn parse_line(&mut self, raw_line: &str) {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix(PREFIX_STATUS) {
            self.finalize_current_pair();
            self.state = ParserState::InKeyValue;
            self.begin_key_value(rest);
        } else if let Some(rest) = line.strip_prefix(PREFIX_STATUS_CODE) {
            self.finalize_current_pair();
            self.state = ParserState::InKeyValue;
            self.handle_status_code(rest);
        } else if let Some(rest) = line.strip_prefix(PREFIX_RESULT) {
            self.finalize_current_pair();
            self.state = ParserState::InResultKeyValue;
            self.begin_key_value(rest);
        } else if line.starts_with(PREFIX_FAILED) || line.starts_with(PREFIX_FINAL_CODE) {
            self.finalize_current_pair();
            self.saw_terminal_marker = true;
        } else if let Some(rest) = line.strip_prefix(PREFIX_TIME) {
            self.record_elapsed(rest);
        } else {
            if line.starts_with(FAILURE_BANNER) {
                self.saw_failure_banner = true;
            }
            if line.is_empty() {
                // Blank lines inside a multi-line value are part of it.
                if self.current_key.is_some() {
                    self.current_value.push('\n');
                }
            } else if self.current_key.is_some() {
                self.current_value.push('\n');
                self.current_value.push_str(line);
            } else {
                debug!(line, "ignoring unrecognized instrumentation output line");
            }
        }
    }

    /// Closes the stream, performing the close-time validation pass. Safe to
    /// call more than once; run-level failure is reported at most once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.finalize_current_pair();

        if let Some((class_name, test_name)) = self.started.take() {
            // Stream ended mid-test: synthesize a failure so the
            // started/ended pairing holds for listeners.
            for listener in self.listeners.iter_mut() {
                listener.test_failed(&class_name, &test_name, MSG_INCOMPLETE_TEST);
                listener.test_ended(&class_name, &test_name, "");
            }
            if let Some(timing) = self.execution_listener.as_deref_mut() {
                timing.test_ended(&qualified_name(&class_name, &test_name));
            }
            self.completed_count += 1;
            self.results_reported = true;
            self.report_run_failed(&format!(
                "Test run failed to complete; last started test was {}",
                qualified_name(&class_name, &test_name)
            ));
        } else if !self.results_reported
            && (!self.saw_terminal_marker || self.saw_failure_banner)
        {
            self.report_run_failed(MSG_NO_RESULTS);
        }

        if let Some(expected) = self.expected_count {
            if self.completed_count < expected {
                let completed = self.completed_count;
                self.report_run_failed(&format!(
                    "Test run incomplete. Expected {expected} tests, received {completed}"
                ));
            }
        }
    }

    fn begin_key_value(&mut self, rest: &str) {
        match rest.split_once('=') {
            Some((key, value)) => {
                self.current_key = Some(key.to_owned());
                self.current_value = value.to_owned();
            }
            None => warn!(line = rest, "malformed instrumentation status line, skipping"),
        }
    }

    fn finalize_current_pair(&mut self) {
        let Some(key) = self.current_key.take() else {
            return;
        };
        let value = std::mem::take(&mut self.current_value);
        match self.state {
            ParserState::InKeyValue => self.assign_test_pair(&key, value),
            ParserState::InResultKeyValue => {
                if key == KEY_SHORT_MESSAGE {
                    let message = format!("Instrumentation run failed: {value}");
                    self.report_run_failure_for_current(&message);
                } else {
                    debug!(key, "ignoring run-level instrumentation key");
                }
            }
            ParserState::Idle => debug!(key, "discarding key/value outside of any bundle"),
        }
    }

    fn assign_test_pair(&mut self, key: &str, value: String) {
        match key {
            KEY_TEST => self.current.test_name = Some(value),
            KEY_CLASS => self.current.class_name = Some(value),
            KEY_NUMTESTS => match value.trim().parse::<u32>() {
                Ok(count) => self.current.num_tests = Some(count),
                Err(_) => warn!(value, "unparsable declared test count"),
            },
            KEY_STACK => self.current.stack_trace = Some(value),
            KEY_STREAM => self.current.stream = Some(value),
            _ => debug!(key, "ignoring unrecognized status key"),
        }
    }

    fn handle_status_code(&mut self, rest: &str) {
        let Ok(raw) = rest.trim().parse::<i32>() else {
            warn!(line = rest, "unparsable instrumentation status code");
            return;
        };
        let code = StatusCode::from_raw(raw);
        self.current.code = Some(code);
        if code == StatusCode::InProgress {
            return;
        }
        self.finalize_result(code);
    }

    fn finalize_result(&mut self, code: StatusCode) {
        let result = std::mem::take(&mut self.current);
        if self.expected_count.is_none() {
            self.expected_count = result.num_tests;
        }
        let (Some(class_name), Some(test_name)) = (result.class_name, result.test_name) else {
            warn!(?code, "status bundle finished without test identification");
            return;
        };

        if code == StatusCode::Start {
            for listener in self.listeners.iter_mut() {
                listener.test_started(&class_name, &test_name);
            }
            if let Some(timing) = self.execution_listener.as_deref_mut() {
                timing.test_started(&qualified_name(&class_name, &test_name));
            }
            self.started = Some((class_name, test_name));
            return;
        }

        // Terminal code. A bundle may arrive without a preceding start
        // (runners report skips that way); preserve the pairing contract.
        let was_started = self
            .started
            .as_ref()
            .is_some_and(|(c, t)| *c == class_name && *t == test_name);
        if !was_started {
            for listener in self.listeners.iter_mut() {
                listener.test_started(&class_name, &test_name);
            }
            if let Some(timing) = self.execution_listener.as_deref_mut() {
                timing.test_started(&qualified_name(&class_name, &test_name));
            }
        }

        let stack = result.stack_trace.as_deref().unwrap_or("");
        match code {
            StatusCode::Fail | StatusCode::Error => {
                for listener in self.listeners.iter_mut() {
                    listener.test_failed(&class_name, &test_name, stack);
                }
            }
            StatusCode::Skipped => {
                for listener in self.listeners.iter_mut() {
                    listener.test_ignored(&class_name, &test_name);
                }
            }
            StatusCode::AssumptionViolation => {
                for listener in self.listeners.iter_mut() {
                    listener.test_assumption_failure(&class_name, &test_name, stack);
                }
            }
            StatusCode::Pass | StatusCode::Start | StatusCode::InProgress => {}
        }
        let stream = result.stream.as_deref().unwrap_or("");
        for listener in self.listeners.iter_mut() {
            listener.test_ended(&class_name, &test_name, stream);
        }
        if let Some(timing) = self.execution_listener.as_deref_mut() {
            timing.test_ended(&qualified_name(&class_name, &test_name));
        }
        self.started = None;
        self.completed_count += 1;
        self.results_reported = true;
    }

    fn report_run_failure_for_current(&mut self, message: &str) {
        if let Some((class_name, test_name)) = self.started.take() {
            for listener in self.listeners.iter_mut() {
                listener.test_failed(&class_name, &test_name, message);
                listener.test_ended(&class_name, &test_name, "");
            }
            if let Some(timing) = self.execution_listener.as_deref_mut() {
                timing.test_ended(&qualified_name(&class_name, &test_name));
            }
            self.completed_count += 1;
            self.results_reported = true;
        }
        self.report_run_failed(message);
    }

    fn report_run_failed(&mut self, message: &str) {
        if self.reported_run_failed {
            return;
        }
        self.reported_run_failed = true;
        for listener in self.listeners.iter_mut() {
            listener.test_run_failed(message);
        }
    }

    fn record_elapsed(&mut self, rest: &str) {
        match rest.trim().trim_end_matches(',').parse::<f64>() {
            Ok(seconds) if seconds >= 0.0 => {
                self.elapsed = Duration::try_from_secs_f64(seconds).ok();
            }
            _ => warn!(line = rest, "unparsable elapsed-time line"),
        }
    }
}

fn qualified_name(class_name: &str, test_name: &str) -> String {
    format!("{class_name}#{test_name}")
}
