//! Callback contracts for test execution reporting.
//!
//! Listeners are pure callback interfaces. Multiple listeners may be
//! registered; they are invoked in registration order. All methods default
//! to no-ops so implementations override only the events they care about.

/// Receives decoded test lifecycle events from an instrumentation run.
pub trait TestRunListener: Send {
    /// A test began executing.
    fn test_started(&mut self, class_name: &str, test_name: &str) {
        let _ = (class_name, test_name);
    }

    /// A test failed; `stack_trace` carries the remote stack text.
    fn test_failed(&mut self, class_name: &str, test_name: &str, stack_trace: &str) {
        let _ = (class_name, test_name, stack_trace);
    }

    /// A test was skipped by the runner.
    fn test_ignored(&mut self, class_name: &str, test_name: &str) {
        let _ = (class_name, test_name);
    }

    /// A test aborted because a test assumption did not hold.
    fn test_assumption_failure(&mut self, class_name: &str, test_name: &str, stack_trace: &str) {
        let _ = (class_name, test_name, stack_trace);
    }

    /// A test reached a terminal state; `captured_output` carries any
    /// free-form stream text the runner reported for it.
    fn test_ended(&mut self, class_name: &str, test_name: &str, captured_output: &str) {
        let _ = (class_name, test_name, captured_output);
    }

    /// The run as a whole failed to produce valid, complete results.
    fn test_run_failed(&mut self, message: &str) {
        let _ = message;
    }
}

/// Receives suite-level lifecycle events from the orchestrator.
pub trait TestSuiteListener: Send {
    /// A suite is about to execute. Always precedes any test-started event
    /// for that suite.
    fn test_suite_started(&mut self, suite_name: &str) {
        let _ = suite_name;
    }

    /// The suite failed; `error` is the human-readable cause.
    fn test_suite_failed(&mut self, suite_name: &str, error: &str) {
        let _ = (suite_name, error);
    }

    /// The suite finished. Fires exactly once per suite, after any
    /// suite-failed notification, regardless of outcome.
    fn test_suite_ended(&mut self, suite_name: &str) {
        let _ = suite_name;
    }
}

/// Receives execution-timing notifications as individual tests begin and
/// end, used by the orchestrator to attribute timeouts to a named test.
pub trait TestExecutionListener: Send {
    /// The named test has begun executing.
    fn test_started(&mut self, test_name: &str) {
        let _ = test_name;
    }

    /// The named test has reached a terminal state.
    fn test_ended(&mut self, test_name: &str) {
        let _ = test_name;
    }
}
