//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{CommandOutput, CommandRunner, DeviceError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic device command outcomes without spawning
/// processes. With no queued response, every command succeeds with empty
/// output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }

    /// Returns the recorded invocations as shell-like command strings.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Queues a successful empty response.
    pub fn push_success(&self) {
        self.push_response(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    /// Queues a successful response carrying stdout text.
    pub fn push_stdout(&self, stdout: &str) {
        self.push_response(CommandOutput {
            code: Some(0),
            stdout: stdout.to_owned(),
            stderr: String::new(),
        });
    }

    /// Queues a failing response with the given exit code and stderr text.
    pub fn push_failure(&self, code: i32, stderr: &str) {
        self.push_response(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_owned(),
        });
    }

    /// Queues an arbitrary response.
    pub fn push_response(&self, output: CommandOutput) {
        self.lock().responses.push_back(output);
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeviceError> {
        let mut state = self.lock();
        state.invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        Ok(state.responses.pop_front().unwrap_or_else(|| CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}
