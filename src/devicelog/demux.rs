//! Fan-out of device log lines to per-tag handlers.
//!
//! The device log is requested in brief format (`D/Tag( 1234): message`)
//! filtered to the registered tags. Each incoming line is classified by its
//! leading tag and handed to the handler registered for that tag; lines that
//! do not match the brief shape, or whose tag has no handler, are ignored.

use std::collections::BTreeMap;

use tracing::debug;

/// Log priorities accepted by the device log filter, lowest to highest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogcatPriority {
    /// Verbose output, the lowest priority.
    Verbose,
    /// Debug output.
    Debug,
    /// Informational output.
    Info,
    /// Warnings.
    Warn,
    /// Errors.
    Error,
    /// Fatal conditions, the highest priority.
    Fatal,
}

impl LogcatPriority {
    /// Returns the single-letter code used in logcat filter specs.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::Verbose => 'V',
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
            Self::Fatal => 'F',
        }
    }
}

/// Receives log lines for a single registered tag.
pub trait LogTagHandler: Send {
    /// Handles one log message emitted under `tag`. `message` is the text
    /// after the brief-format prefix.
    fn handle_line(&mut self, tag: &str, message: &str);
}

struct Registration {
    priority: LogcatPriority,
    handler: Box<dyn LogTagHandler>,
}

/// Routes device log lines to the handler registered for their tag.
#[derive(Default)]
pub struct TagDemultiplexer {
    handlers: BTreeMap<String, Registration>,
}

impl TagDemultiplexer {
    /// Creates an empty demultiplexer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `tag` at the given minimum priority. A second
    /// registration for the same tag replaces the first.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        priority: LogcatPriority,
        handler: Box<dyn LogTagHandler>,
    ) {
        self.handlers
            .insert(tag.into(), Registration { priority, handler });
    }

    /// Returns `true` when no tags are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Builds the logcat argument list selecting brief format and silencing
    /// everything except the registered tags at their priorities.
    #[must_use]
    pub fn logcat_args(&self) -> Vec<String> {
        let mut args = vec!["-v".to_owned(), "brief".to_owned(), "-s".to_owned()];
        args.extend(
            self.handlers
                .iter()
                .map(|(tag, registration)| format!("{tag}:{}", registration.priority.letter())),
        );
        args
    }

    /// Classifies one log line and dispatches it to its tag's handler.
    pub fn demux_line(&mut self, raw_line: &str) {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        let Some((tag, message)) = parse_brief_line(line) else {
            debug!(line, "log line does not match brief format, ignoring");
            return;
        };
        if let Some(registration) = self.handlers.get_mut(tag) {
            registration.handler.handle_line(tag, message);
        } else {
            debug!(tag, "no handler registered for tag, ignoring line");
        }
    }
}

/// Splits a brief-format line into tag and message. Both the pid-carrying
/// form `P/Tag( pid): message` and the pid-less `P/Tag: message` occur in
/// device logs; both are accepted.
fn parse_brief_line(line: &str) -> Option<(&str, &str)> {
    let (_priority, rest) = line.split_once('/')?;
    let colon = rest.find(':')?;
    let has_pid = rest.find('(').is_some_and(|paren| paren < colon);
    let (tag, message) = if has_pid {
        let (tag, after) = rest.split_once('(')?;
        let (_pid, message) = after.split_once("):")?;
        (tag, message)
    } else {
        rest.split_once(':')?
    };
    Some((tag.trim(), message.strip_prefix(' ').unwrap_or(message)))
}
