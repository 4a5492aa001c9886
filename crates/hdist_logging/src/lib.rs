//! Build logging with named sub-loggers and raw stream capture.
//!
//! The job runner multiplexes subprocess output and log-pipe FIFOs into a
//! single [`Logger`]. A logger carries a heading (a chain of sub-logger
//! names), filters formatted output by severity, and fans records out to a
//! shared set of sinks: the `tracing` subscriber for terminal output, raw
//! streams (used to tee a build's entire output into `build.log`), and
//! in-memory capture buffers for tests.
//!
//! There is one logger per orchestrator; it is passed by reference through
//! the call graph rather than stored globally. Sub-loggers share the parent's
//! sinks, so a stream pushed on any of them is seen by all.

#![warn(missing_docs)]

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Development chatter; hidden by default.
    Debug,
    /// Normal progress reporting.
    Info,
    /// Something suspicious but not fatal.
    Warning,
    /// A failure; latches the logger's error flag.
    Error,
    /// An unrecoverable failure.
    Critical,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Error parsing a level name.
#[derive(Debug, thiserror::Error)]
#[error("unknown log level \"{0}\" (expected DEBUG, INFO, WARNING, ERROR or CRITICAL)")]
pub struct ParseLevelError(
    /// The rejected level name.
    pub String,
);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// A single formatted log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity of the entry.
    pub level: Level,
    /// Chain of sub-logger names, root first.
    pub names: Vec<String>,
    /// The message line.
    pub message: String,
}

impl LogRecord {
    /// The colon-joined heading, e.g. `build:stdout`.
    pub fn heading(&self) -> String {
        self.names.join(":")
    }

    /// Renders as `LEVEL:heading:message` (or `LEVEL:message` without a
    /// heading), the format the test assertions use.
    pub fn formatted(&self) -> String {
        if self.names.is_empty() {
            format!("{}:{}", self.level, self.message)
        } else {
            format!("{}:{}:{}", self.level, self.heading(), self.message)
        }
    }
}

enum Sink {
    /// Forward to the `tracing` subscriber installed by the frontend.
    Tracing,
    /// An unformatted stream; receives every message regardless of level.
    Raw(Box<dyn Write + Send>),
    /// In-memory capture for tests.
    Capture(CapturedLog),
}

struct Shared {
    sinks: Mutex<Vec<Sink>>,
    error_occurred: AtomicBool,
}

/// A logger with a heading and a severity threshold.
///
/// Cloning is cheap; clones and sub-loggers share sinks and the error flag.
#[derive(Clone)]
pub struct Logger {
    shared: Arc<Shared>,
    names: Vec<String>,
    level: Level,
}

impl Logger {
    /// Creates a logger that forwards to the `tracing` subscriber.
    pub fn new(level: Level) -> Self {
        Self::with_sinks(level, vec![Sink::Tracing])
    }

    /// Creates a logger with no sinks at all.
    ///
    /// Raw streams can still be pushed onto it, which is how tests and
    /// quiet frontends capture build logs without terminal output.
    pub fn null() -> Self {
        Self::with_sinks(Level::Critical, Vec::new())
    }

    /// Creates a sink-less logger with the given threshold.
    ///
    /// Combined with [`Logger::push_capture`] this observes everything a
    /// job logs without touching the terminal.
    pub fn quiet(level: Level) -> Self {
        Self::with_sinks(level, Vec::new())
    }

    fn with_sinks(level: Level, sinks: Vec<Sink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sinks: Mutex::new(sinks),
                error_occurred: AtomicBool::new(false),
            }),
            names: Vec::new(),
            level,
        }
    }

    /// Returns a logger with `name` appended to the heading.
    pub fn sub_logger(&self, name: &str) -> Logger {
        let mut names = self.names.clone();
        names.push(name.to_string());
        Logger {
            shared: Arc::clone(&self.shared),
            names,
            level: self.level,
        }
    }

    /// The severity threshold for formatted sinks.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Pushes a raw stream; every subsequent message is written to it with
    /// a trailing newline and no formatting. Streams form a stack.
    pub fn push_raw_stream(&self, stream: Box<dyn Write + Send>) {
        self.shared.sinks.lock().unwrap().push(Sink::Raw(stream));
    }

    /// Attaches an in-memory capture buffer and returns its handle.
    pub fn push_capture(&self) -> CapturedLog {
        let capture = CapturedLog::default();
        self.shared
            .sinks
            .lock()
            .unwrap()
            .push(Sink::Capture(capture.clone()));
        capture
    }

    /// Pops the most recently pushed sink.
    pub fn pop_stream(&self) {
        self.shared.sinks.lock().unwrap().pop();
    }

    /// True once any error- or critical-level message has been logged
    /// through this logger or any of its sub-loggers.
    pub fn error_occurred(&self) -> bool {
        self.shared.error_occurred.load(Ordering::Relaxed)
    }

    /// Logs a message at the given level.
    pub fn log(&self, level: Level, message: &str) {
        if level >= Level::Error {
            self.shared.error_occurred.store(true, Ordering::Relaxed);
        }
        let record = LogRecord {
            level,
            names: self.names.clone(),
            message: message.to_string(),
        };
        let mut sinks = self.shared.sinks.lock().unwrap();
        for sink in sinks.iter_mut() {
            match sink {
                Sink::Raw(stream) => {
                    // A dead raw stream should not take the build down
                    // mid-command; the gzip step will surface the problem.
                    let _ = writeln!(stream, "{}", record.message);
                    let _ = stream.flush();
                }
                Sink::Capture(capture) => {
                    if level >= self.level {
                        capture.records.lock().unwrap().push(record.clone());
                    }
                }
                Sink::Tracing => {
                    if level >= self.level {
                        emit_tracing(&record);
                    }
                }
            }
        }
    }

    /// Logs at [`Level::Debug`].
    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    /// Logs at [`Level::Info`].
    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    /// Logs at [`Level::Warning`].
    pub fn warning(&self, message: &str) {
        self.log(Level::Warning, message);
    }

    /// Logs at [`Level::Error`].
    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

fn emit_tracing(record: &LogRecord) {
    let heading = record.heading();
    let msg = &record.message;
    match record.level {
        Level::Debug => tracing::debug!(target: "hdist", "{heading}{}{msg}", sep(&heading)),
        Level::Info => tracing::info!(target: "hdist", "{heading}{}{msg}", sep(&heading)),
        Level::Warning => tracing::warn!(target: "hdist", "{heading}{}{msg}", sep(&heading)),
        Level::Error | Level::Critical => {
            tracing::error!(target: "hdist", "{heading}{}{msg}", sep(&heading))
        }
    }
}

fn sep(heading: &str) -> &'static str {
    if heading.is_empty() {
        ""
    } else {
        ": "
    }
}

/// Handle to an in-memory capture buffer attached with
/// [`Logger::push_capture`].
#[derive(Clone, Default)]
pub struct CapturedLog {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl CapturedLog {
    /// Snapshot of the captured records.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Snapshot rendered as `LEVEL:heading:message` lines.
    pub fn lines(&self) -> Vec<String> {
        self.records().iter().map(LogRecord::formatted).collect()
    }

    /// True if some captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}
