//! Run log capability.
//!
//! The orchestrator and the sinks never reach for a global logger; they
//! receive a [`RunLog`] when constructed. The CLI wires one that forwards
//! to `tracing`, tests use [`MemoryLog`].

use std::fmt;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

/// Sink for human-readable run messages.
pub trait RunLog: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Discards everything.
pub struct NoLog;

impl RunLog for NoLog {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Keeps every message in memory.
#[derive(Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Whether any message at `level` contains `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl RunLog for MemoryLog {
    fn log(&self, level: LogLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}
