//! Append-only text log shared by every pipeline component.
//!
//! Each entry is a single line, `[YYYY-MM-DD HH:MM:SS] [LEVEL] message`.
//! Writes are serialized through a mutex and any I/O failure is swallowed so
//! logging can never break a pipeline step.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{Local, NaiveDateTime};
use tracing::trace;

/// Severity attached to each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
    Warning,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-backed log sink. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct LogSink {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl LogSink {
    /// Creates a sink appending to `path`; the parent directory is created if needed.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self {
            path: Some(path),
            write_lock: Mutex::new(()),
        }
    }

    /// A sink that drops every entry. Useful for tests and dry runs.
    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Info, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Error, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Warning, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.write(LogLevel::Debug, message.as_ref());
    }

    /// Appends one entry. Never fails.
    pub fn write(&self, level: LogLevel, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let line = format_line(level, Local::now().naive_local(), message);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(error) = result {
            trace!(path = %path.display(), error = %error, "log write dropped");
        }
    }

    /// Deletes the log file. Errors are ignored.
    pub fn clear(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
}

fn format_line(level: LogLevel, timestamp: NaiveDateTime, message: &str) -> String {
    // Keep one entry per line even when tool output carries embedded newlines.
    let flattened = message.replace(['\r', '\n'], " ");
    format!("[{}] [{}] {}\n", timestamp.format("%Y-%m-%d %H:%M:%S"), level, flattened)
}
