use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const LOG_TARGET: &str = "storyforge";
pub const MAIN_LOG_FILE_NAME: &str = "Main.log";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            Self::Trace => log::Level::Trace,
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
            Self::Warn => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, record: LogRecord);
}

pub type SharedLogSink = Arc<dyn LogSink>;

impl<T: LogSink + ?Sized> LogSink for Arc<T> {
    fn log(&self, record: LogRecord) {
        (**self).log(record);
    }
}

#[derive(Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn log(&self, _record: LogRecord) {}
}

/// Collects records in memory; used by tests to assert on warnings.
#[derive(Default)]
pub struct VecLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl VecLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|record| record.level == level)
            .map(|record| record.message)
            .collect()
    }
}

impl LogSink for VecLogSink {
    fn log(&self, record: LogRecord) {
        if let Ok(mut guard) = self.records.lock() {
            guard.push(record);
        }
    }
}

#[derive(Default, Clone)]
pub struct StdoutLogSink;

impl StdoutLogSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for StdoutLogSink {
    fn log(&self, record: LogRecord) {
        println!("[{}] {}", record.level, record.message);
    }
}

/// Forwards records to the `log` facade so whatever subscriber the
/// binary installs picks them up.
#[derive(Default, Clone)]
pub struct FacadeLogSink {
    min_level: Option<LogLevel>,
}

impl FacadeLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = Some(level);
        self
    }
}

impl LogSink for FacadeLogSink {
    fn log(&self, record: LogRecord) {
        if self.min_level.is_some_and(|min| record.level < min) {
            return;
        }
        log::log!(target: LOG_TARGET, record.level.as_log_level(), "{}", record.message);
    }
}

/// Appends timestamped lines to a `Main.log` file.
pub struct FileLogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLogSink {
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        let path = dir.as_ref().join(MAIN_LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn log(&self, record: LogRecord) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{stamp} [{}] {}", record.level, record.message);
        }
    }
}

/// Sends every record to each of the wrapped sinks.
#[derive(Default, Clone)]
pub struct TeeLogSink {
    sinks: Vec<SharedLogSink>,
}

impl TeeLogSink {
    pub fn new(sinks: Vec<SharedLogSink>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: SharedLogSink) {
        self.sinks.push(sink);
    }
}

impl LogSink for TeeLogSink {
    fn log(&self, record: LogRecord) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.log(record.clone());
            }
            last.log(record);
        }
    }
}
