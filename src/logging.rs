//! logging.rs
//! Per-run log file with severity tags. One serialized sink shared by
//! every component; console diagnostics go through the `log` crate
//! macros instead and are independent of this file.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Severity of a log entry. Entries below the sink's threshold are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Info => "[INFO]",
            LogLevel::Warning => "[WARNING]",
            LogLevel::Error => "[ERROR]",
            LogLevel::Fatal => "[FATAL]",
        }
    }
}

pub type SharedLogger = Arc<Logger>;

/// Line-oriented log sink. Each record is
/// `<unix_ts> [<LEVEL>] "<message>"` and is flushed before the lock is
/// released, so concurrent callers never interleave within one record.
pub struct Logger {
    sink: Mutex<File>,
    min_level: LogLevel,
}

impl Logger {
    pub fn create(path: &Path, min_level: LogLevel) -> io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "# format is: timestamp [LogLevel] \"message\"")?;
        let logger = Self {
            sink: Mutex::new(file),
            min_level,
        };
        logger.log(LogLevel::Info, "logfile created");
        Ok(logger)
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        if level < self.min_level {
            return;
        }
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "{} {} \"{}\"", unix_now(), level.tag(), msg);
        let _ = sink.flush();
    }

    /// Logs an error value with a context prefix and the error's static
    /// type name as its tag.
    pub fn log_error<E: std::error::Error>(&self, level: LogLevel, prefix: &str, err: &E) {
        self.log(
            level,
            &format!("{}: type-[{}] msg-[{}]", prefix, std::any::type_name::<E>(), err),
        );
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_log(dir: &tempfile::TempDir) -> Vec<String> {
        let text = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn records_are_tagged_and_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::create(&dir.path().join("log.txt"), LogLevel::Debug).unwrap();
        logger.log(LogLevel::Warning, "buffer overflow, dropped 12");

        let lines = read_log(&dir);
        assert_eq!(lines[0], "# format is: timestamp [LogLevel] \"message\"");
        assert!(lines[1].ends_with("[INFO] \"logfile created\""));
        let last = lines.last().unwrap();
        assert!(last.contains("[WARNING] \"buffer overflow, dropped 12\""));
        let ts: u64 = last.split(' ').next().unwrap().parse().unwrap();
        assert!(ts > 0);
    }

    #[test]
    fn entries_below_threshold_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::create(&dir.path().join("log.txt"), LogLevel::Warning).unwrap();
        logger.log(LogLevel::Debug, "chatter");
        logger.log(LogLevel::Info, "more chatter");
        logger.log(LogLevel::Error, "kept");

        let lines = read_log(&dir);
        assert_eq!(lines.len(), 2); // preamble + the error
        assert!(lines[1].contains("[ERROR] \"kept\""));
    }

    #[test]
    fn log_error_includes_type_tag_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::create(&dir.path().join("log.txt"), LogLevel::Debug).unwrap();
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        logger.log_error(LogLevel::Fatal, "open failed", &err);

        let lines = read_log(&dir);
        let last = lines.last().unwrap();
        assert!(last.contains("[FATAL]"));
        assert!(last.contains("open failed: type-["));
        assert!(last.contains("msg-[gone]"));
    }
}
