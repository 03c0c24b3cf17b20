//! Capture of log records emitted while a task runs.
//!
//! Every task execution opens a capture frame on the current thread. Records
//! at [`Level::Warn`] or above that reach [`capture`] while a frame is open are
//! attached to the task's result. Under the `cli` feature,
//! [`init_logging`] installs a logger that feeds [`capture`].

use std::cell::RefCell;

use chrono::{DateTime, Utc};
use log::{Level, Record};
use serde::{Deserialize, Serialize};

thread_local! {
    static CAPTURE_FRAMES: RefCell<Vec<Vec<LogRecord>>> = RefCell::new(Vec::new());
}

/// A log record kept with a task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// `WARN` or `ERROR`
    pub level: String,
    /// Module path the record came from
    pub target: String,
    /// Formatted message
    pub message: String,
    /// When the record was captured
    pub timestamp: DateTime<Utc>,
}

/// Offer a record to the innermost open capture frame.
pub fn capture(record: &Record) {
    if record.level() > Level::Warn {
        return;
    }
    CAPTURE_FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            frame.push(LogRecord {
                level: record.level().to_string(),
                target: record.target().to_string(),
                message: record.args().to_string(),
                timestamp: Utc::now(),
            });
        }
    });
}

/// An open capture frame. Closing it hands its records to the enclosing frame
/// as well, so a parent task sees what its children logged.
pub(crate) struct CaptureFrame {
    depth: usize,
    open: bool,
}

impl CaptureFrame {
    pub(crate) fn start() -> Self {
        let depth = CAPTURE_FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(vec![]);
            frames.len()
        });
        Self { depth, open: true }
    }

    pub(crate) fn finish(mut self) -> Vec<LogRecord> {
        self.open = false;
        self.close()
    }

    fn close(&self) -> Vec<LogRecord> {
        CAPTURE_FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if frames.len() != self.depth {
                return vec![];
            }
            let records = frames.pop().unwrap_or_default();
            if let Some(parent) = frames.last_mut() {
                parent.extend(records.iter().cloned());
            }
            records
        })
    }
}

impl Drop for CaptureFrame {
    fn drop(&mut self) {
        if self.open {
            self.close();
        }
    }
}

#[cfg(feature = "cli")]
mod cli_logger {
    use env_logger::{Builder, Env, Logger, DEFAULT_FILTER_ENV};
    use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

    /// [`env_logger`] output plus capture into task results.
    pub struct CapturingLogger {
        inner: Logger,
    }

    impl Log for CapturingLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            self.inner.enabled(metadata) || metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &Record) {
            if self.inner.matches(record) {
                self.inner.log(record);
            }
            super::capture(record);
        }

        fn flush(&self) {
            self.inner.flush();
        }
    }

    /// Install the capturing logger, honouring `RUST_LOG` and falling back to
    /// `default_filter`.
    ///
    /// # Errors
    ///
    /// Fails if a logger has already been installed.
    pub fn init_logging(default_filter: &str) -> Result<(), SetLoggerError> {
        let inner = Builder::from_env(Env::default().filter_or(DEFAULT_FILTER_ENV, default_filter))
            .build();
        let max_level = inner.filter().max(LevelFilter::Warn);
        log::set_boxed_logger(Box::new(CapturingLogger { inner }))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

#[cfg(feature = "cli")]
pub use cli_logger::{init_logging, CapturingLogger};

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(level: Level, message: &str) {
        capture(
            &Record::builder()
                .level(level)
                .target("skyreduce::test")
                .args(format_args!("{message}"))
                .build(),
        );
    }

    #[test]
    fn test_capture_keeps_warnings_only() {
        let frame = CaptureFrame::start();
        emit(Level::Info, "progress");
        emit(Level::Warn, "antenna DV01 is not a raster");
        emit(Level::Error, "giving up");
        let records = frame.finish();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, "WARN");
        assert_eq!(records[0].message, "antenna DV01 is not a raster");
        assert_eq!(records[1].level, "ERROR");
    }

    #[test]
    fn test_nested_frames_propagate_to_parent() {
        let parent = CaptureFrame::start();
        emit(Level::Warn, "outer");
        let child = CaptureFrame::start();
        emit(Level::Warn, "inner");
        let child_records = child.finish();
        let parent_records = parent.finish();
        assert_eq!(child_records.len(), 1);
        assert_eq!(
            parent_records
                .iter()
                .map(|record| record.message.as_str())
                .collect::<Vec<_>>(),
            vec!["outer", "inner"]
        );
    }

    #[test]
    fn test_dropped_frame_is_closed() {
        {
            let _frame = CaptureFrame::start();
        }
        emit(Level::Warn, "nobody listening");
        let frame = CaptureFrame::start();
        assert!(frame.finish().is_empty());
    }
}
