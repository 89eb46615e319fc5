//! Profiler log sink behind the `log` facade.
//!
//! The agent cannot assume the host set up logging, so it installs its own
//! `log::Log` implementation on init. Destination and level are
//! reconfigurable at runtime through the `log=` and `loglevel=` command
//! tokens. The sampling path never logs; everything below runs on control
//! threads only.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::args::LogLevel;
use crate::error::{ProfilerError, Result};

struct ProfilerLogger {
    file: Mutex<Option<File>>,
}

static LOGGER: OnceLock<ProfilerLogger> = OnceLock::new();
static MAX_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

impl Log for ProfilerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as usize <= MAX_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let line = format!("[{}] {}\n", prefix, record.args());
        let mut file = self.file.lock();
        match file.as_mut() {
            Some(f) => {
                let _ = f.write_all(line.as_bytes());
            }
            None => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {
        if let Some(f) = self.file.lock().as_mut() {
            let _ = f.flush();
        }
    }
}

fn logger() -> &'static ProfilerLogger {
    LOGGER.get_or_init(|| ProfilerLogger {
        file: Mutex::new(None),
    })
}

/// Installs the logger. Harmless to call more than once; a logger installed
/// by the host application wins and the profiler just logs through it.
pub fn init() {
    let logger = logger();
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Applies `loglevel=`/`log=` from a command.
pub fn configure(level: Option<LogLevel>, path: Option<&str>) -> Result<()> {
    if let Some(level) = level {
        let filter = match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::None => LevelFilter::Off,
        };
        MAX_LEVEL.store(filter as usize, Ordering::Relaxed);
    }
    if let Some(path) = path {
        let file = match path {
            "stderr" => None,
            _ => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ProfilerError::failed(format!("cannot open log file: {e}")))?,
            ),
        };
        *logger().file.lock() = file;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_applies() {
        init();
        configure(Some(LogLevel::Warn), None).unwrap();
        assert!(!logger().enabled(&Metadata::builder().level(Level::Info).build()));
        assert!(logger().enabled(&Metadata::builder().level(Level::Warn).build()));
        configure(Some(LogLevel::Info), None).unwrap();
    }

    #[test]
    fn log_file_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asprof.log");
        init();
        configure(None, Some(path.to_str().unwrap())).unwrap();
        log::warn!("redirected line");
        logger().flush();
        configure(None, Some("stderr")).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("redirected line"));
    }
}
