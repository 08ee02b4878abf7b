//! Kernel logging facility
//!
//! Routes the `log` macros to the serial console as `[LEVEL] message`.
//! Debug builds log at `Debug`, release builds at `Info`.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serialises whole records so lines from different tasks never interleave.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the serial logger. A second call keeps the first logger.
pub fn init() {
    match log::set_logger(&LOGGER) {
        Ok(()) => log::set_max_level(default_level()),
        Err(_) => log::warn!("logger already installed"),
    }
}

/// Change verbosity at runtime (the `loglevel` command).
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

pub fn level() -> LevelFilter {
    log::max_level()
}

/// Accepts `off`, `error`, `warn`, `info`, `debug` and `trace`, in any case.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warn"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("loud"), None);
    }
}
