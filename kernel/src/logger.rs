//! Kernel logger.
//!
//! Backs the `log` facade with the console primitive, one line per record.

use log::{Level, LevelFilter, Metadata, Record};

use crate::arch;

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Adapter so `format_args!` output can stream to the console.
struct ConsoleWriter;

impl core::fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        arch::console_write(s);
        Ok(())
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            use core::fmt::Write;
            let level = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN",
                Level::Info => "INFO",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            let _ = writeln!(ConsoleWriter, "[{}] {}", level, record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the console logger. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
