//! `log` facade backend
//!
//! Routes `log::info!` and friends to the serial port. Installed once during
//! boot; hosted builds keep the facade uninstalled and the macros are then
//! silently discarded by `log` itself.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call once; later calls are ignored.
pub fn init(max_level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}
