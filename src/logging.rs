//! Kernel logging facility
//!
//! Log records go to COM1 through the `log` crate. Off bare metal there is no
//! port to write to and output is dropped.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

#[cfg(target_os = "none")]
use crate::constants::ports::SERIAL_PORT;

#[cfg(target_os = "none")]
lazy_static::lazy_static! {
    /// The first serial port, initialized on first use.
    pub static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: COM1 is not used by anything else in the kernel.
        let mut serial_port = unsafe { uart_16550::SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;
        // A failed serial write has nowhere else to be reported.
        let _ = SERIAL1.lock().write_fmt(args);
    }
    #[cfg(not(target_os = "none"))]
    let _ = args;
}

/// Prints formatted text to the serial port.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::logging::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serializes whole records so lines from different paths do not interleave.
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

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`] with the given maximum level.
///
/// Fails if some logger was already installed; the level is left unchanged
/// in that case.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

/// Level used when the boot configuration does not name one.
pub const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_follows_max_level() {
        log::set_max_level(LevelFilter::Warn);
        let warn = Metadata::builder().level(log::Level::Warn).build();
        let info = Metadata::builder().level(log::Level::Info).build();
        assert!(LOGGER.enabled(&warn));
        assert!(!LOGGER.enabled(&info));
        log::set_max_level(LevelFilter::Trace);
    }
}
