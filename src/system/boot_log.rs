//! Persistent boot log kept on the volume
//!
//! Lines have the same `[LEVEL] SUBSYSTEM: message` shape as the serial
//! logger. Every record is also forwarded to the `log` facade.

use crate::filesys::exfat::ExFat;
use crate::filesys::{BlockDevice, FileSystem, FsError, SeekFrom};
use alloc::format;
use core::fmt;
use log::{Level, LevelFilter};

pub const LOG_PATH: &str = "/.kernel.system.log";
pub const LOG_HEADER: &str = "=== System Boot Log ===";

/// Appender for the boot log. Holds no open handle between writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootLog {
    max_level: LevelFilter,
}

impl BootLog {
    /// Creates the log file if needed and appends the session header.
    pub fn open<D: BlockDevice>(
        volume: &mut ExFat<D>,
        max_level: LevelFilter,
    ) -> Result<Self, FsError> {
        match volume.create_file(LOG_PATH) {
            Ok(()) | Err(FsError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
        append(volume, format!("{}\n", LOG_HEADER).as_bytes())?;
        Ok(Self { max_level })
    }

    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Appends one line. Records above the configured level are dropped.
    pub fn write<D: BlockDevice>(
        &self,
        volume: &mut ExFat<D>,
        level: Level,
        subsystem: &str,
        args: fmt::Arguments,
    ) -> Result<(), FsError> {
        log::log!(level, "{}: {}", subsystem, args);
        if level > self.max_level {
            return Ok(());
        }
        let line = format!("[{}] {}: {}\n", level, subsystem, args);
        append(volume, line.as_bytes())
    }
}

fn append<D: BlockDevice>(volume: &mut ExFat<D>, data: &[u8]) -> Result<(), FsError> {
    let fd = volume.open_file(LOG_PATH)?;
    let result = volume
        .seek_file(fd, SeekFrom::End(0))
        .and_then(|_| volume.write_file(fd, data));
    volume.close_file(fd)?;
    match result? {
        n if n == data.len() => Ok(()),
        _ => Err(FsError::NoSpace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::block::MemoryBlockDevice;
    use crate::filesys::exfat::constants::DEFAULT_VOLUME_SERIAL;
    use alloc::string::String;

    fn volume() -> ExFat<MemoryBlockDevice> {
        ExFat::format(MemoryBlockDevice::new(20480, 512), DEFAULT_VOLUME_SERIAL).unwrap()
    }

    fn contents(volume: &mut ExFat<MemoryBlockDevice>) -> String {
        String::from_utf8(volume.read_to_vec(LOG_PATH).unwrap()).unwrap()
    }

    #[test]
    fn test_lines_append() {
        let mut volume = volume();
        let log = BootLog::open(&mut volume, LevelFilter::Info).unwrap();
        log.write(&mut volume, Level::Info, "BOOT", format_args!("Boot #{} successful", 2))
            .unwrap();
        log.write(&mut volume, Level::Warn, "BOOT", format_args!("Dirty shutdown detected"))
            .unwrap();

        let text = contents(&mut volume);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "=== System Boot Log ===",
                "[INFO] BOOT: Boot #2 successful",
                "[WARN] BOOT: Dirty shutdown detected",
            ]
        );
    }

    #[test]
    fn test_level_filter() {
        let mut volume = volume();
        let log = BootLog::open(&mut volume, LevelFilter::Warn).unwrap();
        log.write(&mut volume, Level::Debug, "MEM", format_args!("noise"))
            .unwrap();
        assert_eq!(contents(&mut volume), "=== System Boot Log ===\n");
    }

    #[test]
    fn test_reopen_keeps_history() {
        let mut volume = volume();
        let log = BootLog::open(&mut volume, LevelFilter::Info).unwrap();
        log.write(&mut volume, Level::Info, "BOOT", format_args!("first"))
            .unwrap();
        BootLog::open(&mut volume, LevelFilter::Info).unwrap();

        let text = contents(&mut volume);
        assert!(text.starts_with(LOG_HEADER));
        assert_eq!(text.matches(LOG_HEADER).count(), 2);
        assert!(text.contains("[INFO] BOOT: first\n"));
    }
}
