//! Boot state: first-boot setup, boot counting and clean shutdown tracking

pub mod boot_log;

use crate::filesys::exfat::ExFat;
use crate::filesys::metafs::{MetaFs, MetaFsError};
use crate::filesys::{BlockDevice, FsError};
use core::fmt;
use log::{info, warn, Level, LevelFilter};

pub use boot_log::{BootLog, LOG_HEADER, LOG_PATH};

pub const STATE_PATH: &str = "/.kernel.system.state";
/// "OSAX"
pub const SYSTEM_MAGIC: u32 = 0x4F53_4158;
pub const SYSTEM_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    Fs(FsError),
    MetaFs(MetaFsError),
}

impl From<FsError> for SystemError {
    fn from(e: FsError) -> Self {
        SystemError::Fs(e)
    }
}

impl From<MetaFsError> for SystemError {
    fn from(e: MetaFsError) -> Self {
        SystemError::MetaFs(e)
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemError::Fs(e) => write!(f, "filesystem: {}", e),
            SystemError::MetaFs(e) => write!(f, "metafs: {}", e),
        }
    }
}

/// The record in [`STATE_PATH`]: five little-endian words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    pub magic: u32,
    pub version: u32,
    pub boot_count: u32,
    pub clean_shutdown: bool,
    pub last_boot_timestamp: u32,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            magic: SYSTEM_MAGIC,
            version: SYSTEM_VERSION,
            boot_count: 0,
            clean_shutdown: false,
            last_boot_timestamp: 0,
        }
    }
}

impl SystemState {
    pub const SIZE: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.magic,
            self.version,
            self.boot_count,
            self.clean_shutdown as u32,
            self.last_boot_timestamp,
        ];
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Decodes a record. Wrong length or magic gives `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let word = |i: usize| {
            u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]])
        };
        let state = Self {
            magic: word(0),
            version: word(1),
            boot_count: word(2),
            clean_shutdown: word(3) != 0,
            last_boot_timestamp: word(4),
        };
        (state.magic == SYSTEM_MAGIC).then_some(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    First,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfig {
    /// Serial number written by a first-boot format
    pub volume_serial: u32,
    /// Most verbose level kept in the boot log
    pub log_level: LevelFilter,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            volume_serial: crate::filesys::exfat::constants::DEFAULT_VOLUME_SERIAL,
            log_level: LevelFilter::Info,
        }
    }
}

/// The booted storage stack
pub struct System<D: BlockDevice> {
    metafs: MetaFs<D>,
    state: SystemState,
    boot_kind: BootKind,
    log: Option<BootLog>,
}

impl<D: BlockDevice> System<D> {
    /// Brings up the volume and the object store. A device that does not
    /// mount, or a volume without a state record, gets the first-boot path.
    pub fn boot(device: D, config: &SystemConfig) -> Result<Self, SystemError> {
        match ExFat::try_mount(device) {
            Ok(volume) if volume.exists(STATE_PATH) => Self::normal_boot(volume, config),
            Ok(volume) => {
                info!("system: no state record, treating as first boot");
                Self::first_boot(volume.into_device(), config)
            }
            Err((device, e)) => {
                info!("system: volume does not mount ({}), treating as first boot", e);
                Self::first_boot(device, config)
            }
        }
    }

    fn first_boot(device: D, config: &SystemConfig) -> Result<Self, SystemError> {
        info!("system: first boot, initializing filesystem");
        let volume = ExFat::format(device, config.volume_serial)?;
        let mut metafs = MetaFs::new(volume);
        metafs.format()?;
        metafs.import_system_files()?;
        metafs.sync()?;

        let state = SystemState {
            boot_count: 1,
            ..SystemState::default()
        };
        let mut system = Self {
            metafs,
            state,
            boot_kind: BootKind::First,
            log: None,
        };
        system.save_state()?;
        system.open_log(config.log_level);
        system.log(Level::Info, "BOOT", format_args!("First boot initialization complete"));
        Ok(system)
    }

    fn normal_boot(mut volume: ExFat<D>, config: &SystemConfig) -> Result<Self, SystemError> {
        let state = match Self::load_state(&mut volume) {
            Some(state) => state,
            None => {
                warn!("system: corrupted system state, resetting");
                SystemState::default()
            }
        };
        if !state.clean_shutdown {
            warn!("system: last shutdown was not clean");
        }

        let mut metafs = MetaFs::new(volume);
        if !metafs.mount()? {
            info!("system: rebuilding object index");
            metafs.format()?;
            metafs.import_system_files()?;
        }

        let mut system = Self {
            metafs,
            state,
            boot_kind: BootKind::Normal,
            log: None,
        };
        system.open_log(config.log_level);
        if !state.clean_shutdown {
            system.log(Level::Warn, "BOOT", format_args!("Dirty shutdown detected"));
        }

        system.state.boot_count = system.state.boot_count.wrapping_add(1);
        system.state.clean_shutdown = false;
        system.save_state()?;
        let count = system.state.boot_count;
        system.log(Level::Info, "BOOT", format_args!("Boot #{} successful", count));
        Ok(system)
    }

    fn load_state(volume: &mut ExFat<D>) -> Option<SystemState> {
        volume
            .read_to_vec(STATE_PATH)
            .ok()
            .and_then(|bytes| SystemState::from_bytes(&bytes))
    }

    fn save_state(&mut self) -> Result<(), SystemError> {
        let bytes = self.state.to_bytes();
        let written = self.metafs.volume_mut().write_new(STATE_PATH, &bytes)?;
        if written != bytes.len() {
            return Err(FsError::NoSpace.into());
        }
        Ok(())
    }

    /// The boot log is optional; failing to open it is only a warning.
    fn open_log(&mut self, level: LevelFilter) {
        match BootLog::open(self.metafs.volume_mut(), level) {
            Ok(log) => self.log = Some(log),
            Err(e) => warn!("system: boot log unavailable: {}", e),
        }
    }

    /// Writes to the boot log if it is open.
    pub fn log(&mut self, level: Level, subsystem: &str, args: fmt::Arguments) {
        if let Some(log) = self.log {
            if let Err(e) = log.write(self.metafs.volume_mut(), level, subsystem, args) {
                warn!("system: boot log write failed: {}", e);
            }
        }
    }

    /// Syncs the object store and records a clean shutdown.
    pub fn shutdown(&mut self) -> Result<(), SystemError> {
        info!("system: shutting down");
        self.metafs.sync()?;
        self.state.clean_shutdown = true;
        self.save_state()?;
        self.log(Level::Info, "SHUTDOWN", format_args!("Clean shutdown complete"));
        Ok(())
    }

    pub fn metafs(&self) -> &MetaFs<D> {
        &self.metafs
    }

    pub fn metafs_mut(&mut self) -> &mut MetaFs<D> {
        &mut self.metafs
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn boot_kind(&self) -> BootKind {
        self.boot_kind
    }

    pub fn logger_ready(&self) -> bool {
        self.log.is_some()
    }

    /// Gives the device back, for a reboot.
    pub fn into_device(self) -> D {
        self.metafs.into_volume().into_device()
    }
}
