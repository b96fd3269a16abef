//! exFAT filesystem constants

/// Size of a disk sector in bytes
pub const SECTOR_SIZE: usize = 512;
pub const BYTES_PER_SECTOR_SHIFT: u8 = 9;

/// 8 sectors per cluster, 4 KiB clusters
pub const SECTORS_PER_CLUSTER_SHIFT: u8 = 3;
pub const SECTORS_PER_CLUSTER: u64 = 1 << SECTORS_PER_CLUSTER_SHIFT;
pub const CLUSTER_SIZE: usize = SECTOR_SIZE << SECTORS_PER_CLUSTER_SHIFT;

/// Main boot region (12 sectors) followed by the backup boot region
pub const BOOT_REGION_SECTORS: u64 = 12;
pub const BACKUP_BOOT_SECTOR: u64 = BOOT_REGION_SECTORS;
/// Sector of the boot region holding the repeated checksum
pub const BOOT_CHECKSUM_SECTOR: u64 = 11;
pub const FAT_OFFSET: u32 = 24;
pub const NUMBER_OF_FATS: u8 = 1;

pub const FS_NAME: [u8; 8] = *b"EXFAT   ";
pub const JUMP_BOOT: [u8; 3] = [0xEB, 0x76, 0x90];
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const FS_REVISION: u16 = 0x0100;
pub const DRIVE_SELECT: u8 = 0x80;
pub const DEFAULT_VOLUME_SERIAL: u32 = 0x1234_5678;

/// First cluster of the heap; clusters 0 and 1 do not exist
pub const FIRST_CLUSTER: u32 = 2;
pub const ROOT_DIR_CLUSTER: u32 = 2;
pub const BITMAP_CLUSTER: u32 = 3;

/// Size of FAT entry in bytes (32-bit)
pub const FAT_ENTRY_SIZE: usize = 4;
pub const FAT_MEDIA_DESCRIPTOR: u32 = 0xFFFF_FFF8;

/// Size of a directory entry slot
pub const DIR_ENTRY_SIZE: usize = 32;
pub const ENTRIES_PER_CLUSTER: usize = CLUSTER_SIZE / DIR_ENTRY_SIZE;

/// Entry type codes. Bit 7 is the in-use flag.
pub const ENTRY_END_OF_DIRECTORY: u8 = 0x00;
pub const ENTRY_IN_USE: u8 = 0x80;
pub const ENTRY_ALLOCATION_BITMAP: u8 = 0x81;
pub const ENTRY_UPCASE_TABLE: u8 = 0x82;
pub const ENTRY_VOLUME_LABEL: u8 = 0x83;
pub const ENTRY_FILE: u8 = 0x85;
pub const ENTRY_VOLUME_GUID: u8 = 0xA0;
pub const ENTRY_STREAM: u8 = 0xC0;
pub const ENTRY_FILE_NAME: u8 = 0xC1;

/// UTF-16 code units carried by one file name entry
pub const NAME_CHARS_PER_ENTRY: usize = 15;
pub const MAX_NAME_LENGTH: usize = 255;

/// Stream entry flag: allocation possible
pub const STREAM_ALLOCATION_POSSIBLE: u8 = 0x01;

/// File attribute: Read-only
pub const ATTR_READ_ONLY: u16 = 0x01;

/// File attribute: Directory
pub const ATTR_DIRECTORY: u16 = 0x10;

/// File attribute: Archive
pub const ATTR_ARCHIVE: u16 = 0x20;

pub const VOLUME_LABEL: &str = "EXFAT ";

/// Suffix of the sibling `write_new` stages a replacement in
pub const STAGING_SUFFIX: &str = ".tmp";
