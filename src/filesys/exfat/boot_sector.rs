//! exFAT boot sector layout and boot region checksum

use super::constants::*;
use crate::filesys::FsError;

/// Main boot sector. Encoded little-endian at the offsets of the on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub jump_boot: [u8; 3],
    pub fs_name: [u8; 8],
    pub partition_offset: u64,
    /// Volume size in sectors
    pub volume_length: u64,
    /// First FAT sector
    pub fat_offset: u32,
    /// FAT size in sectors
    pub fat_length: u32,
    /// First sector of cluster 2
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub root_dir_cluster: u32,
    pub volume_serial: u32,
    pub fs_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
    pub boot_signature: u16,
}

impl BootSector {
    /// Lays out a volume of `total_sectors` 512-byte sectors.
    pub fn new(total_sectors: u64, volume_serial: u32) -> Result<Self, FsError> {
        let usable = total_sectors
            .checked_sub(FAT_OFFSET as u64)
            .ok_or(FsError::NoSpace)?;
        let max_clusters = (usable / SECTORS_PER_CLUSTER).min(u32::MAX as u64 - 16);
        let fat_length = (max_clusters * FAT_ENTRY_SIZE as u64).div_ceil(SECTOR_SIZE as u64);
        let cluster_heap_offset = FAT_OFFSET as u64 + fat_length * NUMBER_OF_FATS as u64;
        let cluster_count = total_sectors.saturating_sub(cluster_heap_offset) / SECTORS_PER_CLUSTER;

        // Root directory, bitmap and at least one data cluster.
        if cluster_count < 3 {
            return Err(FsError::NoSpace);
        }

        Ok(Self {
            jump_boot: JUMP_BOOT,
            fs_name: FS_NAME,
            partition_offset: 0,
            volume_length: total_sectors,
            fat_offset: FAT_OFFSET,
            fat_length: fat_length as u32,
            cluster_heap_offset: cluster_heap_offset as u32,
            cluster_count: cluster_count as u32,
            root_dir_cluster: ROOT_DIR_CLUSTER,
            volume_serial,
            fs_revision: FS_REVISION,
            volume_flags: 0,
            bytes_per_sector_shift: BYTES_PER_SECTOR_SHIFT,
            sectors_per_cluster_shift: SECTORS_PER_CLUSTER_SHIFT,
            number_of_fats: NUMBER_OF_FATS,
            drive_select: DRIVE_SELECT,
            percent_in_use: 0,
            boot_signature: BOOT_SIGNATURE,
        })
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut bytes = [0u8; SECTOR_SIZE];
        bytes[0..3].copy_from_slice(&self.jump_boot);
        bytes[3..11].copy_from_slice(&self.fs_name);
        // 0x0B..0x40 must be zero
        bytes[0x40..0x48].copy_from_slice(&self.partition_offset.to_le_bytes());
        bytes[0x48..0x50].copy_from_slice(&self.volume_length.to_le_bytes());
        bytes[0x50..0x54].copy_from_slice(&self.fat_offset.to_le_bytes());
        bytes[0x54..0x58].copy_from_slice(&self.fat_length.to_le_bytes());
        bytes[0x58..0x5C].copy_from_slice(&self.cluster_heap_offset.to_le_bytes());
        bytes[0x5C..0x60].copy_from_slice(&self.cluster_count.to_le_bytes());
        bytes[0x60..0x64].copy_from_slice(&self.root_dir_cluster.to_le_bytes());
        bytes[0x64..0x68].copy_from_slice(&self.volume_serial.to_le_bytes());
        bytes[0x68..0x6A].copy_from_slice(&self.fs_revision.to_le_bytes());
        bytes[0x6A..0x6C].copy_from_slice(&self.volume_flags.to_le_bytes());
        bytes[0x6C] = self.bytes_per_sector_shift;
        bytes[0x6D] = self.sectors_per_cluster_shift;
        bytes[0x6E] = self.number_of_fats;
        bytes[0x6F] = self.drive_select;
        bytes[0x70] = self.percent_in_use;
        bytes[0x1FE..0x200].copy_from_slice(&self.boot_signature.to_le_bytes());
        bytes
    }

    /// Decodes sector 0, rejecting anything without the signature and name tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FsError> {
        if bytes.len() < SECTOR_SIZE {
            return Err(FsError::IOError);
        }
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| u32_at(at) as u64 | (u32_at(at + 4) as u64) << 32;

        let boot_signature = u16_at(0x1FE);
        if boot_signature != BOOT_SIGNATURE || bytes[3..11] != FS_NAME {
            return Err(FsError::BadVolume);
        }

        let sector = Self {
            jump_boot: [bytes[0], bytes[1], bytes[2]],
            fs_name: FS_NAME,
            partition_offset: u64_at(0x40),
            volume_length: u64_at(0x48),
            fat_offset: u32_at(0x50),
            fat_length: u32_at(0x54),
            cluster_heap_offset: u32_at(0x58),
            cluster_count: u32_at(0x5C),
            root_dir_cluster: u32_at(0x60),
            volume_serial: u32_at(0x64),
            fs_revision: u16_at(0x68),
            volume_flags: u16_at(0x6A),
            bytes_per_sector_shift: bytes[0x6C],
            sectors_per_cluster_shift: bytes[0x6D],
            number_of_fats: bytes[0x6E],
            drive_select: bytes[0x6F],
            percent_in_use: bytes[0x70],
            boot_signature,
        };

        // Only the geometry this driver formats is supported.
        if sector.bytes_per_sector_shift != BYTES_PER_SECTOR_SHIFT
            || sector.sectors_per_cluster_shift != SECTORS_PER_CLUSTER_SHIFT
        {
            return Err(FsError::NotSupported);
        }
        Ok(sector)
    }

    pub fn bytes_per_sector(&self) -> usize {
        1 << self.bytes_per_sector_shift
    }

    pub fn sectors_per_cluster(&self) -> u64 {
        1 << self.sectors_per_cluster_shift
    }

    pub fn bytes_per_cluster(&self) -> usize {
        self.bytes_per_sector() << self.sectors_per_cluster_shift
    }
}

/// exFAT boot region checksum over sectors 0..=10.
///
/// VolumeFlags (bytes 106-107) and PercentInUse (byte 112) of the first
/// sector are left out so they can change without a rewrite.
pub fn boot_checksum(region: &[u8]) -> u32 {
    region
        .iter()
        .enumerate()
        .filter(|&(i, _)| !matches!(i, 106 | 107 | 112))
        .fold(0u32, |checksum, (_, &byte)| {
            checksum.rotate_right(1).wrapping_add(byte as u32)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_for_10mb() {
        let boot = BootSector::new(20480, DEFAULT_VOLUME_SERIAL).unwrap();
        assert_eq!(boot.fat_offset, 24);
        // (20480 - 24) / 8 = 2557 clusters, 4 bytes each
        assert_eq!(boot.fat_length, 20);
        assert_eq!(boot.cluster_heap_offset, 44);
        assert_eq!(boot.cluster_count, (20480 - 44) / 8);
        assert_eq!(boot.bytes_per_cluster(), 4096);
    }

    #[test]
    fn test_layout_offsets() {
        let boot = BootSector::new(20480, 0xCAFE_F00D).unwrap();
        let bytes = boot.to_bytes();
        assert_eq!(&bytes[0..3], &[0xEB, 0x76, 0x90]);
        assert_eq!(&bytes[3..11], b"EXFAT   ");
        assert!(bytes[0x0B..0x40].iter().all(|&b| b == 0));
        assert_eq!(&bytes[0x48..0x50], &20480u64.to_le_bytes());
        assert_eq!(&bytes[0x64..0x68], &0xCAFE_F00Du32.to_le_bytes());
        assert_eq!(bytes[0x6C], 9);
        assert_eq!(bytes[0x6D], 3);
        assert_eq!(bytes[0x6F], 0x80);
        assert_eq!(&bytes[0x1FE..], &[0x55, 0xAA]);
        assert_eq!(BootSector::from_bytes(&bytes), Ok(boot));
    }

    #[test]
    fn test_rejects_foreign_sector() {
        let mut bytes = BootSector::new(20480, 1).unwrap().to_bytes();
        bytes[3..11].copy_from_slice(b"FAT16   ");
        assert_eq!(BootSector::from_bytes(&bytes), Err(FsError::BadVolume));

        let mut bytes = BootSector::new(20480, 1).unwrap().to_bytes();
        bytes[0x1FF] = 0;
        assert_eq!(BootSector::from_bytes(&bytes), Err(FsError::BadVolume));
        assert_eq!(BootSector::from_bytes(&[0u8; 16]), Err(FsError::IOError));
    }

    #[test]
    fn test_too_small() {
        assert_eq!(BootSector::new(20, 1), Err(FsError::NoSpace));
        assert_eq!(BootSector::new(40, 1), Err(FsError::NoSpace));
    }

    #[test]
    fn test_checksum_ignores_volatile_fields() {
        let mut region = [0u8; SECTOR_SIZE * 11];
        region[..SECTOR_SIZE].copy_from_slice(&BootSector::new(20480, 1).unwrap().to_bytes());
        let checksum = boot_checksum(&region);

        region[106] = 0xFF;
        region[112] = 50;
        assert_eq!(boot_checksum(&region), checksum);

        region[0x64] ^= 1;
        assert_ne!(boot_checksum(&region), checksum);
    }
}
