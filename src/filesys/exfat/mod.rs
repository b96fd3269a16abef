//! exFAT filesystem implementation
//!
//! One FAT, 512-byte sectors and 4 KiB clusters. The cluster heap starts with
//! the root directory at cluster 2 and the allocation bitmap at cluster 3.
//! Directories are cluster chains and grow one zeroed cluster at a time.

use super::*;
use alloc::collections::BinaryHeap;
use alloc::format;
use alloc::vec;
use core::cmp::{max, min, Reverse};
use log::{debug, info, warn};

mod boot_sector;
pub mod constants;
mod dir_entry;
mod fat_entry;
mod file;

pub use boot_sector::{boot_checksum, BootSector};
use constants::*;
pub use dir_entry::FileEntrySet;
use dir_entry::{
    bitmap_entry, entry_type, is_end_marker, is_in_use, parse_bitmap_entry, validate_name,
    volume_label_entry, RawEntry,
};
pub use fat_entry::FatEntry;
pub use file::{EntryLocation, ExFatFile};

fn is_root(path: &str) -> bool {
    path.split('/').all(|s| s.is_empty())
}

/// An entry set found on disk
#[derive(Debug, Clone)]
struct Located {
    set: FileEntrySet,
    location: EntryLocation,
}

/// A directory to scan or extend. `entry` is `None` for the root.
struct DirRef {
    cluster: u32,
    entry: Option<Located>,
}

/// exFAT filesystem driver
pub struct ExFat<D: BlockDevice> {
    /// Underlying block device
    device: D,
    /// Boot sector containing filesystem parameters
    boot_sector: BootSector,
    /// Starting sector of the FAT
    fat_start: u64,
    /// Starting sector of cluster 2
    heap_start: u64,
    /// Size of each cluster in bytes
    cluster_size: usize,
    /// First cluster and byte length of the allocation bitmap
    bitmap_cluster: u32,
    bitmap_length: u64,
    /// Next available file descriptor
    fd_counter: usize,
    /// Closed descriptors, lowest handed out first
    reuse_fds: BinaryHeap<Reverse<usize>>,
    /// Table of open files
    fd_table: Vec<ExFatFile>,
}

impl<D: BlockDevice> ExFat<D> {
    /// Writes a fresh volume over the whole device and mounts it.
    pub fn format(mut device: D, volume_serial: u32) -> Result<Self, FsError> {
        if device.block_size() != SECTOR_SIZE {
            return Err(FsError::NotSupported);
        }
        let total_sectors = device.total_blocks();
        let boot_sector = BootSector::new(total_sectors, volume_serial)?;

        let bitmap_length = (boot_sector.cluster_count as u64).div_ceil(8);
        let bitmap_clusters = bitmap_length.div_ceil(CLUSTER_SIZE as u64) as u32;
        if boot_sector.cluster_count < bitmap_clusters + 2 {
            return Err(FsError::NoSpace);
        }

        info!(
            "exfat: formatting {} sectors ({} MB)",
            total_sectors,
            total_sectors * SECTOR_SIZE as u64 / 1024 / 1024
        );

        // Sectors 0..=10 of the boot region; sectors 1..=8 carry the
        // extended boot signature.
        let mut region = vec![0u8; SECTOR_SIZE * BOOT_CHECKSUM_SECTOR as usize];
        region[..SECTOR_SIZE].copy_from_slice(&boot_sector.to_bytes());
        for sector in 1..=8 {
            let end = (sector + 1) * SECTOR_SIZE;
            region[end - 2..end].copy_from_slice(&[0x55, 0xAA]);
        }
        let checksum = boot_checksum(&region);
        let checksum_sector: Vec<u8> = checksum
            .to_le_bytes()
            .iter()
            .copied()
            .cycle()
            .take(SECTOR_SIZE)
            .collect();

        for base in [0, BACKUP_BOOT_SECTOR] {
            for (i, sector) in region.chunks_exact(SECTOR_SIZE).enumerate() {
                device.write_block(base + i as u64, sector)?;
            }
            device.write_block(base + BOOT_CHECKSUM_SECTOR, &checksum_sector)?;
        }

        let zero_block = vec![0u8; SECTOR_SIZE];
        for i in 0..boot_sector.fat_length as u64 {
            device.write_block(boot_sector.fat_offset as u64 + i, &zero_block)?;
        }

        let mut fs = Self::from_parts(device, boot_sector, BITMAP_CLUSTER, bitmap_length);

        fs.write_fat_entry(
            0,
            FatEntry {
                cluster: FAT_MEDIA_DESCRIPTOR,
            },
        )?;
        fs.write_fat_entry(1, FatEntry::END_OF_CHAIN)?;
        fs.write_fat_entry(ROOT_DIR_CLUSTER, FatEntry::END_OF_CHAIN)?;
        for i in 0..bitmap_clusters {
            let cluster = BITMAP_CLUSTER + i;
            let next = if i + 1 == bitmap_clusters {
                FatEntry::END_OF_CHAIN
            } else {
                FatEntry {
                    cluster: cluster + 1,
                }
            };
            fs.write_fat_entry(cluster, next)?;
        }

        let empty_cluster = vec![0u8; CLUSTER_SIZE];
        fs.write_cluster(ROOT_DIR_CLUSTER, &empty_cluster)?;
        for i in 0..bitmap_clusters {
            fs.write_cluster(BITMAP_CLUSTER + i, &empty_cluster)?;
        }
        fs.set_cluster_bit(ROOT_DIR_CLUSTER, true)?;
        for i in 0..bitmap_clusters {
            fs.set_cluster_bit(BITMAP_CLUSTER + i, true)?;
        }

        fs.write_slots(
            ROOT_DIR_CLUSTER,
            0,
            &[
                volume_label_entry(VOLUME_LABEL),
                bitmap_entry(BITMAP_CLUSTER, bitmap_length),
            ],
        )?;

        info!(
            "exfat: format complete, {} clusters of {} bytes",
            boot_sector.cluster_count, CLUSTER_SIZE
        );
        Self::mount(fs.device)
    }

    /// Reads the boot sector and locates the allocation bitmap.
    pub fn mount(device: D) -> Result<Self, FsError> {
        Self::try_mount(device).map_err(|(_, e)| e)
    }

    /// Like [`mount`](Self::mount), but hands the device back on failure so
    /// the caller can format it.
    pub fn try_mount(device: D) -> Result<Self, (D, FsError)> {
        let boot_sector = match Self::check_boot_region(&device) {
            Ok(boot_sector) => boot_sector,
            Err(e) => return Err((device, e)),
        };
        let mut fs = Self::from_parts(device, boot_sector, 0, 0);
        if let Err(e) = fs.locate_bitmap() {
            return Err((fs.device, e));
        }
        info!(
            "exfat: mounted volume {:#010x}: {} clusters, FAT at sector {}, heap at sector {}",
            boot_sector.volume_serial, boot_sector.cluster_count, fs.fat_start, fs.heap_start
        );
        Ok(fs)
    }

    fn check_boot_region(device: &D) -> Result<BootSector, FsError> {
        if device.block_size() != SECTOR_SIZE {
            return Err(FsError::NotSupported);
        }
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        device.read_block(0, &mut sector_data)?;
        let boot_sector = BootSector::from_bytes(&sector_data)?;

        if boot_sector.volume_length > device.total_blocks()
            || boot_sector.cluster_heap_offset as u64
                + boot_sector.cluster_count as u64 * boot_sector.sectors_per_cluster()
                > boot_sector.volume_length
        {
            warn!("exfat: boot sector describes more sectors than the device has");
            return Err(FsError::BadVolume);
        }

        let mut region = vec![0u8; SECTOR_SIZE * BOOT_CHECKSUM_SECTOR as usize];
        for (i, sector) in region.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            device.read_block(i as u64, sector)?;
        }
        device.read_block(BOOT_CHECKSUM_SECTOR, &mut sector_data)?;
        let stored = u32::from_le_bytes([
            sector_data[0],
            sector_data[1],
            sector_data[2],
            sector_data[3],
        ]);
        let computed = boot_checksum(&region);
        if stored != computed {
            warn!(
                "exfat: boot region checksum mismatch (stored {:#010x}, computed {:#010x})",
                stored, computed
            );
        }
        Ok(boot_sector)
    }

    fn locate_bitmap(&mut self) -> Result<(), FsError> {
        let (_, root) = self.read_dir_slots(self.boot_sector.root_dir_cluster)?;
        let (bitmap_cluster, bitmap_length) = root
            .iter()
            .take_while(|entry| !is_end_marker(entry))
            .find_map(parse_bitmap_entry)
            .ok_or(FsError::BadVolume)?;
        if self.check_cluster(bitmap_cluster).is_err()
            || bitmap_length < (self.boot_sector.cluster_count as u64).div_ceil(8)
        {
            warn!("exfat: allocation bitmap entry is corrupt");
            return Err(FsError::BadVolume);
        }
        self.bitmap_cluster = bitmap_cluster;
        self.bitmap_length = bitmap_length;
        Ok(())
    }

    fn from_parts(device: D, boot_sector: BootSector, bitmap_cluster: u32, bitmap_length: u64) -> Self {
        Self {
            device,
            fat_start: boot_sector.fat_offset as u64,
            heap_start: boot_sector.cluster_heap_offset as u64,
            cluster_size: boot_sector.bytes_per_cluster(),
            boot_sector,
            bitmap_cluster,
            bitmap_length,
            fd_counter: 0,
            reuse_fds: BinaryHeap::new(),
            fd_table: Vec::new(),
        }
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot_sector
    }

    pub fn cluster_count(&self) -> u32 {
        self.boot_sector.cluster_count
    }

    pub fn bytes_per_cluster(&self) -> usize {
        self.cluster_size
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Gives the device back. Open handles are dropped.
    pub fn into_device(self) -> D {
        self.device
    }

    fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.heap_start + (cluster - FIRST_CLUSTER) as u64 * self.boot_sector.sectors_per_cluster()
    }

    fn check_cluster(&self, cluster: u32) -> Result<(), FsError> {
        if cluster < FIRST_CLUSTER || cluster as u64 >= self.cluster_count() as u64 + 2 {
            return Err(FsError::IOError);
        }
        Ok(())
    }

    /// Reads one whole cluster. `buf` must be exactly one cluster long.
    pub fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<(), FsError> {
        self.check_cluster(cluster)?;
        if buf.len() != self.cluster_size {
            return Err(FsError::IOError);
        }
        let sector = self.cluster_to_sector(cluster);
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read_block(sector + i as u64, chunk)?;
        }
        Ok(())
    }

    pub fn write_cluster(&mut self, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        self.check_cluster(cluster)?;
        if buf.len() != self.cluster_size {
            return Err(FsError::IOError);
        }
        let sector = self.cluster_to_sector(cluster);
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_block(sector + i as u64, chunk)?;
        }
        Ok(())
    }

    fn fat_position(&self, cluster: u32) -> Result<(u64, usize), FsError> {
        if cluster as u64 >= self.cluster_count() as u64 + 2 {
            return Err(FsError::IOError);
        }
        let offset = cluster as u64 * FAT_ENTRY_SIZE as u64;
        Ok((
            self.fat_start + offset / SECTOR_SIZE as u64,
            (offset % SECTOR_SIZE as u64) as usize,
        ))
    }

    /// FAT entry of `cluster`: the next cluster, free, or end of chain.
    pub fn get_next_cluster(&self, cluster: u32) -> Result<FatEntry, FsError> {
        let (sector, offset) = self.fat_position(cluster)?;
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        self.device.read_block(sector, &mut sector_data)?;

        let entry = u32::from_le_bytes([
            sector_data[offset],
            sector_data[offset + 1],
            sector_data[offset + 2],
            sector_data[offset + 3],
        ]);
        Ok(FatEntry { cluster: entry })
    }

    fn write_fat_entry(&mut self, cluster: u32, entry: FatEntry) -> Result<(), FsError> {
        let (sector, offset) = self.fat_position(cluster)?;
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        self.device.read_block(sector, &mut sector_data)?;
        sector_data[offset..offset + FAT_ENTRY_SIZE].copy_from_slice(&entry.cluster.to_le_bytes());
        self.device.write_block(sector, &sector_data)
    }

    /// Allocation bitmap bit of `cluster`
    pub fn is_cluster_allocated(&self, cluster: u32) -> Result<bool, FsError> {
        let (sector, offset, mask) = self.bitmap_position(cluster)?;
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        self.device.read_block(sector, &mut sector_data)?;
        Ok(sector_data[offset] & mask != 0)
    }

    fn set_cluster_bit(&mut self, cluster: u32, used: bool) -> Result<(), FsError> {
        let (sector, offset, mask) = self.bitmap_position(cluster)?;
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        self.device.read_block(sector, &mut sector_data)?;
        if used {
            sector_data[offset] |= mask;
        } else {
            sector_data[offset] &= !mask;
        }
        self.device.write_block(sector, &sector_data)
    }

    fn bitmap_position(&self, cluster: u32) -> Result<(u64, usize, u8), FsError> {
        self.check_cluster(cluster)?;
        let bit = (cluster - FIRST_CLUSTER) as u64;
        let byte = bit / 8;
        if byte >= self.bitmap_length {
            return Err(FsError::IOError);
        }
        let bitmap_cluster = self
            .cluster_at(self.bitmap_cluster, byte / self.cluster_size as u64)?
            .ok_or(FsError::IOError)?;
        self.check_cluster(bitmap_cluster)?;
        let within = (byte % self.cluster_size as u64) as usize;
        Ok((
            self.cluster_to_sector(bitmap_cluster) + (within / SECTOR_SIZE) as u64,
            within % SECTOR_SIZE,
            1 << (bit % 8),
        ))
    }

    /// Every cluster of the chain starting at `first`, in order.
    fn chain(&self, first: u32) -> Result<Vec<u32>, FsError> {
        let mut clusters = Vec::new();
        let mut cluster = first;
        loop {
            self.check_cluster(cluster)?;
            clusters.push(cluster);
            if clusters.len() > self.cluster_count() as usize {
                warn!("exfat: cluster chain from {} does not terminate", first);
                return Err(FsError::IOError);
            }
            match self.get_next_cluster(cluster)?.next() {
                Some(next) => cluster = next,
                None => return Ok(clusters),
            }
        }
    }

    /// The `index`-th cluster of a chain, or `None` if the chain is shorter.
    fn cluster_at(&self, first: u32, index: u64) -> Result<Option<u32>, FsError> {
        let mut cluster = first;
        for _ in 0..index {
            match self.get_next_cluster(cluster)?.next() {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cluster))
    }

    /// Takes the first free cluster in FAT order, marks it end-of-chain and
    /// zeroes it.
    fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        let limit = self.cluster_count() as u64 + 2;
        let per_sector = (SECTOR_SIZE / FAT_ENTRY_SIZE) as u64;
        let mut sector_data = vec![0u8; SECTOR_SIZE];

        for fat_sector in 0..self.boot_sector.fat_length as u64 {
            self.device
                .read_block(self.fat_start + fat_sector, &mut sector_data)?;
            for (i, entry) in sector_data.chunks_exact(FAT_ENTRY_SIZE).enumerate() {
                let cluster = fat_sector * per_sector + i as u64;
                if cluster < FIRST_CLUSTER as u64 {
                    continue;
                }
                if cluster >= limit {
                    return Err(FsError::NoSpace);
                }
                if entry == [0u8; FAT_ENTRY_SIZE] {
                    let cluster = cluster as u32;
                    self.write_fat_entry(cluster, FatEntry::END_OF_CHAIN)?;
                    self.set_cluster_bit(cluster, true)?;
                    self.write_cluster(cluster, &vec![0u8; self.cluster_size])?;
                    return Ok(cluster);
                }
            }
        }

        Err(FsError::NoSpace)
    }

    /// Appends a fresh cluster after `last`.
    fn extend_chain(&mut self, last: u32) -> Result<u32, FsError> {
        let cluster = self.allocate_cluster()?;
        self.write_fat_entry(last, FatEntry { cluster })?;
        Ok(cluster)
    }

    fn free_chain(&mut self, first: u32) -> Result<(), FsError> {
        for cluster in self.chain(first)? {
            self.write_fat_entry(cluster, FatEntry::FREE)?;
            self.set_cluster_bit(cluster, false)?;
        }
        Ok(())
    }

    /// Clusters whose FAT entry is free
    pub fn free_cluster_count(&self) -> Result<u32, FsError> {
        let mut free = 0;
        for cluster in FIRST_CLUSTER..self.cluster_count() + 2 {
            if self.get_next_cluster(cluster)?.is_free() {
                free += 1;
            }
        }
        Ok(free)
    }

    /// All slots of a directory, with the clusters they live in.
    fn read_dir_slots(&self, dir_cluster: u32) -> Result<(Vec<u32>, Vec<RawEntry>), FsError> {
        let clusters = self.chain(dir_cluster)?;
        let mut cluster_data = vec![0u8; self.cluster_size];
        let mut slots = Vec::with_capacity(clusters.len() * ENTRIES_PER_CLUSTER);
        for &cluster in &clusters {
            self.read_cluster(cluster, &mut cluster_data)?;
            slots.extend(cluster_data.chunks_exact(DIR_ENTRY_SIZE).map(|chunk| {
                let mut entry = [0u8; DIR_ENTRY_SIZE];
                entry.copy_from_slice(chunk);
                entry
            }));
        }
        Ok((clusters, slots))
    }

    /// Sector and byte offset of a directory slot
    fn slot_position(&self, clusters: &[u32], slot: usize) -> Result<(u64, usize), FsError> {
        let cluster = *clusters
            .get(slot / ENTRIES_PER_CLUSTER)
            .ok_or(FsError::IOError)?;
        let byte = (slot % ENTRIES_PER_CLUSTER) * DIR_ENTRY_SIZE;
        Ok((
            self.cluster_to_sector(cluster) + (byte / SECTOR_SIZE) as u64,
            byte % SECTOR_SIZE,
        ))
    }

    fn read_slots(&self, dir_cluster: u32, first: usize, count: usize) -> Result<Vec<RawEntry>, FsError> {
        let clusters = self.chain(dir_cluster)?;
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        let mut entries = Vec::with_capacity(count);
        for slot in first..first + count {
            let (sector, offset) = self.slot_position(&clusters, slot)?;
            self.device.read_block(sector, &mut sector_data)?;
            let mut entry = [0u8; DIR_ENTRY_SIZE];
            entry.copy_from_slice(&sector_data[offset..offset + DIR_ENTRY_SIZE]);
            entries.push(entry);
        }
        Ok(entries)
    }

    fn write_slots(&mut self, dir_cluster: u32, first: usize, entries: &[RawEntry]) -> Result<(), FsError> {
        let clusters = self.chain(dir_cluster)?;
        let mut sector_data = vec![0u8; SECTOR_SIZE];
        for (i, entry) in entries.iter().enumerate() {
            let (sector, offset) = self.slot_position(&clusters, first + i)?;
            self.device.read_block(sector, &mut sector_data)?;
            sector_data[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(entry);
            self.device.write_block(sector, &sector_data)?;
        }
        Ok(())
    }

    /// Every valid entry set in a directory. Corrupt sets are skipped.
    fn scan_dir(&self, dir_cluster: u32) -> Result<Vec<Located>, FsError> {
        let (_, slots) = self.read_dir_slots(dir_cluster)?;
        let mut found = Vec::new();
        let mut i = 0;
        while i < slots.len() {
            let entry = &slots[i];
            if is_end_marker(entry) {
                break;
            }
            if entry_type(entry) == ENTRY_FILE {
                match FileEntrySet::decode(&slots[i..]) {
                    Some(set) => {
                        let count = set.entry_count();
                        found.push(Located {
                            set,
                            location: EntryLocation {
                                dir_cluster,
                                slot: i,
                            },
                        });
                        i += count;
                        continue;
                    }
                    None => warn!(
                        "exfat: skipping corrupt entry set at slot {} of directory {}",
                        i, dir_cluster
                    ),
                }
            }
            i += 1;
        }
        Ok(found)
    }

    fn find_in_dir(&self, dir_cluster: u32, name: &str) -> Result<Located, FsError> {
        self.scan_dir(dir_cluster)?
            .into_iter()
            .find(|located| located.set.name == name)
            .ok_or(FsError::NotFound)
    }

    fn find_entry(&self, path: &str) -> Result<Located, FsError> {
        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = components.split_last() else {
            return Err(FsError::InvalidName);
        };

        let mut dir_cluster = self.boot_sector.root_dir_cluster;
        for component in parents {
            let located = self.find_in_dir(dir_cluster, component)?;
            if !located.set.is_directory() {
                return Err(FsError::NotFound);
            }
            dir_cluster = located.set.first_cluster;
        }
        self.find_in_dir(dir_cluster, last)
    }

    fn resolve_dir(&self, path: &str) -> Result<DirRef, FsError> {
        if is_root(path) {
            return Ok(DirRef {
                cluster: self.boot_sector.root_dir_cluster,
                entry: None,
            });
        }
        let located = self.find_entry(path)?;
        if !located.set.is_directory() {
            return Err(FsError::NotSupported);
        }
        Ok(DirRef {
            cluster: located.set.first_cluster,
            entry: Some(located),
        })
    }

    fn ensure_absent(&self, dir: &DirRef, name: &str) -> Result<(), FsError> {
        match self.find_in_dir(dir.cluster, name) {
            Ok(_) => Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// First slot of a run of `count` unused slots, growing the directory by
    /// one cluster when no run exists.
    fn find_free_run(&mut self, dir: &DirRef, count: usize) -> Result<usize, FsError> {
        let (clusters, slots) = self.read_dir_slots(dir.cluster)?;
        let mut run = 0;
        for (i, entry) in slots.iter().enumerate() {
            if is_in_use(entry) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Ok(i + 1 - count);
            }
        }

        // The trailing run continues into the new cluster.
        let last = *clusters.last().ok_or(FsError::IOError)?;
        self.extend_chain(last)?;
        if let Some(located) = &dir.entry {
            let mut set = located.set.clone();
            set.data_length += self.cluster_size as u64;
            set.valid_data_length = set.data_length;
            self.write_set(located.location, &set)?;
        }
        debug!("exfat: directory {} grew to {} clusters", dir.cluster, clusters.len() + 1);
        Ok(slots.len() - run)
    }

    fn read_set(&self, location: EntryLocation) -> Result<FileEntrySet, FsError> {
        let first = self.read_slots(location.dir_cluster, location.slot, 1)?;
        let count = 1 + first[0][1] as usize;
        let entries = self.read_slots(location.dir_cluster, location.slot, count)?;
        FileEntrySet::decode(&entries).ok_or(FsError::IOError)
    }

    fn write_set(&mut self, location: EntryLocation, set: &FileEntrySet) -> Result<(), FsError> {
        self.write_slots(location.dir_cluster, location.slot, &set.encode())
    }

    /// Clears the in-use bit of every entry in the set.
    fn mark_deleted(&mut self, location: EntryLocation, count: usize) -> Result<(), FsError> {
        let mut entries = self.read_slots(location.dir_cluster, location.slot, count)?;
        for entry in &mut entries {
            entry[0] &= !ENTRY_IN_USE;
        }
        self.write_slots(location.dir_cluster, location.slot, &entries)
    }

    fn create_entry(&mut self, path: &str, is_dir: bool) -> Result<(), FsError> {
        let (parent_path, name) = split_path(path);
        validate_name(name)?;

        let dir = self.resolve_dir(parent_path)?;
        self.ensure_absent(&dir, name)?;

        let cluster = self.allocate_cluster()?;
        let set = if is_dir {
            FileEntrySet::new_directory(name, cluster)?
        } else {
            FileEntrySet::new_file(name, cluster)?
        };

        let slot = match self.find_free_run(&dir, set.entry_count()) {
            Ok(slot) => slot,
            Err(e) => {
                self.free_chain(cluster)?;
                return Err(e);
            }
        };
        self.write_set(
            EntryLocation {
                dir_cluster: dir.cluster,
                slot,
            },
            &set,
        )?;

        debug!("exfat: created {} at cluster {}", path, cluster);
        Ok(())
    }

    fn remove_entry(&mut self, path: &str, is_dir: bool) -> Result<(), FsError> {
        let located = self.find_entry(path)?;

        if located.set.is_directory() != is_dir {
            return Err(FsError::NotSupported);
        }
        if is_dir && !self.scan_dir(located.set.first_cluster)?.is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }
        if self
            .fd_table
            .iter()
            .any(|file| file.valid && file.entry == located.location)
        {
            return Err(FsError::Busy);
        }

        self.mark_deleted(located.location, located.set.entry_count())?;
        if located.set.first_cluster != 0 {
            self.free_chain(located.set.first_cluster)?;
        }

        debug!("exfat: removed {}", path);
        Ok(())
    }

    fn file(&self, fd: usize) -> Result<&ExFatFile, FsError> {
        self.fd_table
            .get(fd)
            .filter(|file| file.valid)
            .ok_or(FsError::InvalidHandle)
    }

    fn file_mut(&mut self, fd: usize) -> Result<&mut ExFatFile, FsError> {
        self.fd_table
            .get_mut(fd)
            .filter(|file| file.valid)
            .ok_or(FsError::InvalidHandle)
    }

    /// Writes `buf` at the handle's position, extending the chain as needed.
    /// The position advances with every completed chunk.
    fn write_at(&mut self, file: &mut ExFatFile, buf: &[u8]) -> Result<(), FsError> {
        let cluster_size = self.cluster_size;

        let mut cluster = file.first_cluster;
        for _ in 0..file.position / cluster_size as u64 {
            cluster = match self.get_next_cluster(cluster)?.next() {
                Some(next) => next,
                None => self.extend_chain(cluster)?,
            };
        }

        let mut cluster_data = vec![0u8; cluster_size];
        let mut written = 0;
        while written < buf.len() {
            let cluster_offset = (file.position % cluster_size as u64) as usize;
            let chunk_size = min(cluster_size - cluster_offset, buf.len() - written);

            if chunk_size < cluster_size {
                self.read_cluster(cluster, &mut cluster_data)?;
            }
            cluster_data[cluster_offset..cluster_offset + chunk_size]
                .copy_from_slice(&buf[written..written + chunk_size]);
            self.write_cluster(cluster, &cluster_data)?;

            written += chunk_size;
            file.position += chunk_size as u64;

            if written < buf.len() {
                cluster = match self.get_next_cluster(cluster)?.next() {
                    Some(next) => next,
                    None => self.extend_chain(cluster)?,
                };
            }
        }
        Ok(())
    }

    /// Patches the stream entry of an open file in place.
    fn update_directory_entry(&mut self, file: &ExFatFile) -> Result<(), FsError> {
        let mut set = self.read_set(file.entry)?;
        set.first_cluster = file.first_cluster;
        set.valid_data_length = file.size;
        set.data_length = file.size;
        self.write_set(file.entry, &set)
    }

    fn metadata_of(&self, set: &FileEntrySet) -> FileMetadata {
        FileMetadata {
            size: set.data_length,
            is_dir: set.is_directory(),
            first_cluster: set.first_cluster,
            permissions: FilePermissions {
                readable: true,
                writable: !set.is_read_only(),
                executable: false,
            },
        }
    }

    /// Whether `path` names an existing file or directory.
    pub fn exists(&self, path: &str) -> bool {
        self.find_entry(path).is_ok()
    }

    /// Reads a whole file.
    pub fn read_to_vec(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        let fd = self.open_file(path)?;
        let size = self.file(fd)?.size as usize;
        let mut data = vec![0u8; size];
        let result = self.read_file(fd, &mut data);
        self.close_file(fd)?;
        data.truncate(result?);
        Ok(data)
    }

    /// Creates `path`, replacing any existing file, and fills it with `data`.
    /// Returns the number of bytes stored.
    ///
    /// The data goes to a `.tmp` sibling first and is renamed over `path`
    /// only after a full-length write, so a full volume leaves the old
    /// contents in place.
    pub fn write_new(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        let staging = format!("{}{}", path, STAGING_SUFFIX);
        match self.remove_file(&staging) {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.create_file(&staging)?;
        let written = match self.write_staged(&staging, data) {
            Ok(n) if n == data.len() => n,
            other => {
                if let Err(e) = self.remove_file(&staging) {
                    warn!("exfat: could not drop {}: {}", staging, e);
                }
                return Err(other.err().unwrap_or(FsError::NoSpace));
            }
        };

        match self.remove_file(path) {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.rename(&staging, path)?;
        Ok(written)
    }

    fn write_staged(&mut self, path: &str, data: &[u8]) -> Result<usize, FsError> {
        let fd = self.open_file(path)?;
        let result = self.write_file(fd, data);
        self.close_file(fd)?;
        result
    }

    /// Creates every missing directory along `path`.
    pub fn create_dir_all(&mut self, path: &str) -> Result<(), FsError> {
        let mut prefix = String::new();
        for component in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(component);
            match self.create_dir(&prefix) {
                Ok(()) | Err(FsError::AlreadyExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> FileSystem for ExFat<D> {
    fn create_file(&mut self, path: &str) -> Result<(), FsError> {
        self.create_entry(path, false)
    }

    fn create_dir(&mut self, path: &str) -> Result<(), FsError> {
        self.create_entry(path, true)
    }

    fn remove_file(&mut self, path: &str) -> Result<(), FsError> {
        self.remove_entry(path, false)
    }

    fn remove_dir(&mut self, path: &str) -> Result<(), FsError> {
        self.remove_entry(path, true)
    }

    fn open_file(&mut self, path: &str) -> Result<usize, FsError> {
        let located = self.find_entry(path)?;

        if located.set.is_directory() {
            return Err(FsError::NotSupported);
        }

        let file = ExFatFile {
            valid: true,
            first_cluster: located.set.first_cluster,
            position: 0,
            size: located.set.data_length,
            attributes: located.set.attributes,
            entry: located.location,
        };

        let fd = if let Some(Reverse(reused_fd)) = self.reuse_fds.pop() {
            self.fd_table[reused_fd] = file;
            reused_fd
        } else {
            let new_fd = self.fd_counter;
            self.fd_table.push(file);
            self.fd_counter += 1;
            new_fd
        };

        Ok(fd)
    }

    fn close_file(&mut self, fd: usize) -> Result<(), FsError> {
        let file = self.file_mut(fd)?;
        *file = ExFatFile::closed();
        self.reuse_fds.push(Reverse(fd));
        Ok(())
    }

    fn read_file(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let file = self.file(fd)?.clone();
        let cluster_size = self.cluster_size;

        if file.position >= file.size || buf.is_empty() {
            return Ok(0);
        }
        let bytes_to_read = min(buf.len() as u64, file.size - file.position) as usize;

        let Some(mut cluster) =
            self.cluster_at(file.first_cluster, file.position / cluster_size as u64)?
        else {
            return Ok(0);
        };

        let mut cluster_data = vec![0u8; cluster_size];
        let mut bytes_read = 0;
        let mut position = file.position;
        while bytes_read < bytes_to_read {
            let cluster_offset = (position % cluster_size as u64) as usize;
            let chunk_size = min(cluster_size - cluster_offset, bytes_to_read - bytes_read);

            self.read_cluster(cluster, &mut cluster_data)?;
            buf[bytes_read..bytes_read + chunk_size]
                .copy_from_slice(&cluster_data[cluster_offset..cluster_offset + chunk_size]);

            bytes_read += chunk_size;
            position += chunk_size as u64;

            if bytes_read < bytes_to_read {
                match self.get_next_cluster(cluster)?.next() {
                    Some(next) => cluster = next,
                    None => break,
                }
            }
        }

        self.file_mut(fd)?.position = position;
        Ok(bytes_read)
    }

    /// Short writes are reported as the byte count stored before the failure.
    fn write_file(&mut self, fd: usize, buf: &[u8]) -> Result<usize, FsError> {
        let mut file = self.file(fd)?.clone();
        if buf.is_empty() {
            return Ok(0);
        }

        let start = file.position;
        let old_size = file.size;
        let old_first = file.first_cluster;

        let mut result = Ok(());
        if file.first_cluster == 0 {
            match self.allocate_cluster() {
                Ok(cluster) => file.first_cluster = cluster,
                Err(e) => result = Err(e),
            }
        }
        if result.is_ok() {
            result = self.write_at(&mut file, buf);
        }
        let written = (file.position - start) as usize;
        file.size = max(file.size, file.position);

        if file.size != old_size || file.first_cluster != old_first {
            if let Err(e) = self.update_directory_entry(&file) {
                warn!("exfat: could not record new size of fd {}: {}", fd, e);
            }
        }
        *self.file_mut(fd)? = file;

        match result {
            Err(e) if written == 0 => Err(e),
            _ => Ok(written),
        }
    }

    /// Positions are not checked against the file size. Reading past the end
    /// yields nothing; writing past it zero-fills the gap.
    fn seek_file(&mut self, fd: usize, pos: SeekFrom) -> Result<u64, FsError> {
        let file = self.file_mut(fd)?;

        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(offset) => file
                .size
                .checked_add_signed(offset)
                .ok_or(FsError::InvalidOffset)?,
            SeekFrom::Current(offset) => file
                .position
                .checked_add_signed(offset)
                .ok_or(FsError::InvalidOffset)?,
        };

        file.position = new_pos;
        Ok(new_pos)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.resolve_dir(path)?;
        Ok(self
            .scan_dir(dir.cluster)?
            .into_iter()
            .map(|located| DirEntry {
                metadata: self.metadata_of(&located.set),
                name: located.set.name,
            })
            .collect())
    }

    fn metadata(&self, path: &str) -> Result<FileMetadata, FsError> {
        if !is_root(path) {
            return Ok(self.metadata_of(&self.find_entry(path)?.set));
        }
        let root = self.boot_sector.root_dir_cluster;
        Ok(FileMetadata {
            size: (self.chain(root)?.len() * self.cluster_size) as u64,
            is_dir: true,
            first_cluster: root,
            permissions: FilePermissions {
                readable: true,
                writable: true,
                executable: false,
            },
        })
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let source = self.find_entry(from)?;

        let (parent_path, new_name) = split_path(to);
        validate_name(new_name)?;

        // A directory cannot move below itself.
        let from_components: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
        let to_components: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
        if source.set.is_directory() && to_components.starts_with(&from_components) {
            return Err(FsError::InvalidName);
        }

        let dir = self.resolve_dir(parent_path)?;
        self.ensure_absent(&dir, new_name)?;

        let mut set = source.set.clone();
        set.name = String::from(new_name);
        let slot = self.find_free_run(&dir, set.entry_count())?;
        let target = EntryLocation {
            dir_cluster: dir.cluster,
            slot,
        };
        self.write_set(target, &set)?;
        self.mark_deleted(source.location, source.set.entry_count())?;

        for file in self.fd_table.iter_mut() {
            if file.valid && file.entry == source.location {
                file.entry = target;
            }
        }

        debug!("exfat: renamed {} to {}", from, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::block::MemoryBlockDevice;

    const TEN_MB_SECTORS: u64 = 10 * 1024 * 1024 / 512;

    fn volume() -> ExFat<MemoryBlockDevice> {
        ExFat::format(MemoryBlockDevice::new(TEN_MB_SECTORS, 512), DEFAULT_VOLUME_SERIAL).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn chain_length<D: BlockDevice>(fs: &ExFat<D>, first: u32) -> usize {
        let mut cluster = first;
        for steps in 1..=fs.cluster_count() as usize {
            let entry = fs.get_next_cluster(cluster).unwrap();
            if entry.cluster >= 0xFFFF_FFF8 {
                return steps;
            }
            assert!(!entry.is_free(), "chain runs into a free cluster");
            cluster = entry.cluster;
        }
        panic!("chain from {} does not terminate", first);
    }

    #[test]
    fn test_format_layout() {
        let fs = volume();
        let image = fs.device().image();

        assert_eq!(&image[3..11], b"EXFAT   ");
        // Backup boot region mirrors the main one, checksum sector included.
        assert_eq!(&image[..12 * 512], &image[12 * 512..24 * 512]);
        let checksum = boot_checksum(&image[..11 * 512]);
        assert_eq!(&image[11 * 512..11 * 512 + 4], &checksum.to_le_bytes());
        assert_eq!(&image[12 * 512 - 4..12 * 512], &checksum.to_le_bytes());

        assert_eq!(fs.get_next_cluster(0).unwrap().cluster, 0xFFFF_FFF8);
        assert_eq!(fs.get_next_cluster(1).unwrap(), FatEntry::END_OF_CHAIN);
        assert_eq!(fs.get_next_cluster(2).unwrap(), FatEntry::END_OF_CHAIN);
        assert_eq!(fs.get_next_cluster(3).unwrap(), FatEntry::END_OF_CHAIN);
        assert!(fs.get_next_cluster(4).unwrap().is_free());

        assert!(fs.is_cluster_allocated(2).unwrap());
        assert!(fs.is_cluster_allocated(3).unwrap());
        assert!(!fs.is_cluster_allocated(4).unwrap());

        let mut root = vec![0u8; 4096];
        fs.read_cluster(2, &mut root).unwrap();
        assert_eq!(root[0], 0x83);
        assert_eq!(root[1], 6);
        assert_eq!(root[32], 0x81);
        assert_eq!(&root[32 + 20..32 + 24], &3u32.to_le_bytes());
        let bitmap_len = (fs.cluster_count() as u64 + 7) / 8;
        assert_eq!(&root[32 + 24..32 + 32], &bitmap_len.to_le_bytes());
        assert_eq!(root[64], 0x00);
    }

    #[test]
    fn test_mount_rejects_blank_and_small_devices() {
        let blank = MemoryBlockDevice::new(TEN_MB_SECTORS, 512);
        assert!(matches!(ExFat::mount(blank), Err(FsError::BadVolume)));

        match ExFat::try_mount(MemoryBlockDevice::new(64, 512)) {
            Err((device, FsError::BadVolume)) => assert_eq!(device.total_blocks(), 64),
            _ => panic!("blank device mounted"),
        }

        let tiny = MemoryBlockDevice::new(30, 512);
        assert!(matches!(
            ExFat::format(tiny, DEFAULT_VOLUME_SERIAL),
            Err(FsError::NoSpace)
        ));

        let odd = MemoryBlockDevice::new(1024, 1024);
        assert!(matches!(
            ExFat::format(odd, DEFAULT_VOLUME_SERIAL),
            Err(FsError::NotSupported)
        ));
    }

    #[test]
    fn test_mount_tolerates_checksum_mismatch() {
        let fs = volume();
        let mut image = fs.into_device().image().to_vec();
        image[11 * 512] ^= 0xFF;
        let fs = ExFat::mount(MemoryBlockDevice::from_image(image, 512)).unwrap();
        assert_eq!(fs.cluster_count(), (TEN_MB_SECTORS as u32 - 44) / 8);
    }

    #[test]
    fn test_cluster_io_bounds() {
        let mut fs = volume();
        let mut buf = vec![0u8; 4096];
        let limit = fs.cluster_count() + 2;
        assert_eq!(fs.read_cluster(0, &mut buf), Err(FsError::IOError));
        assert_eq!(fs.read_cluster(1, &mut buf), Err(FsError::IOError));
        assert_eq!(fs.read_cluster(limit, &mut buf), Err(FsError::IOError));
        assert_eq!(fs.write_cluster(limit, &buf), Err(FsError::IOError));
        assert!(fs.read_cluster(limit - 1, &mut buf).is_ok());
        assert_eq!(fs.read_cluster(5, &mut buf[..100]), Err(FsError::IOError));
    }

    #[test]
    fn test_write_seek_read_10000_bytes() {
        let mut fs = volume();
        fs.create_file("/test.txt").unwrap();
        let fd = fs.open_file("/test.txt").unwrap();

        let data = pattern(10000);
        assert_eq!(fs.write_file(fd, &data).unwrap(), 10000);
        assert_eq!(fs.seek_file(fd, SeekFrom::Start(0)).unwrap(), 0);

        let mut back = vec![0u8; 10000];
        assert_eq!(fs.read_file(fd, &mut back).unwrap(), 10000);
        assert_eq!(back, data);
        fs.close_file(fd).unwrap();

        let meta = fs.metadata("/test.txt").unwrap();
        assert_eq!(meta.size, 10000);
        assert!(!meta.is_dir);
        assert_eq!(chain_length(&fs, meta.first_cluster), 3);
    }

    #[test]
    fn test_chains_terminate_and_match_bitmap() {
        let mut fs = volume();
        for (i, len) in [0usize, 1, 4096, 4097, 12288, 30000].iter().enumerate() {
            let path = alloc::format!("/f{i}");
            fs.write_new(&path, &pattern(*len)).unwrap();
            let meta = fs.metadata(&path).unwrap();
            let clusters = chain_length(&fs, meta.first_cluster);
            assert_eq!(clusters, len.div_ceil(4096).max(1));

            let mut cluster = meta.first_cluster;
            loop {
                assert!(fs.is_cluster_allocated(cluster).unwrap());
                match fs.get_next_cluster(cluster).unwrap().next() {
                    Some(next) => cluster = next,
                    None => break,
                }
            }
        }
    }

    #[test]
    fn test_read_clamps_at_eof() {
        let mut fs = volume();
        fs.write_new("/short", b"hello").unwrap();
        let fd = fs.open_file("/short").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 0);

        assert_eq!(fs.seek_file(fd, SeekFrom::Start(100)).unwrap(), 100);
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 0);

        assert_eq!(fs.seek_file(fd, SeekFrom::End(-2)).unwrap(), 3);
        assert_eq!(fs.read_file(fd, &mut buf).unwrap(), 2);
        assert_eq!(
            fs.seek_file(fd, SeekFrom::Current(-100)),
            Err(FsError::InvalidOffset)
        );
    }

    #[test]
    fn test_write_past_eof_zero_fills() {
        let mut fs = volume();
        fs.write_new("/sparse", b"ab").unwrap();
        let fd = fs.open_file("/sparse").unwrap();
        fs.seek_file(fd, SeekFrom::Start(5000)).unwrap();
        assert_eq!(fs.write_file(fd, b"z").unwrap(), 1);
        fs.close_file(fd).unwrap();

        let data = fs.read_to_vec("/sparse").unwrap();
        assert_eq!(data.len(), 5001);
        assert_eq!(&data[..2], b"ab");
        assert!(data[2..5000].iter().all(|&b| b == 0));
        assert_eq!(data[5000], b'z');
    }

    #[test]
    fn test_overwrite_in_middle_keeps_size() {
        let mut fs = volume();
        fs.write_new("/f", &pattern(9000)).unwrap();
        let fd = fs.open_file("/f").unwrap();
        fs.seek_file(fd, SeekFrom::Start(4090)).unwrap();
        fs.write_file(fd, &[0xEE; 12]).unwrap();
        fs.close_file(fd).unwrap();

        let data = fs.read_to_vec("/f").unwrap();
        let mut expected = pattern(9000);
        expected[4090..4102].fill(0xEE);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut fs = volume();
        fs.create_file("/a").unwrap();
        assert_eq!(fs.create_file("/a"), Err(FsError::AlreadyExists));
        assert_eq!(fs.create_dir("/a"), Err(FsError::AlreadyExists));
        assert_eq!(fs.read_dir("/").unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_names() {
        let mut fs = volume();
        assert_eq!(fs.create_file("/"), Err(FsError::InvalidName));
        assert_eq!(fs.create_file("/a:b"), Err(FsError::InvalidName));
        assert_eq!(fs.open_file(""), Err(FsError::InvalidName));
        assert_eq!(fs.create_file("/missing/x"), Err(FsError::NotFound));
    }

    #[test]
    fn test_remount_keeps_files() {
        let mut fs = volume();
        fs.create_dir("/docs").unwrap();
        fs.write_new("/docs/note", b"persisted").unwrap();

        let mut fs = ExFat::mount(fs.into_device()).unwrap();
        assert_eq!(fs.read_to_vec("/docs/note").unwrap(), b"persisted");
        assert!(fs.metadata("/docs").unwrap().is_dir);
    }

    #[test]
    fn test_nested_directories() {
        let mut fs = volume();
        fs.create_dir_all("/views/apps").unwrap();
        fs.create_dir_all("/views/apps").unwrap();
        fs.write_new("/views/apps/myapp", b"0000000000000001").unwrap();

        let listing = fs.read_dir("/views").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "apps");
        assert!(listing[0].metadata.is_dir);

        assert_eq!(fs.open_file("/views/apps"), Err(FsError::NotSupported));
        assert_eq!(fs.read_dir("/views/apps/myapp"), Err(FsError::NotSupported));
        assert_eq!(fs.create_file("/views/apps/myapp/x"), Err(FsError::NotSupported));
    }

    #[test]
    fn test_directory_grows_past_one_cluster() {
        let mut fs = volume();
        // 3 slots each; 128 slots per cluster.
        for i in 0..100 {
            fs.create_file(&alloc::format!("/file{i:03}")).unwrap();
        }
        let root = fs.metadata("/").unwrap();
        assert!(root.size >= 3 * 4096);

        let names: Vec<String> = fs.read_dir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names.len(), 100);
        assert_eq!(names[99], "file099");

        fs.write_new("/file099", b"last").unwrap();
        assert_eq!(fs.read_to_vec("/file099").unwrap(), b"last");

        // Subdirectories grow too and record their length.
        fs.create_dir("/sub").unwrap();
        for i in 0..50 {
            fs.create_file(&alloc::format!("/sub/entry{i}")).unwrap();
        }
        assert_eq!(fs.metadata("/sub").unwrap().size, 2 * 4096);
        assert_eq!(fs.read_dir("/sub").unwrap().len(), 50);
    }

    #[test]
    fn test_remove_file_frees_clusters() {
        let mut fs = volume();
        let free_before = fs.free_cluster_count().unwrap();

        fs.write_new("/big", &pattern(20000)).unwrap();
        let first = fs.metadata("/big").unwrap().first_cluster;
        assert_eq!(fs.free_cluster_count().unwrap(), free_before - 5);

        fs.remove_file("/big").unwrap();
        assert_eq!(fs.free_cluster_count().unwrap(), free_before);
        assert!(!fs.is_cluster_allocated(first).unwrap());
        assert_eq!(fs.open_file("/big"), Err(FsError::NotFound));
        assert_eq!(fs.remove_file("/big"), Err(FsError::NotFound));

        // The deleted slots are reused.
        fs.create_file("/new").unwrap();
        let mut root = vec![0u8; 4096];
        fs.read_cluster(2, &mut root).unwrap();
        assert_eq!(root[64], 0x85);
        assert_eq!(root[64 + 96], 0x00);
    }

    #[test]
    fn test_remove_dir_rules() {
        let mut fs = volume();
        fs.create_dir("/d").unwrap();
        fs.create_file("/d/f").unwrap();

        assert_eq!(fs.remove_file("/d"), Err(FsError::NotSupported));
        assert_eq!(fs.remove_dir("/d/f"), Err(FsError::NotSupported));
        assert_eq!(fs.remove_dir("/d"), Err(FsError::DirectoryNotEmpty));

        fs.remove_file("/d/f").unwrap();
        fs.remove_dir("/d").unwrap();
        assert!(!fs.exists("/d"));
    }

    #[test]
    fn test_remove_open_file_refused() {
        let mut fs = volume();
        fs.create_file("/open").unwrap();
        let fd = fs.open_file("/open").unwrap();
        assert_eq!(fs.remove_file("/open"), Err(FsError::Busy));
        fs.close_file(fd).unwrap();
        fs.remove_file("/open").unwrap();
    }

    #[test]
    fn test_rename_keeps_data_and_handles() {
        let mut fs = volume();
        fs.write_new("/old", b"content").unwrap();
        fs.create_dir("/dir").unwrap();
        fs.create_file("/taken").unwrap();

        let fd = fs.open_file("/old").unwrap();
        fs.rename("/old", "/dir/a_much_longer_name_than_before").unwrap();
        fs.seek_file(fd, SeekFrom::End(0)).unwrap();
        fs.write_file(fd, b"+more").unwrap();
        fs.close_file(fd).unwrap();

        assert!(!fs.exists("/old"));
        assert_eq!(
            fs.read_to_vec("/dir/a_much_longer_name_than_before").unwrap(),
            b"content+more"
        );

        assert_eq!(fs.rename("/taken", "/dir/a_much_longer_name_than_before"), Err(FsError::AlreadyExists));
        assert_eq!(fs.rename("/missing", "/x"), Err(FsError::NotFound));
        assert_eq!(fs.rename("/dir", "/dir/inner"), Err(FsError::InvalidName));
    }

    #[test]
    fn test_fd_reuse_lowest_first() {
        let mut fs = volume();
        for name in ["/a", "/b", "/c"] {
            fs.create_file(name).unwrap();
        }
        let fds: Vec<usize> = ["/a", "/b", "/c"]
            .iter()
            .map(|name| fs.open_file(name).unwrap())
            .collect();
        assert_eq!(fds, [0, 1, 2]);

        fs.close_file(1).unwrap();
        fs.close_file(0).unwrap();
        assert_eq!(fs.open_file("/c").unwrap(), 0);
        assert_eq!(fs.open_file("/c").unwrap(), 1);
        assert_eq!(fs.open_file("/c").unwrap(), 3);
    }

    #[test]
    fn test_invalid_handles() {
        let mut fs = volume();
        fs.create_file("/a").unwrap();
        let fd = fs.open_file("/a").unwrap();
        fs.close_file(fd).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(fs.close_file(fd), Err(FsError::InvalidHandle));
        assert_eq!(fs.read_file(fd, &mut buf), Err(FsError::InvalidHandle));
        assert_eq!(fs.write_file(7, b"x"), Err(FsError::InvalidHandle));
        assert_eq!(fs.seek_file(7, SeekFrom::Start(0)), Err(FsError::InvalidHandle));
    }

    #[test]
    fn test_full_volume_short_write() {
        // 73 sectors: one FAT sector, six clusters. Root and bitmap leave four.
        let mut fs = ExFat::format(MemoryBlockDevice::new(73, 512), 1).unwrap();
        assert_eq!(fs.cluster_count(), 6);
        assert_eq!(fs.free_cluster_count().unwrap(), 4);

        fs.create_file("/fill").unwrap();
        let fd = fs.open_file("/fill").unwrap();
        assert_eq!(fs.write_file(fd, &pattern(5 * 4096)).unwrap(), 4 * 4096);
        assert_eq!(fs.write_file(fd, b"more"), Err(FsError::NoSpace));
        fs.close_file(fd).unwrap();

        assert_eq!(fs.metadata("/fill").unwrap().size, 4 * 4096);
        assert_eq!(fs.free_cluster_count().unwrap(), 0);
        assert_eq!(fs.create_file("/other"), Err(FsError::NoSpace));
        assert_eq!(fs.read_to_vec("/fill").unwrap(), pattern(4 * 4096));
    }

    #[test]
    fn test_write_new_keeps_old_contents_when_full() {
        let mut fs = ExFat::format(MemoryBlockDevice::new(73, 512), 1).unwrap();
        assert_eq!(fs.write_new("/a", &pattern(4096)).unwrap(), 4096);
        assert_eq!(fs.free_cluster_count().unwrap(), 3);

        fs.create_file("/fill").unwrap();
        let fd = fs.open_file("/fill").unwrap();
        assert_eq!(fs.write_file(fd, &pattern(2 * 4096)).unwrap(), 2 * 4096);
        fs.close_file(fd).unwrap();

        // The replacement fits partly, then the volume runs out.
        assert_eq!(fs.write_new("/a", &[7u8; 3 * 4096]), Err(FsError::NoSpace));
        assert_eq!(fs.read_to_vec("/a").unwrap(), pattern(4096));
        assert!(!fs.exists("/a.tmp"));
        assert_eq!(fs.free_cluster_count().unwrap(), 1);

        // A replacement that fits goes through.
        assert_eq!(fs.write_new("/a", b"short").unwrap(), 5);
        assert_eq!(fs.read_to_vec("/a").unwrap(), b"short");
        assert!(!fs.exists("/a.tmp"));
    }

    #[test]
    fn test_mount_rejects_bad_bitmap_cluster() {
        let fs = volume();
        let root = fs.boot_sector().root_dir_cluster;
        let root_sector = fs.cluster_to_sector(root) as usize;
        let mut image = fs.into_device().image().to_vec();

        let slot = (0..ENTRIES_PER_CLUSTER)
            .map(|i| root_sector * SECTOR_SIZE + i * DIR_ENTRY_SIZE)
            .find(|&at| image[at] == ENTRY_ALLOCATION_BITMAP)
            .unwrap();
        image[slot + 20..slot + 24].copy_from_slice(&0u32.to_le_bytes());

        let device = MemoryBlockDevice::from_image(image, 512);
        assert!(matches!(ExFat::mount(device), Err(FsError::BadVolume)));
    }
}
