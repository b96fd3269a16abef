//! exFAT directory entries and entry sets

use super::constants::*;
use crate::filesys::FsError;
use alloc::string::String;
use alloc::vec::Vec;

/// One 32-byte directory slot
pub type RawEntry = [u8; DIR_ENTRY_SIZE];

pub fn entry_type(entry: &RawEntry) -> u8 {
    entry[0]
}

/// Slot holds a live entry of some kind
pub fn is_in_use(entry: &RawEntry) -> bool {
    entry[0] & ENTRY_IN_USE != 0
}

/// Slot past the last entry of the directory
pub fn is_end_marker(entry: &RawEntry) -> bool {
    entry[0] == ENTRY_END_OF_DIRECTORY
}

fn u16_at(entry: &RawEntry, at: usize) -> u16 {
    u16::from_le_bytes([entry[at], entry[at + 1]])
}

fn u32_at(entry: &RawEntry, at: usize) -> u32 {
    u32::from_le_bytes([entry[at], entry[at + 1], entry[at + 2], entry[at + 3]])
}

fn u64_at(entry: &RawEntry, at: usize) -> u64 {
    u32_at(entry, at) as u64 | (u32_at(entry, at + 4) as u64) << 32
}

/// A File entry with its Stream Extension and File Name entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntrySet {
    /// File attributes (read-only, directory, etc)
    pub attributes: u16,
    pub name: String,
    /// First cluster of the data chain
    pub first_cluster: u32,
    pub valid_data_length: u64,
    pub data_length: u64,
}

impl FileEntrySet {
    /// Creates an empty file entry with given name and starting cluster
    pub fn new_file(name: &str, first_cluster: u32) -> Result<Self, FsError> {
        validate_name(name)?;
        Ok(Self {
            attributes: ATTR_ARCHIVE,
            name: String::from(name),
            first_cluster,
            valid_data_length: 0,
            data_length: 0,
        })
    }

    /// Creates a directory entry spanning one cluster
    pub fn new_directory(name: &str, first_cluster: u32) -> Result<Self, FsError> {
        let mut set = Self::new_file(name, first_cluster)?;
        set.attributes = ATTR_DIRECTORY;
        set.valid_data_length = CLUSTER_SIZE as u64;
        set.data_length = CLUSTER_SIZE as u64;
        Ok(set)
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.attributes & ATTR_READ_ONLY != 0
    }

    /// Slots taken by this set: File + Stream + one per 15 name characters
    pub fn entry_count(&self) -> usize {
        entry_count_for(&self.name)
    }

    /// Encodes the set with its checksum filled in
    pub fn encode(&self) -> Vec<RawEntry> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        let name_entries = units.len().div_ceil(NAME_CHARS_PER_ENTRY);
        let mut entries = Vec::with_capacity(2 + name_entries);

        let mut file = [0u8; DIR_ENTRY_SIZE];
        file[0] = ENTRY_FILE;
        file[1] = (1 + name_entries) as u8;
        file[4..6].copy_from_slice(&self.attributes.to_le_bytes());
        entries.push(file);

        let mut stream = [0u8; DIR_ENTRY_SIZE];
        stream[0] = ENTRY_STREAM;
        stream[1] = STREAM_ALLOCATION_POSSIBLE;
        stream[3] = units.len() as u8;
        stream[4..6].copy_from_slice(&name_hash(&units).to_le_bytes());
        stream[8..16].copy_from_slice(&self.valid_data_length.to_le_bytes());
        stream[20..24].copy_from_slice(&self.first_cluster.to_le_bytes());
        stream[24..32].copy_from_slice(&self.data_length.to_le_bytes());
        entries.push(stream);

        for chunk in units.chunks(NAME_CHARS_PER_ENTRY) {
            let mut name = [0u8; DIR_ENTRY_SIZE];
            name[0] = ENTRY_FILE_NAME;
            for (i, unit) in chunk.iter().enumerate() {
                name[2 + 2 * i..4 + 2 * i].copy_from_slice(&unit.to_le_bytes());
            }
            entries.push(name);
        }

        let checksum = entry_set_checksum(&entries);
        entries[0][2..4].copy_from_slice(&checksum.to_le_bytes());
        entries
    }

    /// Decodes a set starting at a File entry. Returns `None` for a
    /// truncated set, an unexpected secondary entry or a checksum mismatch.
    pub fn decode(entries: &[RawEntry]) -> Option<Self> {
        let file = entries.first()?;
        if entry_type(file) != ENTRY_FILE {
            return None;
        }
        let count = 1 + file[1] as usize;
        let set = entries.get(..count)?;
        if count < 3
            || entry_type(&set[1]) != ENTRY_STREAM
            || set[2..].iter().any(|e| entry_type(e) != ENTRY_FILE_NAME)
            || entry_set_checksum(set) != u16_at(file, 2)
        {
            return None;
        }

        let stream = &set[1];
        let name_length = stream[3] as usize;
        let units: Vec<u16> = set[2..]
            .iter()
            .flat_map(|e| (0..NAME_CHARS_PER_ENTRY).map(move |i| u16_at(e, 2 + 2 * i)))
            .take(name_length)
            .collect();
        if units.len() != name_length {
            return None;
        }
        let name = char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();

        Some(Self {
            attributes: u16_at(file, 4),
            name,
            first_cluster: u32_at(stream, 20),
            valid_data_length: u64_at(stream, 8),
            data_length: u64_at(stream, 24),
        })
    }
}

/// Slots needed for an entry set named `name`
pub fn entry_count_for(name: &str) -> usize {
    2 + name.encode_utf16().count().div_ceil(NAME_CHARS_PER_ENTRY)
}

/// Checks length and characters of a single path component.
pub fn validate_name(name: &str) -> Result<(), FsError> {
    let length = name.encode_utf16().count();
    if length == 0 || length > MAX_NAME_LENGTH || name == "." || name == ".." {
        return Err(FsError::InvalidName);
    }
    if name
        .chars()
        .any(|c| c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
    {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

/// Set checksum over every byte of the set except the checksum field itself.
pub fn entry_set_checksum(entries: &[RawEntry]) -> u16 {
    entries
        .iter()
        .flatten()
        .enumerate()
        .filter(|&(i, _)| i != 2 && i != 3)
        .fold(0u16, |checksum, (_, &byte)| {
            checksum.rotate_right(1).wrapping_add(byte as u16)
        })
}

/// Name hash over the upcased characters. Only ASCII letters are folded.
pub fn name_hash(units: &[u16]) -> u16 {
    units.iter().fold(0u16, |hash, &unit| {
        let upper = if (b'a' as u16..=b'z' as u16).contains(&unit) {
            unit - 32
        } else {
            unit
        };
        hash.rotate_right(1).wrapping_add(upper)
    })
}

/// Volume label entry
pub fn volume_label_entry(label: &str) -> RawEntry {
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry[0] = ENTRY_VOLUME_LABEL;
    let units: Vec<u16> = label.encode_utf16().take(11).collect();
    entry[1] = units.len() as u8;
    for (i, unit) in units.iter().enumerate() {
        entry[2 + 2 * i..4 + 2 * i].copy_from_slice(&unit.to_le_bytes());
    }
    entry
}

/// Allocation bitmap entry
pub fn bitmap_entry(first_cluster: u32, data_length: u64) -> RawEntry {
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry[0] = ENTRY_ALLOCATION_BITMAP;
    entry[20..24].copy_from_slice(&first_cluster.to_le_bytes());
    entry[24..32].copy_from_slice(&data_length.to_le_bytes());
    entry
}

/// First cluster and length of an allocation bitmap entry
pub fn parse_bitmap_entry(entry: &RawEntry) -> Option<(u32, u64)> {
    (entry_type(entry) == ENTRY_ALLOCATION_BITMAP).then(|| (u32_at(entry, 20), u64_at(entry, 24)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_counts() {
        assert_eq!(entry_count_for("a"), 3);
        assert_eq!(entry_count_for("fifteen_chars!!"), 3);
        assert_eq!(entry_count_for("sixteen_chars!!!"), 4);
        assert_eq!(entry_count_for(&"x".repeat(255)), 2 + 17);
    }

    #[test]
    fn test_encoded_layout() {
        let mut set = FileEntrySet::new_file("test.txt", 5).unwrap();
        set.valid_data_length = 10000;
        set.data_length = 10000;
        let entries = set.encode();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0][0], 0x85);
        assert_eq!(entries[0][1], 2);
        assert_eq!(&entries[0][4..6], &ATTR_ARCHIVE.to_le_bytes());
        assert_eq!(entries[1][0], 0xC0);
        assert_eq!(entries[1][1], 0x01);
        assert_eq!(entries[1][3], 8);
        assert_eq!(&entries[1][20..24], &5u32.to_le_bytes());
        assert_eq!(&entries[1][24..32], &10000u64.to_le_bytes());
        assert_eq!(entries[2][0], 0xC1);
        assert_eq!(&entries[2][2..4], &(b't' as u16).to_le_bytes());

        assert_eq!(FileEntrySet::decode(&entries), Some(set));
    }

    #[test]
    fn test_long_name_spans_entries() {
        let name = "a_rather_long_file_name_for_exfat.bin";
        let set = FileEntrySet::new_directory(name, 9).unwrap();
        let entries = set.encode();
        assert_eq!(entries.len(), 2 + 3);
        let decoded = FileEntrySet::decode(&entries).unwrap();
        assert_eq!(decoded.name, name);
        assert!(decoded.is_directory());
    }

    #[test]
    fn test_corrupt_set_rejected() {
        let mut entries = FileEntrySet::new_file("x", 2).unwrap().encode();
        entries[1][24] ^= 0x40;
        assert_eq!(FileEntrySet::decode(&entries), None);

        let entries = FileEntrySet::new_file("x", 2).unwrap().encode();
        assert_eq!(FileEntrySet::decode(&entries[..2]), None);
    }

    #[test]
    fn test_checksum_skips_its_own_field() {
        let mut entries = FileEntrySet::new_file("x", 2).unwrap().encode();
        let checksum = entry_set_checksum(&entries);
        entries[0][2] = 0xAB;
        entries[0][3] = 0xCD;
        assert_eq!(entry_set_checksum(&entries), checksum);
    }

    #[test]
    fn test_name_hash_folds_ascii_case() {
        let lower: Vec<u16> = "readme".encode_utf16().collect();
        let upper: Vec<u16> = "README".encode_utf16().collect();
        assert_eq!(name_hash(&lower), name_hash(&upper));
        assert_eq!(name_hash(&[]), 0);
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", ".", "..", "a/b", "a:b", "tab\there"] {
            assert_eq!(validate_name(name), Err(FsError::InvalidName), "{name:?}");
        }
        assert_eq!(validate_name(&"n".repeat(256)), Err(FsError::InvalidName));
        assert_eq!(validate_name(".kernel.system.state"), Ok(()));
    }

    #[test]
    fn test_system_entries() {
        let label = volume_label_entry(VOLUME_LABEL);
        assert_eq!(label[0], 0x83);
        assert_eq!(label[1], 6);
        assert_eq!(&label[2..4], &(b'E' as u16).to_le_bytes());

        let bitmap = bitmap_entry(3, 320);
        assert_eq!(parse_bitmap_entry(&bitmap), Some((3, 320)));
        assert_eq!(parse_bitmap_entry(&label), None);
    }
}
