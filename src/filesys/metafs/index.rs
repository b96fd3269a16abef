//! In-memory index entries and their fixed-size database records

use super::object::{CoreMetadata, ObjectId, ObjectType};
use alloc::string::String;

pub const NAME_MAX: usize = 63;
pub const VIEW_MAX: usize = 63;
pub const EXTENSION_MAX: usize = 15;
pub const TAGS_MAX: usize = 255;

// Record layout: core metadata padded to 64 bytes, then the NUL-padded
// name, view, extension and tag fields.
const NAME_OFFSET: usize = 64;
const VIEW_OFFSET: usize = NAME_OFFSET + NAME_MAX + 1;
const EXTENSION_OFFSET: usize = VIEW_OFFSET + VIEW_MAX + 1;
const TAGS_OFFSET: usize = EXTENSION_OFFSET + EXTENSION_MAX + 1;

/// Encoded length of one index record
pub const RECORD_SIZE: usize = TAGS_OFFSET + TAGS_MAX + 1;

/// Mutable attributes that sit outside the checksum
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedMetadata {
    pub name: String,
    pub view: String,
    /// Comma-separated
    pub tags: String,
}

/// Everything the index knows about one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub core: CoreMetadata,
    pub extended: ExtendedMetadata,
}

/// One object in the index. Empty strings mean the attribute is unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub core: CoreMetadata,
    pub name: String,
    pub view: String,
    pub extension: String,
    pub tags: String,
}

fn optional(field: &str) -> Option<&str> {
    (!field.is_empty()).then_some(field)
}

fn put_str(record: &mut [u8], at: usize, value: &str) {
    record[at..at + value.len()].copy_from_slice(value.as_bytes());
}

fn get_str(record: &[u8], at: usize, capacity: usize) -> Option<String> {
    let field = &record[at..at + capacity + 1];
    let end = field.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&field[..end]).ok().map(String::from)
}

impl IndexEntry {
    pub fn new(id: ObjectId, object_type: ObjectType) -> Self {
        Self {
            core: CoreMetadata::new(id, object_type),
            name: String::new(),
            view: String::new(),
            extension: String::new(),
            tags: String::new(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.core.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.core.object_type
    }

    pub fn name(&self) -> Option<&str> {
        optional(&self.name)
    }

    pub fn view(&self) -> Option<&str> {
        optional(&self.view)
    }

    pub fn extension(&self) -> Option<&str> {
        optional(&self.extension)
    }

    pub fn extended(&self) -> ExtendedMetadata {
        ExtendedMetadata {
            name: self.name.clone(),
            view: self.view.clone(),
            tags: self.tags.clone(),
        }
    }

    pub fn to_record(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        record[..CoreMetadata::SIZE].copy_from_slice(&self.core.to_bytes());
        // Field lengths are checked by the setters.
        put_str(&mut record, NAME_OFFSET, &self.name);
        put_str(&mut record, VIEW_OFFSET, &self.view);
        put_str(&mut record, EXTENSION_OFFSET, &self.extension);
        put_str(&mut record, TAGS_OFFSET, &self.tags);
        record
    }

    /// Decodes a record. Returns `None` if a string field is unterminated
    /// or not UTF-8, or the core metadata does not decode.
    pub fn from_record(record: &[u8]) -> Option<Self> {
        if record.len() < RECORD_SIZE {
            return None;
        }
        Some(Self {
            core: CoreMetadata::from_bytes(record)?,
            name: get_str(record, NAME_OFFSET, NAME_MAX)?,
            view: get_str(record, VIEW_OFFSET, VIEW_MAX)?,
            extension: get_str(record, EXTENSION_OFFSET, EXTENSION_MAX)?,
            tags: get_str(record, TAGS_OFFSET, TAGS_MAX)?,
        })
    }
}
