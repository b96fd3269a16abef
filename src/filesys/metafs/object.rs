//! Object identity, object types and the checksummed core metadata record

use alloc::format;
use alloc::string::String;
use core::fmt;

/// "META"
pub const META_MAGIC: u32 = 0x4D45_5441;
pub const META_VERSION: u32 = 1;
pub const META_FLAG_EXECUTABLE: u32 = 0x0001;

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Standard reflected CRC-32 (the zlib/PNG variant).
pub fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
        CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

/// 128-bit object identity. Only `low` is ever assigned; `high` stays zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId {
    pub high: u64,
    pub low: u64,
}

impl ObjectId {
    pub const NULL: ObjectId = ObjectId { high: 0, low: 0 };

    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// The 16-digit form used for link files and data file names: the low
    /// 32 bits of `high` followed by the low 32 bits of `low`.
    pub fn to_hex(&self) -> String {
        format!("{:08x}{:08x}", self.high as u32, self.low as u32)
    }

    /// Parses exactly 16 hex digits. Anything else is rejected.
    pub fn parse_hex(text: &str) -> Option<Self> {
        if text.len() != 16 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let high = u32::from_str_radix(&text[..8], 16).ok()?;
        let low = u32::from_str_radix(&text[8..], 16).ok()?;
        Some(Self::new(high as u64, low as u64))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:08x}", self.high as u32, self.low as u32)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectType {
    #[default]
    Unknown = 0,
    Executable = 1,
    Document = 2,
    Image = 3,
    Video = 4,
    Audio = 5,
    Archive = 6,
    Data = 7,
}

impl ObjectType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ObjectType::Unknown,
            1 => ObjectType::Executable,
            2 => ObjectType::Document,
            3 => ObjectType::Image,
            4 => ObjectType::Video,
            5 => ObjectType::Audio,
            6 => ObjectType::Archive,
            7 => ObjectType::Data,
            _ => return None,
        })
    }

    /// Lower-case name shown to users
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Unknown => "unknown",
            ObjectType::Executable => "executable",
            ObjectType::Document => "document",
            ObjectType::Image => "image",
            ObjectType::Video => "video",
            ObjectType::Audio => "audio",
            ObjectType::Archive => "archive",
            ObjectType::Data => "data",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn type_to_string(object_type: ObjectType) -> &'static str {
    object_type.as_str()
}

/// Guesses an object type from the first bytes of its content.
pub fn infer_type(data: &[u8]) -> ObjectType {
    if data.len() < 4 {
        return ObjectType::Unknown;
    }
    if data.starts_with(b"\x7FELF") {
        return ObjectType::Executable;
    }
    if data.len() >= 8 && data.starts_with(b"\x89PNG") {
        return ObjectType::Image;
    }
    if data.starts_with(&[0xFF, 0xD8]) {
        return ObjectType::Image;
    }

    let sample = &data[..data.len().min(256)];
    let printable = sample
        .iter()
        .filter(|&&b| (32..=126).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'))
        .count();
    if printable > sample.len() * 9 / 10 {
        ObjectType::Document
    } else {
        ObjectType::Data
    }
}

/// Fixed record describing an object, protected by a CRC-32 over every
/// byte that precedes the checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreMetadata {
    pub magic: u32,
    pub version: u32,
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub size: u64,
    pub created: u64,
    pub modified: u64,
    pub flags: u32,
    pub checksum: u32,
}

impl CoreMetadata {
    /// Encoded length
    pub const SIZE: usize = 60;
    const CHECKSUM_OFFSET: usize = 56;

    /// Fresh record for a new object, checksum filled in. Timestamps stay
    /// zero; there is no clock source below the shell.
    pub fn new(id: ObjectId, object_type: ObjectType) -> Self {
        let mut meta = Self {
            magic: META_MAGIC,
            version: META_VERSION,
            id,
            object_type,
            size: 0,
            created: 0,
            modified: 0,
            flags: 0,
            checksum: 0,
        };
        meta.set_type(object_type);
        meta
    }

    /// Changes the type, keeping the executable flag in step, and reseals.
    pub fn set_type(&mut self, object_type: ObjectType) {
        self.object_type = object_type;
        if object_type == ObjectType::Executable {
            self.flags |= META_FLAG_EXECUTABLE;
        } else {
            self.flags &= !META_FLAG_EXECUTABLE;
        }
        self.seal();
    }

    pub fn is_executable(&self) -> bool {
        self.flags & META_FLAG_EXECUTABLE != 0
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32(&self.to_bytes()[..Self::CHECKSUM_OFFSET])
    }

    /// Recomputes the checksum after a field change
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.id.high.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.id.low.to_le_bytes());
        bytes[24..28].copy_from_slice(&(self.object_type as u32).to_le_bytes());
        bytes[28..36].copy_from_slice(&self.size.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.created.to_le_bytes());
        bytes[44..52].copy_from_slice(&self.modified.to_le_bytes());
        bytes[52..56].copy_from_slice(&self.flags.to_le_bytes());
        bytes[56..60].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Decodes a record. Fails on short input or an unknown type value;
    /// the magic and checksum are left to [`validate_metadata`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE)?;
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| u32_at(at) as u64 | (u32_at(at + 4) as u64) << 32;
        Some(Self {
            magic: u32_at(0),
            version: u32_at(4),
            id: ObjectId::new(u64_at(8), u64_at(16)),
            object_type: ObjectType::from_raw(u32_at(24))?,
            size: u64_at(28),
            created: u64_at(36),
            modified: u64_at(44),
            flags: u32_at(52),
            checksum: u32_at(56),
        })
    }
}

/// True if the record carries the metadata magic and an intact checksum.
pub fn validate_metadata(meta: &CoreMetadata) -> bool {
    meta.magic == META_MAGIC && meta.checksum == meta.compute_checksum()
}
