//! View definitions

use super::object::{ObjectId, ObjectType};
use alloc::string::String;
use alloc::vec::Vec;

/// Longest view name
pub const VIEW_NAME_MAX: usize = 63;
/// Encoded length of a view definition: name, kind, filter
pub const VIEW_RECORD_SIZE: usize = VIEW_NAME_MAX + 1 + 8;

/// Views created by `format`. Emptying the first four can leave the system
/// unbootable.
pub const SYSTEM_VIEWS: [&str; 4] = ["kernel", "data", "boot", "config"];

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    StaticApps = 0,
    StaticDocuments = 1,
    StaticMedia = 2,
    Dynamic = 3,
}

impl ViewKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ViewKind::StaticApps,
            1 => ViewKind::StaticDocuments,
            2 => ViewKind::StaticMedia,
            3 => ViewKind::Dynamic,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDefinition {
    pub name: String,
    pub kind: ViewKind,
    /// `Unknown` admits every type
    pub filter: ObjectType,
}

impl ViewDefinition {
    pub fn new(name: &str, kind: ViewKind, filter: ObjectType) -> Self {
        Self {
            name: String::from(name),
            kind,
            filter,
        }
    }

    pub fn accepts(&self, object_type: ObjectType) -> bool {
        self.filter == ObjectType::Unknown || self.filter == object_type
    }

    pub fn is_system(&self) -> bool {
        SYSTEM_VIEWS.contains(&self.name.as_str())
    }

    pub fn to_record(&self) -> [u8; VIEW_RECORD_SIZE] {
        let mut record = [0u8; VIEW_RECORD_SIZE];
        let name = self.name.as_bytes();
        record[..name.len()].copy_from_slice(name);
        let at = VIEW_NAME_MAX + 1;
        record[at..at + 4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        record[at + 4..at + 8].copy_from_slice(&(self.filter as u32).to_le_bytes());
        record
    }

    pub fn from_record(record: &[u8]) -> Option<Self> {
        let record = record.get(..VIEW_RECORD_SIZE)?;
        let end = record[..=VIEW_NAME_MAX].iter().position(|&b| b == 0)?;
        let name = core::str::from_utf8(&record[..end]).ok()?;
        let at = VIEW_NAME_MAX + 1;
        let raw = |at: usize| {
            u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
        };
        Some(Self::new(
            name,
            ViewKind::from_raw(raw(at))?,
            ObjectType::from_raw(raw(at + 4))?,
        ))
    }
}

/// The seven views a freshly formatted store starts with
pub fn default_views() -> Vec<ViewDefinition> {
    use ObjectType::*;
    use ViewKind::*;
    [
        ("kernel", StaticApps, Data),
        ("data", StaticDocuments, Data),
        ("boot", StaticApps, Executable),
        ("config", StaticDocuments, Data),
        ("apps", StaticApps, Executable),
        ("documents", StaticDocuments, Document),
        ("media", StaticMedia, Image),
    ]
    .into_iter()
    .map(|(name, kind, filter)| ViewDefinition::new(name, kind, filter))
    .collect()
}

/// One line of a view listing. At the root each view is listed with a null
/// id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub name: String,
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub size: u64,
    pub created: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_views() {
        let views = default_views();
        assert_eq!(views.len(), 7);
        assert_eq!(views.iter().filter(|v| v.is_system()).count(), 4);
        let media = views.iter().find(|v| v.name == "media").unwrap();
        assert_eq!(media.kind, ViewKind::StaticMedia);
        assert!(media.accepts(ObjectType::Image));
        assert!(!media.accepts(ObjectType::Document));
    }

    #[test]
    fn test_unknown_filter_admits_all() {
        let view = ViewDefinition::new("all", ViewKind::Dynamic, ObjectType::Unknown);
        assert!(view.accepts(ObjectType::Audio));
        assert!(view.accepts(ObjectType::Data));
    }

    #[test]
    fn test_record_roundtrip() {
        let view = ViewDefinition::new("projects", ViewKind::Dynamic, ObjectType::Archive);
        let record = view.to_record();
        assert_eq!(record.len(), 72);
        assert_eq!(&record[..8], b"projects");
        assert_eq!(ViewDefinition::from_record(&record), Some(view));

        let mut bad_kind = record;
        bad_kind[64] = 9;
        assert_eq!(ViewDefinition::from_record(&bad_kind), None);
    }
}
