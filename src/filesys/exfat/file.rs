//! Open file handles

/// Where a file's entry set lives: the directory chain it belongs to and the
/// slot index of its File entry inside that chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub dir_cluster: u32,
    pub slot: usize,
}

/// Represents an open file on an exFAT volume
#[derive(Debug, Clone)]
pub struct ExFatFile {
    /// Whether file is valid/open
    pub valid: bool,

    /// First cluster of the data chain
    pub first_cluster: u32,

    /// Current position in file
    pub position: u64,

    /// Total file size in bytes
    pub size: u64,

    pub attributes: u16,

    /// Entry set to patch when the size changes
    pub entry: EntryLocation,
}

impl ExFatFile {
    pub fn closed() -> Self {
        Self {
            valid: false,
            first_cluster: 0,
            position: 0,
            size: 0,
            attributes: 0,
            entry: EntryLocation {
                dir_cluster: 0,
                slot: 0,
            },
        }
    }
}
