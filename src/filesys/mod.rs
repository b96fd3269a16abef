use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::result::Result;

pub mod block;
pub mod exfat;
pub mod metafs;

/// Errors shared by the block device and filesystem layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidName,
    IOError,
    NotSupported,
    DirectoryNotEmpty,
    InvalidOffset,
    NoSpace,
    InvalidHandle,
    /// The file is open and cannot be removed.
    Busy,
    /// Boot sector signature or filesystem name did not match.
    BadVolume,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FsError::NotFound => "not found",
            FsError::AlreadyExists => "already exists",
            FsError::InvalidName => "invalid name",
            FsError::IOError => "I/O error",
            FsError::NotSupported => "not supported",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::InvalidOffset => "invalid offset",
            FsError::NoSpace => "no space left on volume",
            FsError::InvalidHandle => "invalid file handle",
            FsError::Busy => "file is open",
            FsError::BadVolume => "not an exFAT volume",
        };
        f.write_str(text)
    }
}

// Core traits for filesystem abstraction

/// Represents a block device that can be read from and written to
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FsError>;
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> u64;
}

/// Represents a directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub metadata: FileMetadata,
}

/// File metadata information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub is_dir: bool,
    pub first_cluster: u32,
    pub permissions: FilePermissions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePermissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Seek positions for file operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// The main filesystem trait. Open files are addressed by descriptor.
pub trait FileSystem: Send + Sync {
    fn create_file(&mut self, path: &str) -> Result<(), FsError>;
    fn create_dir(&mut self, path: &str) -> Result<(), FsError>;
    fn remove_file(&mut self, path: &str) -> Result<(), FsError>;
    fn remove_dir(&mut self, path: &str) -> Result<(), FsError>;
    fn open_file(&mut self, path: &str) -> Result<usize, FsError>;
    fn close_file(&mut self, fd: usize) -> Result<(), FsError>;
    fn read_file(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write_file(&mut self, fd: usize, buf: &[u8]) -> Result<usize, FsError>;
    fn seek_file(&mut self, fd: usize, pos: SeekFrom) -> Result<u64, FsError>;
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;
    fn metadata(&self, path: &str) -> Result<FileMetadata, FsError>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError>;
}

/// Splits `path` into its parent and final component.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b"), ("/a", "b"));
        assert_eq!(split_path("/a"), ("", "a"));
        assert_eq!(split_path("name"), ("", "name"));
        assert_eq!(split_path("/views/apps/"), ("/views", "apps"));
    }
}
