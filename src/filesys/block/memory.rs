//! In-memory block device implementation

use crate::filesys::{BlockDevice, FsError};
use alloc::vec;
use alloc::vec::Vec;
use core::result::Result;

/// Block device that stores a whole volume in one memory buffer
#[derive(Clone)]
pub struct MemoryBlockDevice {
    /// Volume contents, `total_blocks * block_size` bytes
    data: Vec<u8>,

    /// Size of each block in bytes
    block_size: usize,
}

impl MemoryBlockDevice {
    /// Creates a zero-filled device with the given geometry
    pub fn new(total_blocks: u64, block_size: usize) -> Self {
        Self {
            data: vec![0; total_blocks as usize * block_size],
            block_size,
        }
    }

    /// Wraps an existing volume image. A trailing partial block is dropped.
    pub fn from_image(mut data: Vec<u8>, block_size: usize) -> Self {
        data.truncate(data.len() - data.len() % block_size);
        Self { data, block_size }
    }

    /// Raw volume contents
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Byte range of a block, if it exists
    fn block_range(&self, block_num: u64) -> Result<core::ops::Range<usize>, FsError> {
        if block_num >= self.total_blocks() {
            return Err(FsError::IOError);
        }
        let start = block_num as usize * self.block_size;
        Ok(start..start + self.block_size)
    }

    /// Validates buffer is correct block size
    fn validate_buffer(&self, buf: &[u8]) -> Result<(), FsError> {
        if buf.len() != self.block_size {
            return Err(FsError::IOError);
        }
        Ok(())
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FsError> {
        let range = self.block_range(block_num)?;
        self.validate_buffer(buf)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FsError> {
        let range = self.block_range(block_num)?;
        self.validate_buffer(buf)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_block() {
        let mut device = MemoryBlockDevice::new(4, 512);
        let block = [0xA5u8; 512];
        device.write_block(2, &block).unwrap();

        let mut buf = [0u8; 512];
        device.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, block);
        device.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(&device.image()[1024..1536], &block[..]);
    }

    #[test]
    fn test_out_of_range_and_bad_buffer() {
        let mut device = MemoryBlockDevice::new(4, 512);
        let mut buf = [0u8; 512];
        assert_eq!(device.read_block(4, &mut buf), Err(FsError::IOError));
        assert_eq!(device.write_block(9, &buf), Err(FsError::IOError));

        let mut short = [0u8; 100];
        assert_eq!(device.read_block(0, &mut short), Err(FsError::IOError));
    }

    #[test]
    fn test_from_image() {
        let device = MemoryBlockDevice::from_image(vec![7u8; 1300], 512);
        assert_eq!(device.total_blocks(), 2);
        assert_eq!(device.block_size(), 512);
    }
}
