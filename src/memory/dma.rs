//! DMA buffer pool over the low physical window `0x10000..0xA0000`.
//!
//! Legacy controllers can only reach the first megabyte, so that window is
//! kept out of the frame allocator and carved up here in 4 KiB granules.

use arrayvec::ArrayVec;
use log::{info, warn};
use x86_64::PhysAddr;

use crate::constants::memory::{
    DMA_BLOCK_GRANULE, DMA_MAX_BLOCKS, DMA_REGION_END, DMA_REGION_START,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DmaBlock {
    start: u64,
    size: u64,
    free: bool,
}

impl DmaBlock {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Address-ordered blocks tiling the DMA window.
pub struct DmaPool {
    blocks: ArrayVec<DmaBlock, DMA_MAX_BLOCKS>,
    total: u64,
    used: u64,
}

impl Default for DmaPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaPool {
    pub const fn new() -> Self {
        Self {
            blocks: ArrayVec::new_const(),
            total: 0,
            used: 0,
        }
    }

    /// Resets the pool to a single free block covering the window.
    pub fn init(&mut self) {
        self.blocks.clear();
        self.blocks.push(DmaBlock {
            start: DMA_REGION_START,
            size: DMA_REGION_END - DMA_REGION_START,
            free: true,
        });
        self.total = DMA_REGION_END - DMA_REGION_START;
        self.used = 0;
        info!(
            "dma: pool at {:#x}-{:#x} ({} KB)",
            DMA_REGION_START,
            DMA_REGION_END,
            self.total / 1024
        );
    }

    pub fn is_initialized(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// First-fit allocation of `size` bytes rounded up to whole granules.
    ///
    /// A block is only split when the leftover is at least two granules;
    /// otherwise the caller gets the whole block.
    pub fn dma_alloc(&mut self, size: u64) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }
        let size = size.checked_next_multiple_of(DMA_BLOCK_GRANULE)?;

        let Some(index) = self
            .blocks
            .iter()
            .position(|block| block.free && block.size >= size)
        else {
            warn!("dma: no free block for {} bytes", size);
            return None;
        };

        let block = self.blocks[index];
        if block.size - size >= 2 * DMA_BLOCK_GRANULE {
            let rest = DmaBlock {
                start: block.start + size,
                size: block.size - size,
                free: true,
            };
            if self.blocks.try_insert(index + 1, rest).is_ok() {
                self.blocks[index].size = size;
            }
        }

        let block = &mut self.blocks[index];
        block.free = false;
        self.used += block.size;
        Some(PhysAddr::new(block.start))
    }

    /// Returns the block starting at `addr`. Addresses outside the window or
    /// not at the start of an allocated block are reported and ignored.
    pub fn dma_free(&mut self, addr: PhysAddr) -> bool {
        let addr = addr.as_u64();
        if !(DMA_REGION_START..DMA_REGION_END).contains(&addr) {
            warn!("dma: free of {:#x} outside DMA region", addr);
            return false;
        }

        let Some(index) = self
            .blocks
            .iter()
            .position(|block| block.start == addr && !block.free)
        else {
            warn!("dma: free of {:#x}, not allocated", addr);
            return false;
        };

        self.blocks[index].free = true;
        self.used -= self.blocks[index].size;

        if let Some(next) = self.blocks.get(index + 1).copied() {
            if next.free && self.blocks[index].end() == next.start {
                self.blocks[index].size += next.size;
                self.blocks.remove(index + 1);
            }
        }
        if index > 0 {
            let prev = self.blocks[index - 1];
            if prev.free && prev.end() == self.blocks[index].start {
                self.blocks[index - 1].size += self.blocks[index].size;
                self.blocks.remove(index);
            }
        }
        true
    }

    pub fn stats(&self) -> DmaStats {
        DmaStats {
            total: self.total,
            used: self.used,
            free: self.total - self.used,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
