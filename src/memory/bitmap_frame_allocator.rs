//! Physical page allocator.
//!
//! One bit per 4 KiB frame, `1` meaning used. Only frames inside the usable
//! ranges of the memory map start out free. The bitmap lives after the kernel
//! image; the frames it occupies, everything below it and the legacy DMA
//! window are marked used at init, so frame 0 is never handed out.

use crate::constants::memory::{
    BITMAP_ENTRY_SIZE, DMA_REGION_END, DMA_REGION_START, FRAME_SIZE, FULL_BITMAP_ENTRY, PAGE_SIZE,
};
use core::fmt;
use log::{debug, info};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The storage handed to `init` cannot hold one bit per frame.
    BitmapTooSmall { needed: usize, provided: usize },
    /// The bitmap would end beyond the top of physical memory.
    BitmapOutOfRange,
    /// The bitmap pages are not inside one usable range.
    BitmapNotUsable,
    NoUsableMemory,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BitmapTooSmall { needed, provided } => write!(
                f,
                "frame bitmap needs {} words, {} provided",
                needed, provided
            ),
            FrameError::BitmapOutOfRange => write!(f, "frame bitmap lies outside physical memory"),
            FrameError::BitmapNotUsable => write!(f, "frame bitmap overlaps memory that is not usable"),
            FrameError::NoUsableMemory => write!(f, "memory map has no usable range"),
        }
    }
}

/// A usable RAM range from the memory map, `[base, base + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    pub fn contains(&self, start: u64, end: u64) -> bool {
        self.base <= start && end <= self.end()
    }
}

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub used_frames: usize,
}

impl FrameStats {
    pub fn total_bytes(&self) -> u64 {
        (self.total_frames * FRAME_SIZE) as u64
    }

    pub fn free_bytes(&self) -> u64 {
        (self.free_frames * FRAME_SIZE) as u64
    }

    pub fn used_bytes(&self) -> u64 {
        (self.used_frames * FRAME_SIZE) as u64
    }
}

pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    bitmap: &'static mut [u64],
    bitmap_base: PhysAddr,
}

impl BitmapFrameAllocator {
    /// Number of `u64` words needed to track `memory_size` bytes.
    pub const fn bitmap_words(memory_size: u64) -> usize {
        let frames = (memory_size / PAGE_SIZE) as usize;
        frames.div_ceil(BITMAP_ENTRY_SIZE)
    }

    /// Builds the allocator for `memory_size` bytes of RAM, all of it usable.
    ///
    /// `bitmap_base` is where the bitmap sits in physical memory (the end of
    /// the kernel image); `bitmap` is that same storage as seen by the kernel.
    pub fn init(
        memory_size: u64,
        bitmap_base: PhysAddr,
        bitmap: &'static mut [u64],
    ) -> Result<Self, FrameError> {
        let whole = MemoryRegion {
            base: 0,
            length: memory_size,
        };
        Self::init_with_regions(&[whole], bitmap_base, bitmap)
    }

    /// Builds the allocator from the usable ranges of the memory map. Frames
    /// outside every range (firmware tables, MMIO holes, the kernel image)
    /// stay used; the bitmap itself must sit inside a usable range.
    pub fn init_with_regions(
        usable: &[MemoryRegion],
        bitmap_base: PhysAddr,
        bitmap: &'static mut [u64],
    ) -> Result<Self, FrameError> {
        let memory_size = usable
            .iter()
            .map(MemoryRegion::end)
            .max()
            .filter(|&end| end >= PAGE_SIZE)
            .ok_or(FrameError::NoUsableMemory)?;
        let total_frames = (memory_size / PAGE_SIZE) as usize;
        let words = Self::bitmap_words(memory_size);

        if bitmap.len() < words {
            return Err(FrameError::BitmapTooSmall {
                needed: words,
                provided: bitmap.len(),
            });
        }

        let bitmap_end = bitmap_base.as_u64() + (words * 8) as u64;
        let reserved_end = bitmap_end.next_multiple_of(PAGE_SIZE);
        if reserved_end > memory_size {
            return Err(FrameError::BitmapOutOfRange);
        }
        let bitmap_start = bitmap_base.align_down(PAGE_SIZE).as_u64();
        if !usable
            .iter()
            .any(|region| region.contains(bitmap_start, reserved_end))
        {
            return Err(FrameError::BitmapNotUsable);
        }

        let (bitmap, _) = bitmap.split_at_mut(words);
        bitmap.fill(0);

        let mut allocator = Self {
            total_frames,
            free_frames: total_frames,
            bitmap,
            bitmap_base,
        };

        allocator.mark_range_used(0, memory_size);
        for region in usable {
            let first = region.base.div_ceil(PAGE_SIZE) as usize;
            let last = ((region.end() / PAGE_SIZE) as usize).min(total_frames);
            for frame_index in first..last {
                if allocator.is_bit_set(frame_index) {
                    allocator.clear_bit(frame_index);
                }
            }
        }

        allocator.mark_range_used(0, reserved_end);
        allocator.mark_range_used(DMA_REGION_START, DMA_REGION_END);

        info!(
            "frame allocator: {} frames, {} free in {} ranges, bitmap at {:#x} ({} bytes)",
            allocator.total_frames,
            allocator.free_frames,
            usable.len(),
            allocator.bitmap_base.as_u64(),
            words * 8
        );

        Ok(allocator)
    }

    /// Mark every frame overlapping `[start, end)` as used.
    fn mark_range_used(&mut self, start: u64, end: u64) {
        let first = (start / PAGE_SIZE) as usize;
        let last = (end.div_ceil(PAGE_SIZE) as usize).min(self.total_frames);
        for frame_index in first..last {
            if !self.is_bit_set(frame_index) {
                self.set_bit(frame_index);
            }
        }
    }

    /// Returns the lowest free frame.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        if self.free_frames == 0 {
            return None;
        }

        let frame_index = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != FULL_BITMAP_ENTRY)
            .map(|(word_index, word)| {
                word_index * BITMAP_ENTRY_SIZE + word.trailing_ones() as usize
            })
            .filter(|&index| index < self.total_frames)?;

        self.set_bit(frame_index);
        Some(Self::frame_address(frame_index))
    }

    /// Returns the first run of `count` contiguous free frames.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysAddr> {
        match count {
            0 => return None,
            1 => return self.alloc_page(),
            _ if count > self.free_frames => return None,
            _ => {}
        }

        let mut run_start = 0;
        let mut run_length = 0;
        for frame_index in 0..self.total_frames {
            if self.is_bit_set(frame_index) {
                run_length = 0;
                continue;
            }
            if run_length == 0 {
                run_start = frame_index;
            }
            run_length += 1;
            if run_length == count {
                for index in run_start..run_start + count {
                    self.set_bit(index);
                }
                debug!(
                    "allocated {} frames at {:#x}",
                    count,
                    Self::frame_address(run_start).as_u64()
                );
                return Some(Self::frame_address(run_start));
            }
        }

        None
    }

    /// Releases the frame containing `addr`. Freeing a frame that is already
    /// free, or lies beyond physical memory, does nothing.
    pub fn free_page(&mut self, addr: PhysAddr) {
        let frame_index = (addr.as_u64() / PAGE_SIZE) as usize;
        if frame_index >= self.total_frames || !self.is_bit_set(frame_index) {
            return;
        }
        self.clear_bit(frame_index);
    }

    pub fn free_pages(&mut self, addr: PhysAddr, count: usize) {
        for i in 0..count {
            self.free_page(addr + (i * FRAME_SIZE) as u64);
        }
    }

    /// Check if frame is used. Frames beyond physical memory count as used.
    pub fn is_frame_used(&self, addr: PhysAddr) -> bool {
        let frame_index = (addr.as_u64() / PAGE_SIZE) as usize;
        frame_index >= self.total_frames || self.is_bit_set(frame_index)
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            used_frames: self.total_frames - self.free_frames,
        }
    }

    /// Number of set bits in the bitmap.
    pub fn used_bits(&self) -> usize {
        self.bitmap.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    fn frame_address(frame_index: usize) -> PhysAddr {
        PhysAddr::new((frame_index * FRAME_SIZE) as u64)
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] |= 1 << bit_index;
        self.free_frames -= 1;
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        self.bitmap[word_index] &= !(1 << bit_index);
        self.free_frames += 1;
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);

        let word_index = frame_index / BITMAP_ENTRY_SIZE;
        let bit_index = frame_index % BITMAP_ENTRY_SIZE;

        (self.bitmap[word_index] & (1 << bit_index)) != 0
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_page().map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free_page(frame.start_address());
    }
}
