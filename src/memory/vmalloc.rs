//! Kernel virtual address ranges handed out by `kmalloc_virtual`.
//!
//! Freed ranges go to a small fixed pool and are reused first-fit; otherwise
//! a cursor bumps through the heap window.

use core::fmt;

use arrayvec::ArrayVec;
use log::warn;

use crate::constants::memory::MAX_FREE_REGIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// The range was never handed out by the cursor.
    NotReserved,
    /// Part of the range is already on the free list.
    AlreadyFree,
    PoolFull,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::NotReserved => write!(f, "range was never reserved"),
            RegionError::AlreadyFree => write!(f, "range is already free"),
            RegionError::PoolFull => write!(f, "free region pool exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    pub size: u64,
}

pub struct VirtualRegions {
    start: u64,
    end: u64,
    next: u64,
    free: ArrayVec<FreeRegion, MAX_FREE_REGIONS>,
}

impl VirtualRegions {
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            next: start,
            free: ArrayVec::new_const(),
        }
    }

    /// Reserves `size` bytes (a page multiple), preferring a freed region.
    pub fn reserve(&mut self, size: u64) -> Option<u64> {
        if let Some(index) = self.free.iter().position(|region| region.size >= size) {
            let region = &mut self.free[index];
            let start = region.start;
            if region.size == size {
                self.free.remove(index);
            } else {
                region.start += size;
                region.size -= size;
            }
            return Some(start);
        }

        let start = self.next;
        let end = start.checked_add(size).filter(|&end| end <= self.end)?;
        self.next = end;
        Some(start)
    }

    /// Gives a range back to the pool. The range must lie below the cursor
    /// and must not overlap a region that is already free.
    pub fn release(&mut self, start: u64, size: u64) -> Result<(), RegionError> {
        let end = start
            .checked_add(size)
            .filter(|&end| start >= self.start && end <= self.next)
            .ok_or(RegionError::NotReserved)?;
        if self
            .free
            .iter()
            .any(|region| start < region.start + region.size && region.start < end)
        {
            return Err(RegionError::AlreadyFree);
        }
        self.free
            .try_insert(0, FreeRegion { start, size })
            .map_err(|_| RegionError::PoolFull)
    }

    /// Undoes a `reserve` whose backing allocation failed.
    pub fn unreserve(&mut self, start: u64, size: u64) {
        if start + size == self.next {
            self.next = start;
        } else if let Err(err) = self.release(start, size) {
            warn!("vmalloc: {:#x} ({} bytes) leaked: {}", start, size, err);
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }

    pub fn total(&self) -> u64 {
        self.end - self.start
    }

    /// Bytes below the bump cursor, freed ranges included.
    pub fn used(&self) -> u64 {
        self.next - self.start
    }

    pub fn free_regions(&self) -> &[FreeRegion] {
        &self.free
    }
}
