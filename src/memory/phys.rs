//! Byte-level access to physical memory.
//!
//! Page tables, heap block headers and DMA buffers are all reached through
//! [`PhysMemory`], so the allocators can run against a plain buffer on the
//! host ([`RamArena`]) or against real RAM through a fixed offset
//! ([`DirectMap`]).

use alloc::{vec, vec::Vec};

/// A flat physical address space.
pub trait PhysMemory {
    /// Number of addressable bytes, starting at physical address 0.
    fn size(&self) -> u64;

    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    ///
    /// # Panics
    /// Panics if the range lies outside the address space. That is a bus
    /// error, not a recoverable condition.
    fn read(&self, addr: u64, buf: &mut [u8]);

    /// Copies `data` to memory starting at `addr`.
    ///
    /// # Panics
    /// Same as [`PhysMemory::read`].
    fn write(&mut self, addr: u64, data: &[u8]);

    /// Returns a host pointer for `addr`, when physical memory is directly
    /// addressable.
    fn as_ptr(&self, _addr: u64) -> Option<*mut u8> {
        None
    }

    /// Inverse of [`PhysMemory::as_ptr`].
    fn address_of(&self, _ptr: *const u8) -> Option<u64> {
        None
    }

    fn fill(&mut self, addr: u64, len: u64, value: u8) {
        let chunk = [value; 256];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len() as u64);
            self.write(addr + done, &chunk[..n as usize]);
            done += n;
        }
    }

    fn read_u32(&self, addr: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&self, addr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }
}

/// Physical memory simulated by a heap buffer.
pub struct RamArena {
    bytes: Vec<u8>,
}

impl RamArena {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    fn range(&self, addr: u64, len: usize) -> core::ops::Range<usize> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .unwrap_or_else(|| panic!("physical access {:#x}+{:#x} out of range", addr, len));
        start..end
    }
}

impl PhysMemory for RamArena {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        let range = self.range(addr, buf.len());
        buf.copy_from_slice(&self.bytes[range]);
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        let range = self.range(addr, data.len());
        self.bytes[range].copy_from_slice(data);
    }
}

/// Physical memory reached through a constant virtual offset.
///
/// With an offset of 0 this is the identity map used before and right after
/// paging is enabled.
pub struct DirectMap {
    offset: u64,
    size: u64,
}

impl DirectMap {
    /// # Safety
    ///
    /// `[offset, offset + size)` must be valid, writable memory for as long
    /// as the returned value is used, and nothing else may alias it.
    pub const unsafe fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    fn check(&self, addr: u64, len: usize) {
        assert!(
            addr.checked_add(len as u64).is_some_and(|end| end <= self.size),
            "physical access {:#x}+{:#x} out of range",
            addr,
            len
        );
    }
}

impl PhysMemory for DirectMap {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, addr: u64, buf: &mut [u8]) {
        self.check(addr, buf.len());
        // SAFETY: in range per `check`, validity guaranteed by `new`'s contract.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (self.offset + addr) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        self.check(addr, data.len());
        // SAFETY: see `read`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.offset + addr) as *mut u8,
                data.len(),
            );
        }
    }

    fn as_ptr(&self, addr: u64) -> Option<*mut u8> {
        (addr < self.size).then(|| (self.offset + addr) as *mut u8)
    }

    fn address_of(&self, ptr: *const u8) -> Option<u64> {
        let addr = (ptr as u64).checked_sub(self.offset)?;
        (addr < self.size).then_some(addr)
    }
}

// SAFETY: `DirectMap` only stores an offset; exclusive access is enforced by
// whoever owns it (the kernel allocator lock).
unsafe impl Send for DirectMap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_little_endian_words() {
        let mut ram = RamArena::new(64);
        ram.write_u32(8, 0xDEADBEEF);
        assert_eq!(ram.read_u32(8), 0xDEADBEEF);

        let mut raw = [0u8; 4];
        ram.read(8, &mut raw);
        assert_eq!(raw, [0xEF, 0xBE, 0xAD, 0xDE]);

        ram.write_u64(16, u64::MAX - 1);
        assert_eq!(ram.read_u64(16), u64::MAX - 1);
    }

    #[test]
    fn test_arena_fill() {
        let mut ram = RamArena::new(1024);
        ram.fill(100, 600, 0xAB);
        assert_eq!(ram.read_u32(98), 0xABAB_0000);
        assert_eq!(ram.read_u32(698), 0x0000_ABAB);
    }

    #[test]
    #[should_panic]
    fn test_arena_out_of_range_panics() {
        let ram = RamArena::new(16);
        ram.read_u64(12);
    }

    #[test]
    fn test_direct_map_pointer_round_trip() {
        let mut backing = vec![0u8; 4096];
        let base = backing.as_mut_ptr() as u64;
        let mut mem = unsafe { DirectMap::new(base, backing.len() as u64) };

        mem.write_u32(0x100, 42);
        assert_eq!(mem.read_u32(0x100), 42);

        let ptr = mem.as_ptr(0x100).unwrap();
        assert_eq!(mem.address_of(ptr), Some(0x100));
        assert_eq!(mem.as_ptr(4096), None);
        drop(mem);
        assert_eq!(backing[0x100], 42);
    }
}
