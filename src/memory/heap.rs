//! The Kernel Heap
//!
//! First-fit allocator over an address-ordered, doubly linked list of blocks.
//! Every block starts with a 32-byte header stored in the heap memory itself:
//!
//! | offset | field   | size |
//! |--------|---------|------|
//! | 0      | size    | u64  |
//! | 8      | is_free | u32  |
//! | 12     | magic   | u32  |
//! | 16     | next    | u64  |
//! | 24     | prev    | u64  |
//!
//! `size` excludes the header and address 0 stands for "no block". The heap
//! starts in physical mode, carved out of identity-mapped frames, and is
//! switched to virtual mode once paging is up; from then on it grows through
//! `kmalloc_virtual`. The memory itself is reached through a [`HeapBackend`].

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt, ptr,
};

use log::{debug, info, warn};
use spin::Mutex;
use x86_64::PhysAddr;

use crate::{
    constants::memory::{
        HEAP_ALIGNMENT, HEAP_GROWTH_SLACK, HEAP_MAGIC, HEAP_MIN_BLOCK_SIZE, PAGE_SIZE,
    },
    memory::{
        bitmap_frame_allocator::BitmapFrameAllocator, mmu::PagingHardware, phys::PhysMemory,
        MemoryManager,
    },
};

pub const HEADER_SIZE: u64 = 32;

/// Memory the heap lives in, plus a way to get more of it.
pub trait HeapBackend {
    fn read(&self, addr: u64, buf: &mut [u8]);
    fn write(&mut self, addr: u64, data: &[u8]);
    /// Returns the base of `bytes` (a page multiple) of fresh contiguous memory.
    fn grow(&mut self, bytes: u64) -> Option<u64>;
}

/// Heap memory taken straight from the frame allocator, addressed physically.
pub struct PhysicalHeap<'a, M> {
    pub memory: &'a mut M,
    pub frames: &'a mut BitmapFrameAllocator,
}

impl<M: PhysMemory> HeapBackend for PhysicalHeap<'_, M> {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        self.memory.read(addr, buf);
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        self.memory.write(addr, data);
    }

    fn grow(&mut self, bytes: u64) -> Option<u64> {
        let pages = bytes.div_ceil(PAGE_SIZE) as usize;
        self.frames.alloc_pages(pages).map(PhysAddr::as_u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapMode {
    Physical,
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    NotInitialized,
    AlreadyInitialized,
    OutOfMemory,
    /// Virtual mode requested before paging was enabled.
    PagingRequired,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::NotInitialized => write!(f, "heap not initialized"),
            HeapError::AlreadyInitialized => write!(f, "heap already initialized"),
            HeapError::OutOfMemory => write!(f, "out of memory for the heap"),
            HeapError::PagingRequired => write!(f, "virtual heap needs paging enabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Bytes under management, headers included.
    pub total_size: u64,
    pub used_size: u64,
    pub free_size: u64,
    pub num_blocks: usize,
    pub num_free_blocks: usize,
}

/// One entry of the block list, as reported by [`Heap::for_each_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: u64,
    pub size: u64,
    pub free: bool,
}

#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    size: u64,
    free: bool,
    magic: u32,
    next: u64,
    prev: u64,
}

impl BlockHeader {
    fn new(size: u64, free: bool, next: u64, prev: u64) -> Self {
        Self {
            size,
            free,
            magic: HEAP_MAGIC,
            next,
            prev,
        }
    }

    fn load<B: HeapBackend + ?Sized>(backend: &B, addr: u64) -> Self {
        let mut raw = [0u8; HEADER_SIZE as usize];
        backend.read(addr, &mut raw);
        let word = |at: usize| u64::from_le_bytes(raw[at..at + 8].try_into().unwrap_or([0; 8]));
        let half = |at: usize| u32::from_le_bytes(raw[at..at + 4].try_into().unwrap_or([0; 4]));
        Self {
            size: word(0),
            free: half(8) != 0,
            magic: half(12),
            next: word(16),
            prev: word(24),
        }
    }

    fn store<B: HeapBackend + ?Sized>(&self, backend: &mut B, addr: u64) {
        let mut raw = [0u8; HEADER_SIZE as usize];
        raw[0..8].copy_from_slice(&self.size.to_le_bytes());
        raw[8..12].copy_from_slice(&(self.free as u32).to_le_bytes());
        raw[12..16].copy_from_slice(&self.magic.to_le_bytes());
        raw[16..24].copy_from_slice(&self.next.to_le_bytes());
        raw[24..32].copy_from_slice(&self.prev.to_le_bytes());
        backend.write(addr, &raw);
    }

    fn end(&self, addr: u64) -> u64 {
        addr + HEADER_SIZE + self.size
    }
}

/// Kernel heap state. The blocks themselves live in backend memory.
pub struct Heap {
    head: u64,
    total: u64,
    mode: HeapMode,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            head: 0,
            total: 0,
            mode: HeapMode::Physical,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.head != 0
    }

    pub fn mode(&self) -> HeapMode {
        self.mode
    }

    /// Address of the first block header.
    pub fn start(&self) -> u64 {
        self.head
    }

    /// Sets up one free block spanning `initial_size` bytes (rounded up to pages).
    pub fn init<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        initial_size: u64,
    ) -> Result<(), HeapError> {
        if self.is_initialized() {
            return Err(HeapError::AlreadyInitialized);
        }

        let size = initial_size.max(1).next_multiple_of(PAGE_SIZE);
        let base = backend.grow(size).ok_or(HeapError::OutOfMemory)?;
        BlockHeader::new(size - HEADER_SIZE, true, 0, 0).store(backend, base);

        self.head = base;
        self.total = size;
        self.mode = HeapMode::Physical;
        info!(
            "heap: initialized at {:#x} with {} KB (physical mode)",
            base,
            size / 1024
        );
        Ok(())
    }

    /// Future expansions come from the virtual allocator. Existing blocks stay
    /// where they are; they are identity-mapped.
    pub fn enable_virtual_mode(&mut self) -> Result<(), HeapError> {
        if !self.is_initialized() {
            return Err(HeapError::NotInitialized);
        }
        self.mode = HeapMode::Virtual;
        info!("heap: virtual mode, blocks at {:#x} stay identity-mapped", self.head);
        Ok(())
    }

    pub fn kmalloc<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, size: u64) -> Option<u64> {
        if !self.is_initialized() || size == 0 {
            return None;
        }
        let size = size.checked_next_multiple_of(HEAP_ALIGNMENT)?;

        let block = match self.find_free(backend, size) {
            Some(block) => block,
            None => {
                let request = size.checked_add(HEADER_SIZE + HEAP_GROWTH_SLACK)?;
                if self.expand(backend, request).is_none() {
                    warn!("heap: out of memory, requested {} bytes", size);
                    return None;
                }
                self.find_free(backend, size)?
            }
        };

        self.split(backend, block, size);
        let mut header = BlockHeader::load(backend, block);
        header.free = false;
        header.store(backend, block);
        Some(block + HEADER_SIZE)
    }

    fn find_free<B: HeapBackend + ?Sized>(&self, backend: &B, size: u64) -> Option<u64> {
        let mut current = self.head;
        while current != 0 {
            let header = BlockHeader::load(backend, current);
            if header.free && header.size >= size {
                return Some(current);
            }
            current = header.next;
        }
        None
    }

    /// Cuts `block` down to `size` if the remainder can hold a block of its own.
    fn split<B: HeapBackend + ?Sized>(&self, backend: &mut B, block: u64, size: u64) {
        let mut header = BlockHeader::load(backend, block);
        if header.size < size + HEADER_SIZE + HEAP_MIN_BLOCK_SIZE {
            return;
        }

        let rest = block + HEADER_SIZE + size;
        BlockHeader::new(header.size - size - HEADER_SIZE, true, header.next, block)
            .store(backend, rest);
        if header.next != 0 {
            let mut next = BlockHeader::load(backend, header.next);
            next.prev = rest;
            next.store(backend, header.next);
        }
        header.next = rest;
        header.size = size;
        header.store(backend, block);
    }

    /// Adds a region of at least `bytes` to the list, keeping address order.
    fn expand<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, bytes: u64) -> Option<()> {
        let bytes = bytes.checked_next_multiple_of(PAGE_SIZE)?;
        let base = backend.grow(bytes)?;

        let mut prev = 0;
        let mut next = self.head;
        while next != 0 && next < base {
            prev = next;
            next = BlockHeader::load(backend, next).next;
        }

        BlockHeader::new(bytes - HEADER_SIZE, true, next, prev).store(backend, base);
        if prev == 0 {
            self.head = base;
        } else {
            let mut header = BlockHeader::load(backend, prev);
            header.next = base;
            header.store(backend, prev);
        }
        if next != 0 {
            let mut header = BlockHeader::load(backend, next);
            header.prev = base;
            header.store(backend, next);
        }

        self.total += bytes;
        info!(
            "heap: expanded by {} KB at {:#x} ({:?} mode)",
            bytes / 1024,
            base,
            self.mode
        );
        self.coalesce(backend, base);
        Some(())
    }

    /// Releases the block whose payload starts at `ptr`. Pointers that do not
    /// carry a live header are ignored.
    pub fn kfree<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, ptr: u64) {
        let Some(block) = self.live_block(backend, ptr) else {
            return;
        };
        let mut header = BlockHeader::load(backend, block);
        header.free = true;
        header.store(backend, block);
        self.coalesce(backend, block);
    }

    /// Header address for `ptr`, if it names an allocated block. Only
    /// headers reached through the block list are read, so a pointer from
    /// outside the heap never causes an access.
    fn live_block<B: HeapBackend + ?Sized>(&self, backend: &B, ptr: u64) -> Option<u64> {
        if !self.is_initialized() || ptr < HEADER_SIZE {
            return None;
        }
        let block = ptr - HEADER_SIZE;
        let mut current = self.head;
        while current != 0 {
            let header = BlockHeader::load(backend, current);
            if current == block {
                if header.magic != HEAP_MAGIC {
                    warn!("heap: free of {:#x} with bad magic {:#x}", ptr, header.magic);
                    return None;
                }
                if header.free {
                    warn!("heap: double free of {:#x}", ptr);
                    return None;
                }
                return Some(block);
            }
            if current > block {
                break;
            }
            current = header.next;
        }
        warn!("heap: free of {:#x}, not a heap block", ptr);
        None
    }

    /// Merges `block` with free neighbours that touch it in memory.
    fn coalesce<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, block: u64) {
        let mut header = BlockHeader::load(backend, block);

        if header.next != 0 {
            let next = BlockHeader::load(backend, header.next);
            if next.free && header.end(block) == header.next {
                self.unlink_absorbed(backend, header.next, &next);
                header.size += HEADER_SIZE + next.size;
                header.next = next.next;
                header.store(backend, block);
            }
        }

        if header.prev != 0 {
            let mut prev = BlockHeader::load(backend, header.prev);
            if prev.free && prev.end(header.prev) == block {
                self.unlink_absorbed(backend, block, &header);
                prev.size += HEADER_SIZE + header.size;
                prev.next = header.next;
                prev.store(backend, header.prev);
            }
        }
    }

    /// Points the successor of `absorbed` at its predecessor and wipes the
    /// absorbed header so stale pointers no longer validate.
    fn unlink_absorbed<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        absorbed: u64,
        header: &BlockHeader,
    ) {
        if header.next != 0 {
            let mut next = BlockHeader::load(backend, header.next);
            next.prev = header.prev;
            next.store(backend, header.next);
        }
        let mut wiped = *header;
        wiped.magic = 0;
        wiped.store(backend, absorbed);
    }

    /// `None` as `ptr` allocates; a zero `new_size` frees.
    pub fn krealloc<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        ptr: Option<u64>,
        new_size: u64,
    ) -> Option<u64> {
        let Some(ptr) = ptr else {
            return self.kmalloc(backend, new_size);
        };
        if new_size == 0 {
            self.kfree(backend, ptr);
            return None;
        }

        let block = self.live_block(backend, ptr)?;
        let old_size = BlockHeader::load(backend, block).size;
        if old_size >= new_size {
            return Some(ptr);
        }

        let fresh = self.kmalloc(backend, new_size)?;
        let mut chunk = [0u8; 256];
        let mut copied = 0;
        let len = old_size.min(new_size);
        while copied < len {
            let n = (len - copied).min(chunk.len() as u64) as usize;
            backend.read(ptr + copied, &mut chunk[..n]);
            backend.write(fresh + copied, &chunk[..n]);
            copied += n as u64;
        }
        self.kfree(backend, ptr);
        Some(fresh)
    }

    /// Allocates `size` bytes at an address that is a multiple of `align`
    /// (a power of two). Slack in front of the aligned block is returned to
    /// the heap as a free block.
    pub fn kmalloc_aligned<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        size: u64,
        align: u64,
    ) -> Option<u64> {
        if !align.is_power_of_two() {
            return None;
        }
        if align <= HEAP_ALIGNMENT {
            return self.kmalloc(backend, size);
        }

        let size = size.max(1).checked_next_multiple_of(HEAP_ALIGNMENT)?;
        let padded = size.checked_add(align + HEADER_SIZE + HEAP_MIN_BLOCK_SIZE)?;
        let ptr = self.kmalloc(backend, padded)?;
        if ptr % align == 0 {
            self.shrink(backend, ptr - HEADER_SIZE, size);
            return Some(ptr);
        }

        // The leading gap must hold a header and a minimum payload.
        let aligned = (ptr + HEADER_SIZE + HEAP_MIN_BLOCK_SIZE).next_multiple_of(align);
        let gap = aligned - ptr;
        let block = ptr - HEADER_SIZE;
        let mut header = BlockHeader::load(backend, block);
        let moved = aligned - HEADER_SIZE;

        BlockHeader::new(header.size - gap, false, header.next, block).store(backend, moved);
        if header.next != 0 {
            let mut next = BlockHeader::load(backend, header.next);
            next.prev = moved;
            next.store(backend, header.next);
        }
        header.size = gap - HEADER_SIZE;
        header.next = moved;
        header.free = true;
        header.store(backend, block);

        self.coalesce(backend, block);
        self.shrink(backend, moved, size);
        Some(aligned)
    }

    /// Returns the tail of an allocated block beyond `size` to the heap.
    fn shrink<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, block: u64, size: u64) {
        let before = BlockHeader::load(backend, block).next;
        self.split(backend, block, size);
        let after = BlockHeader::load(backend, block).next;
        if after != before {
            self.coalesce(backend, after);
        }
    }

    pub fn for_each_block<B, F>(&self, backend: &B, mut f: F)
    where
        B: HeapBackend + ?Sized,
        F: FnMut(BlockInfo),
    {
        let mut current = self.head;
        while current != 0 {
            let header = BlockHeader::load(backend, current);
            f(BlockInfo {
                addr: current,
                size: header.size,
                free: header.free,
            });
            current = header.next;
        }
    }

    pub fn stats<B: HeapBackend + ?Sized>(&self, backend: &B) -> HeapStats {
        let mut stats = HeapStats::default();
        self.for_each_block(backend, |block| {
            stats.num_blocks += 1;
            stats.total_size += block.size + HEADER_SIZE;
            if block.free {
                stats.num_free_blocks += 1;
                stats.free_size += block.size;
            } else {
                stats.used_size += block.size;
            }
        });
        stats
    }

    /// Logs the first 20 blocks and the totals.
    pub fn dump<B: HeapBackend + ?Sized>(&self, backend: &B) {
        debug!("heap: start {:#x} ({:?} mode)", self.head, self.mode);
        let mut index = 0;
        self.for_each_block(backend, |block| {
            if index < 20 {
                debug!(
                    "  block {}: addr={:#x} size={} {}",
                    index,
                    block.addr,
                    block.size,
                    if block.free { "FREE" } else { "USED" }
                );
            }
            index += 1;
        });
        let stats = self.stats(backend);
        debug!(
            "heap: {} blocks ({} free), {} KB used, {} KB free",
            stats.num_blocks,
            stats.num_free_blocks,
            stats.used_size / 1024,
            stats.free_size / 1024
        );
    }
}

/// `GlobalAlloc` front end over a locked [`MemoryManager`].
///
/// Allocations fail (return null) until a manager with an initialized heap
/// has been installed.
pub struct KernelAllocator<M, H> {
    inner: Mutex<Option<MemoryManager<M, H>>>,
}

impl<M, H> Default for KernelAllocator<M, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, H> KernelAllocator<M, H> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Hands the memory manager to the allocator, returning the previous one.
    pub fn install(&self, manager: MemoryManager<M, H>) -> Option<MemoryManager<M, H>> {
        self.inner.lock().replace(manager)
    }

    pub fn with_memory<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut MemoryManager<M, H>) -> R,
    {
        self.inner.lock().as_mut().map(f)
    }
}

unsafe impl<M, H> GlobalAlloc for KernelAllocator<M, H>
where
    M: PhysMemory + Send,
    H: PagingHardware + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_memory(|memory| memory.alloc_layout(layout))
            .flatten()
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with_memory(|memory| memory.dealloc_ptr(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::RamArena;
    use alloc::{boxed::Box, vec, vec::Vec};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    const MEMORY: u64 = 8 * 1024 * 1024;

    struct Rig {
        memory: RamArena,
        frames: BitmapFrameAllocator,
        heap: Heap,
    }

    impl Rig {
        fn new(heap_size: u64) -> Self {
            let words = BitmapFrameAllocator::bitmap_words(MEMORY);
            let storage = Box::leak(vec![0u64; words].into_boxed_slice());
            let mut rig = Rig {
                memory: RamArena::new(MEMORY as usize),
                frames: BitmapFrameAllocator::init(MEMORY, PhysAddr::new(0x100000), storage)
                    .unwrap(),
                heap: Heap::new(),
            };
            let (heap, mut backend) = rig.parts();
            heap.init(&mut backend, heap_size).unwrap();
            rig
        }

        fn parts(&mut self) -> (&mut Heap, PhysicalHeap<'_, RamArena>) {
            (
                &mut self.heap,
                PhysicalHeap {
                    memory: &mut self.memory,
                    frames: &mut self.frames,
                },
            )
        }

        fn malloc(&mut self, size: u64) -> Option<u64> {
            let (heap, mut backend) = self.parts();
            heap.kmalloc(&mut backend, size)
        }

        fn free(&mut self, ptr: u64) {
            let (heap, mut backend) = self.parts();
            heap.kfree(&mut backend, ptr)
        }

        fn blocks(&mut self) -> Vec<BlockInfo> {
            let (heap, backend) = self.parts();
            let mut blocks = Vec::new();
            heap.for_each_block(&backend, |block| blocks.push(block));
            blocks
        }

        fn stats(&mut self) -> HeapStats {
            let (heap, backend) = self.parts();
            heap.stats(&backend)
        }
    }

    fn assert_no_adjacent_free(blocks: &[BlockInfo]) {
        for pair in blocks.windows(2) {
            let touching = pair[0].addr + HEADER_SIZE + pair[0].size == pair[1].addr;
            assert!(
                !(pair[0].free && pair[1].free && touching),
                "adjacent free blocks at {:#x} and {:#x}",
                pair[0].addr,
                pair[1].addr
            );
        }
    }

    #[test]
    fn test_init_single_free_block() {
        let mut rig = Rig::new(64 * 1024);
        let blocks = rig.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 64 * 1024 - HEADER_SIZE);
        assert!(blocks[0].free);
        assert_eq!(rig.stats().total_size, 64 * 1024);
    }

    #[test]
    fn test_kmalloc_aligns_and_splits() {
        let mut rig = Rig::new(64 * 1024);
        let start = rig.heap.start();

        let a = rig.malloc(13).unwrap();
        let b = rig.malloc(8).unwrap();
        assert_eq!(a, start + HEADER_SIZE);
        assert_eq!(b, a + 16 + HEADER_SIZE);
        assert_eq!(a % 8, 0);

        let blocks = rig.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].size, 16);
        assert!(!blocks[0].free && !blocks[1].free && blocks[2].free);
    }

    #[test]
    fn test_kmalloc_zero_and_uninitialized() {
        let mut rig = Rig::new(4096);
        assert_eq!(rig.malloc(0), None);

        let mut heap = Heap::new();
        let (_, mut backend) = rig.parts();
        assert_eq!(heap.kmalloc(&mut backend, 16), None);
    }

    #[test]
    fn test_small_remainder_not_split() {
        let mut rig = Rig::new(4096);
        // 4096 - 32 = 4064 payload; leaving 56 bytes is below header + minimum.
        let ptr = rig.malloc(4064 - 56).unwrap();
        let blocks = rig.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 4064);
        rig.free(ptr);
        assert_eq!(rig.blocks().len(), 1);
    }

    #[test]
    fn test_free_round_trip_restores_single_block() {
        let mut rig = Rig::new(256 * 1024);
        let before = rig.blocks();

        let ptr = rig.malloc(1000).unwrap();
        rig.free(ptr);
        assert_eq!(rig.blocks(), before);
        assert_eq!(rig.malloc(1000), Some(ptr));
    }

    #[test]
    fn test_coalesce_both_neighbours() {
        let mut rig = Rig::new(64 * 1024);
        let a = rig.malloc(64).unwrap();
        let b = rig.malloc(64).unwrap();
        let c = rig.malloc(64).unwrap();
        let _guard = rig.malloc(64).unwrap();

        rig.free(a);
        rig.free(c);
        assert_eq!(rig.stats().num_free_blocks, 3);
        rig.free(b);

        let blocks = rig.blocks();
        assert_eq!(blocks[0].size, 3 * 64 + 2 * HEADER_SIZE);
        assert!(blocks[0].free);
        assert_no_adjacent_free(&blocks);
    }

    #[test]
    fn test_double_and_foreign_free_ignored() {
        let mut rig = Rig::new(64 * 1024);
        let a = rig.malloc(64).unwrap();
        let _b = rig.malloc(64).unwrap();
        rig.free(a);
        let snapshot = rig.blocks();

        rig.free(a);
        rig.free(a + 8);
        assert_eq!(rig.blocks(), snapshot);
    }

    #[test]
    fn test_free_outside_heap_changes_nothing() {
        let mut rig = Rig::new(64 * 1024);
        let _a = rig.malloc(64).unwrap();
        let snapshot = rig.blocks();

        // Past the end of RAM and inside RAM but outside the heap.
        rig.free(2 * MEMORY);
        rig.free(0x2000);
        rig.free(HEADER_SIZE - 1);
        assert_eq!(rig.blocks(), snapshot);
        assert_eq!(rig.stats().num_blocks, 2);
    }

    #[test]
    fn test_expansion_when_full() {
        let mut rig = Rig::new(4096);
        let free_before = rig.frames.free_frames();

        let big = rig.malloc(10_000).unwrap();
        let stats = rig.stats();
        // 10000 + 32 + 4096 rounds up to 4 pages.
        assert_eq!(stats.total_size, 4096 + 4 * 4096);
        assert_eq!(rig.frames.free_frames(), free_before - 4);
        assert!(big > rig.heap.start());

        // The new region sits right after the first one and merged with it.
        let blocks = rig.blocks();
        assert_no_adjacent_free(&blocks);
        assert_eq!(blocks.iter().filter(|b| !b.free).count(), 1);
    }

    #[test]
    fn test_out_of_memory_returns_none() {
        let mut rig = Rig::new(4096);
        assert_eq!(rig.malloc(MEMORY), None);
        assert!(rig.malloc(64).is_some());
    }

    #[test]
    fn test_krealloc_paths() {
        let mut rig = Rig::new(64 * 1024);
        let (heap, mut backend) = rig.parts();

        let fresh = heap.krealloc(&mut backend, None, 24).unwrap();
        backend.write(fresh, b"kernel heap payload!1234");

        assert_eq!(heap.krealloc(&mut backend, Some(fresh), 16), Some(fresh));

        let _blocker = heap.kmalloc(&mut backend, 8).unwrap();
        let moved = heap.krealloc(&mut backend, Some(fresh), 200).unwrap();
        assert_ne!(moved, fresh);
        let mut copy = [0u8; 24];
        backend.read(moved, &mut copy);
        assert_eq!(&copy, b"kernel heap payload!1234");

        assert_eq!(heap.krealloc(&mut backend, Some(moved), 0), None);
        assert_eq!(heap.stats(&backend).used_size, 8);
    }

    #[test]
    fn test_kmalloc_aligned() {
        let mut rig = Rig::new(64 * 1024);
        let _skew = rig.malloc(8).unwrap();
        let (heap, mut backend) = rig.parts();

        for align in [16, 64, 256, 4096] {
            let ptr = heap.kmalloc_aligned(&mut backend, 100, align).unwrap();
            assert_eq!(ptr % align, 0, "alignment {}", align);
        }
        assert_eq!(heap.kmalloc_aligned(&mut backend, 100, 24), None);

        let blocks = rig.blocks();
        assert_no_adjacent_free(&blocks);
        // Aligned blocks keep at most a sliver too small to split off.
        assert!(blocks
            .iter()
            .filter(|b| !b.free)
            .all(|b| b.size < 104 + HEADER_SIZE + HEAP_MIN_BLOCK_SIZE));
    }

    #[test]
    fn test_aligned_block_frees_cleanly() {
        let mut rig = Rig::new(64 * 1024);
        let before = rig.blocks();
        let (heap, mut backend) = rig.parts();
        let ptr = heap.kmalloc_aligned(&mut backend, 300, 1024).unwrap();
        heap.kfree(&mut backend, ptr);
        assert_eq!(rig.blocks(), before);
    }

    #[test]
    fn test_random_workload_keeps_invariants() {
        let mut rng = SmallRng::seed_from_u64(0xBEEF);
        let mut rig = Rig::new(128 * 1024);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for round in 0..3000u64 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..2048);
                if let Some(ptr) = rig.malloc(size) {
                    rig.memory.fill(ptr, size, (round & 0xFF) as u8);
                    live.push((ptr, size));
                }
            } else {
                let (ptr, _) = live.swap_remove(rng.gen_range(0..live.len()));
                rig.free(ptr);
                assert_no_adjacent_free(&rig.blocks());
            }
        }

        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlapping allocations");
        }
        for (ptr, _) in live.drain(..) {
            rig.free(ptr);
        }
        let blocks = rig.blocks();
        assert_no_adjacent_free(&blocks);
        assert!(blocks.iter().all(|b| b.free));
    }
}
