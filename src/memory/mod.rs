//! Memory management: frames, page tables, the kernel heap and the DMA pool.
//!
//! [`MemoryManager`] owns every piece and is the only way the rest of the
//! kernel touches them. Bring-up order is fixed:
//!
//! 1. frame allocator (built by the caller and handed to [`MemoryManager::new`])
//! 2. [`MemoryManager::heap_init`], physical heap
//! 3. [`MemoryManager::paging_init`], identity map and paging on
//! 4. [`MemoryManager::heap_init_virtual`], heap grows through `kmalloc_virtual`
//! 5. [`MemoryManager::dma_init`]

pub mod bitmap_frame_allocator;
pub mod dma;
pub mod fault;
pub mod heap;
pub mod mmu;
pub mod paging;
pub mod phys;
pub mod vmalloc;

use core::{alloc::Layout, fmt};

use log::{debug, info, warn};
use x86_64::{structures::paging::PageTableFlags, PhysAddr, VirtAddr};

use crate::{
    constants::memory::{HEAP_ALIGNMENT, PAGE_SIZE},
    init::FramebufferInfo,
};
use bitmap_frame_allocator::{BitmapFrameAllocator, FrameStats};
use dma::{DmaPool, DmaStats};
use heap::{Heap, HeapBackend, HeapError, HeapMode, HeapStats, PhysicalHeap};
use mmu::PagingHardware;
use paging::{PageMapper, PagingError, PagingMode, PagingState};
use phys::PhysMemory;
use vmalloc::VirtualRegions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    Heap(HeapError),
    Paging(PagingError),
}

impl From<HeapError> for MemoryError {
    fn from(err: HeapError) -> Self {
        MemoryError::Heap(err)
    }
}

impl From<PagingError> for MemoryError {
    fn from(err: PagingError) -> Self {
        MemoryError::Paging(err)
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Heap(err) => write!(f, "heap: {}", err),
            MemoryError::Paging(err) => write!(f, "paging: {}", err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagingStats {
    pub total_virtual: u64,
    pub used_virtual: u64,
    pub total_phys: u64,
    pub used_phys: u64,
}

pub struct MemoryManager<M, H> {
    memory: M,
    hardware: H,
    frames: BitmapFrameAllocator,
    mapper: PageMapper,
    regions: VirtualRegions,
    heap: Heap,
    dma: DmaPool,
}

impl<M: PhysMemory, H: PagingHardware> MemoryManager<M, H> {
    pub fn new(memory: M, hardware: H, frames: BitmapFrameAllocator, mode: PagingMode) -> Self {
        let (start, end) = mode.heap_range();
        Self {
            memory,
            hardware,
            frames,
            mapper: PageMapper::new(mode),
            regions: VirtualRegions::new(start, end),
            heap: Heap::new(),
            dma: DmaPool::new(),
        }
    }

    pub fn heap_init(&mut self, initial_size: u64) -> Result<(), HeapError> {
        let mut backend = PhysicalHeap {
            memory: &mut self.memory,
            frames: &mut self.frames,
        };
        self.heap.init(&mut backend, initial_size)
    }

    pub fn paging_init(
        &mut self,
        framebuffer: Option<&FramebufferInfo>,
    ) -> Result<(), PagingError> {
        self.mapper.init(
            &mut self.memory,
            &mut self.frames,
            &mut self.hardware,
            framebuffer,
        )
    }

    /// Switches heap growth to mapped virtual memory.
    pub fn heap_init_virtual(&mut self) -> Result<(), HeapError> {
        if !self.heap.is_initialized() {
            return Err(HeapError::NotInitialized);
        }
        if self.mapper.state() != PagingState::Enabled {
            return Err(HeapError::PagingRequired);
        }
        self.heap.enable_virtual_mode()
    }

    pub fn dma_init(&mut self) {
        self.dma.init();
    }

    /// Runs `f` against the heap with the backend matching its mode.
    fn with_heap<R>(&mut self, f: impl FnOnce(&mut Heap, &mut dyn HeapBackend) -> R) -> R {
        match self.heap.mode() {
            HeapMode::Physical => {
                let mut backend = PhysicalHeap {
                    memory: &mut self.memory,
                    frames: &mut self.frames,
                };
                f(&mut self.heap, &mut backend)
            }
            HeapMode::Virtual => {
                let mut backend = self.space();
                f(backend.heap, &mut backend.space)
            }
        }
    }

    fn space(&mut self) -> SpaceWithHeap<'_, M, H> {
        SpaceWithHeap {
            heap: &mut self.heap,
            space: VirtualSpace {
                memory: &mut self.memory,
                hardware: &mut self.hardware,
                frames: &mut self.frames,
                mapper: &mut self.mapper,
                regions: &mut self.regions,
            },
        }
    }

    pub fn kmalloc(&mut self, size: u64) -> Option<u64> {
        self.with_heap(|heap, backend| heap.kmalloc(backend, size))
    }

    pub fn kfree(&mut self, ptr: u64) {
        self.with_heap(|heap, backend| heap.kfree(backend, ptr))
    }

    pub fn krealloc(&mut self, ptr: Option<u64>, new_size: u64) -> Option<u64> {
        self.with_heap(|heap, backend| heap.krealloc(backend, ptr, new_size))
    }

    pub fn kmalloc_aligned(&mut self, size: u64, align: u64) -> Option<u64> {
        self.with_heap(|heap, backend| heap.kmalloc_aligned(backend, size, align))
    }

    pub fn heap_stats(&mut self) -> HeapStats {
        self.with_heap(|heap, backend| heap.stats(backend))
    }

    pub fn heap_dump(&mut self) {
        self.with_heap(|heap, backend| heap.dump(backend))
    }

    pub fn heap_mode(&self) -> HeapMode {
        self.heap.mode()
    }

    pub fn kmalloc_virtual(&mut self, size: u64) -> Option<VirtAddr> {
        self.space().space.kmalloc_virtual(size)
    }

    pub fn kfree_virtual(&mut self, addr: VirtAddr, size: u64) {
        self.space().space.kfree_virtual(addr, size)
    }

    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), PagingError> {
        self.mapper.map_page(
            &mut self.memory,
            &mut self.frames,
            &mut self.hardware,
            virt,
            phys,
            flags,
        )
    }

    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<(), PagingError> {
        self.mapper
            .unmap_page(&mut self.memory, &mut self.hardware, virt)
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.mapper.translate(&self.memory, virt)
    }

    /// Maps a device's physical range and returns where it can be reached.
    pub fn physical_to_virtual(
        &mut self,
        phys: PhysAddr,
        size: u64,
    ) -> Result<VirtAddr, PagingError> {
        self.mapper.physical_to_virtual(
            &mut self.memory,
            &mut self.frames,
            &mut self.hardware,
            phys,
            size,
        )
    }

    pub fn paging_stats(&self) -> PagingStats {
        let frames = self.frames.stats();
        PagingStats {
            total_virtual: self.regions.total(),
            used_virtual: self.regions.used(),
            total_phys: frames.total_bytes(),
            used_phys: frames.used_bytes(),
        }
    }

    pub fn dma_alloc(&mut self, size: u64) -> Option<PhysAddr> {
        self.dma.dma_alloc(size)
    }

    pub fn dma_free(&mut self, addr: PhysAddr) -> bool {
        self.dma.dma_free(addr)
    }

    pub fn dma_stats(&self) -> DmaStats {
        self.dma.stats()
    }

    /// Reads heap memory, translating when the heap is in virtual mode.
    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) {
        self.with_heap(|_, backend| backend.read(addr, buf))
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        self.with_heap(|_, backend| backend.write(addr, data))
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    pub fn mapper(&self) -> &PageMapper {
        &self.mapper
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Allocation entry used by the global allocator.
    pub fn alloc_layout(&mut self, layout: Layout) -> Option<*mut u8> {
        let size = layout.size().max(1) as u64;
        let align = layout.align() as u64;
        let addr = if align > HEAP_ALIGNMENT {
            self.kmalloc_aligned(size, align)?
        } else {
            self.kmalloc(size)?
        };

        match self.host_pointer(addr) {
            Some(ptr) => Some(ptr),
            None => {
                self.kfree(addr);
                None
            }
        }
    }

    pub fn dealloc_ptr(&mut self, ptr: *mut u8) {
        let addr = match self.heap.mode() {
            HeapMode::Virtual if self.hardware.live() => Some(ptr as u64),
            _ => self.memory.address_of(ptr),
        };
        match addr {
            Some(addr) => self.kfree(addr),
            None => warn!("heap: dealloc of foreign pointer {:p}", ptr),
        }
    }

    /// Where the kernel can dereference heap address `addr`. Without live
    /// paging hardware only identity-mapped blocks are reachable.
    fn host_pointer(&self, addr: u64) -> Option<*mut u8> {
        match self.heap.mode() {
            HeapMode::Physical => self.memory.as_ptr(addr),
            HeapMode::Virtual if self.hardware.live() => Some(addr as *mut u8),
            HeapMode::Virtual => {
                let virt = VirtAddr::try_new(addr).ok()?;
                self.translate(virt)
                    .filter(|phys| phys.as_u64() == addr)
                    .and_then(|phys| self.memory.as_ptr(phys.as_u64()))
            }
        }
    }
}

struct SpaceWithHeap<'a, M, H> {
    heap: &'a mut Heap,
    space: VirtualSpace<'a, M, H>,
}

/// The kernel address space seen through the page tables.
pub struct VirtualSpace<'a, M, H> {
    memory: &'a mut M,
    hardware: &'a mut H,
    frames: &'a mut BitmapFrameAllocator,
    mapper: &'a mut PageMapper,
    regions: &'a mut VirtualRegions,
}

impl<M: PhysMemory, H: PagingHardware> VirtualSpace<'_, M, H> {
    /// Physical address behind `addr`, if it is mapped.
    fn resolve(&self, addr: u64) -> Option<u64> {
        let virt = VirtAddr::try_new(addr).ok()?;
        self.mapper
            .translate(&*self.memory, virt)
            .map(PhysAddr::as_u64)
    }

    /// Reserves a page-rounded range of the heap window and backs it with
    /// freshly mapped frames.
    pub fn kmalloc_virtual(&mut self, size: u64) -> Option<VirtAddr> {
        if size == 0 {
            return None;
        }
        let size = size.checked_next_multiple_of(PAGE_SIZE)?;
        let pages = (size / PAGE_SIZE) as usize;

        let Some(start) = self.regions.reserve(size) else {
            warn!("vmalloc: out of kernel heap space for {} bytes", size);
            return None;
        };
        let Some(phys) = self.frames.alloc_pages(pages) else {
            self.regions.unreserve(start, size);
            warn!("vmalloc: no {} contiguous frames", pages);
            return None;
        };

        for i in 0..pages as u64 {
            let virt = VirtAddr::new(start + i * PAGE_SIZE);
            let mapped = self.mapper.map_page(
                &mut *self.memory,
                &mut *self.frames,
                &mut *self.hardware,
                virt,
                phys + i * PAGE_SIZE,
                PageTableFlags::WRITABLE,
            );
            if let Err(err) = mapped {
                warn!("vmalloc: mapping {:#x} failed: {}", virt.as_u64(), err);
                for j in 0..i {
                    let undo = VirtAddr::new(start + j * PAGE_SIZE);
                    let _ = self
                        .mapper
                        .unmap_page(&mut *self.memory, &mut *self.hardware, undo);
                }
                self.frames.free_pages(phys, pages);
                self.regions.unreserve(start, size);
                return None;
            }
        }

        debug!(
            "vmalloc: {:#x} -> {:#x} ({} pages)",
            start,
            phys.as_u64(),
            pages
        );
        Some(VirtAddr::new(start))
    }

    /// Unmaps `size` bytes at `addr`, returning frames and the range. A
    /// range whose first page is not mapped was never handed out, or was
    /// freed already, and is left alone.
    pub fn kfree_virtual(&mut self, addr: VirtAddr, size: u64) {
        let start = addr.as_u64();
        if !self.regions.contains(start) {
            warn!("vmalloc: free of {:#x} outside the heap window", start);
            return;
        }
        if size == 0 {
            return;
        }
        if self.mapper.translate(&*self.memory, addr).is_none() {
            warn!("vmalloc: free of unmapped {:#x} ignored", start);
            return;
        }
        let size = size.next_multiple_of(PAGE_SIZE);

        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            let virt = addr + offset;
            if let Some(phys) = self.mapper.translate(&*self.memory, virt) {
                self.frames.free_page(phys);
            }
            if let Err(err) = self
                .mapper
                .unmap_page(&mut *self.memory, &mut *self.hardware, virt)
            {
                warn!("vmalloc: unmapping {:#x} failed: {}", virt.as_u64(), err);
            }
        }

        if let Err(err) = self.regions.release(start, size) {
            warn!("vmalloc: {:#x} ({} bytes) leaked: {}", start, size, err);
        }
    }
}

impl<M: PhysMemory, H: PagingHardware> HeapBackend for VirtualSpace<'_, M, H> {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let n = ((PAGE_SIZE - at % PAGE_SIZE) as usize).min(buf.len() - done);
            match self.resolve(at) {
                Some(phys) => self.memory.read(phys, &mut buf[done..done + n]),
                None => {
                    warn!("vmalloc: read of unmapped address {:#x}", at);
                    buf[done..done + n].fill(0);
                }
            }
            done += n;
        }
    }

    fn write(&mut self, addr: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            let n = ((PAGE_SIZE - at % PAGE_SIZE) as usize).min(data.len() - done);
            match self.resolve(at) {
                Some(phys) => self.memory.write(phys, &data[done..done + n]),
                None => warn!("vmalloc: write to unmapped address {:#x} dropped", at),
            }
            done += n;
        }
    }

    fn grow(&mut self, bytes: u64) -> Option<u64> {
        self.kmalloc_virtual(bytes).map(VirtAddr::as_u64)
    }
}

/// Logs a one-line summary of every allocator.
pub fn log_summary<M: PhysMemory, H: PagingHardware>(memory: &mut MemoryManager<M, H>) {
    let frames = memory.frame_stats();
    let heap = memory.heap_stats();
    let dma = memory.dma_stats();
    info!(
        "memory: frames {}/{} used, heap {} KB used of {} KB, dma {} KB free",
        frames.used_frames,
        frames.total_frames,
        heap.used_size / 1024,
        heap.total_size / 1024,
        dma.free / 1024
    );
}
