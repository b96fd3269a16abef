//! Kernel bring-up
//!
//! Boot discovery comes from the limine requests below. Everything after
//! discovery runs against the [`PhysMemory`], [`PagingHardware`] and
//! [`BlockDevice`] seams, so the whole sequence also runs on the host.

use core::fmt;

use arrayvec::ArrayVec;
use limine::{
    memory_map::EntryType,
    request::{
        FramebufferRequest, HhdmRequest, KernelAddressRequest, MemoryMapRequest,
        RequestsEndMarker, RequestsStartMarker,
    },
    BaseRevision,
};
use log::{info, warn, LevelFilter};
use x86_64::PhysAddr;

use crate::{
    constants::memory::{HEAP_INITIAL_SIZE, MAX_MEMORY_REGIONS, PAGE_SIZE},
    filesys::{exfat::constants::SECTOR_SIZE, BlockDevice},
    logging,
    memory::{
        self,
        bitmap_frame_allocator::{BitmapFrameAllocator, FrameError, MemoryRegion},
        heap::HeapError,
        mmu::PagingHardware,
        paging::{PagingError, PagingMode},
        phys::PhysMemory,
        MemoryManager,
    },
    system::{System, SystemConfig, SystemError},
};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

/// Size of the memory-resident volume: 10 MB.
pub const DEFAULT_VOLUME_SECTORS: u64 = 10 * 1024 * 1024 / SECTOR_SIZE as u64;

/// Linear framebuffer handed over by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// Physical base address
    pub address: u64,
    pub width: u64,
    pub height: u64,
    /// Bytes per scanline
    pub pitch: u64,
}

impl FramebufferInfo {
    pub fn size(&self) -> u64 {
        self.pitch.saturating_mul(self.height)
    }

    /// A null address, an empty mode, or a range that wraps the address
    /// space is not mapped.
    pub fn is_valid(&self) -> bool {
        self.address != 0
            && self.width != 0
            && self.height != 0
            && self.pitch >= self.width
            && self.pitch.checked_mul(self.height).is_some()
            && self.address.checked_add(self.size()).is_some()
    }
}

/// What early boot learned about the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    /// End of the highest usable RAM range, in bytes
    pub memory_size: u64,
    /// Usable RAM ranges of the memory map
    pub usable: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// Virtual offset at which the bootloader maps all physical memory
    pub hhdm_offset: u64,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    /// A machine whose RAM `[0, memory_size)` is all usable.
    pub fn with_memory(memory_size: u64) -> Self {
        let mut usable = ArrayVec::new();
        usable.push(MemoryRegion {
            base: 0,
            length: memory_size,
        });
        Self {
            memory_size,
            usable,
            hhdm_offset: 0,
            framebuffer: None,
        }
    }

    /// Reads the limine responses.
    pub fn from_limine() -> Result<Self, BootError> {
        if !BASE_REVISION.is_supported() {
            return Err(BootError::UnsupportedRevision);
        }
        let memory_map = MEMORY_MAP_REQUEST
            .get_response()
            .ok_or(BootError::NoMemoryMap)?;
        let hhdm_offset = HHDM_REQUEST
            .get_response()
            .map(|hhdm| hhdm.offset())
            .ok_or(BootError::NoMemoryMap)?;

        let mut usable = ArrayVec::new();
        for entry in memory_map
            .entries()
            .iter()
            .filter(|entry| entry.entry_type == EntryType::USABLE)
        {
            let region = MemoryRegion {
                base: entry.base,
                length: entry.length,
            };
            if usable.try_push(region).is_err() {
                warn!("init: memory map range at {:#x} dropped", entry.base);
            }
        }
        let memory_size = usable
            .iter()
            .map(MemoryRegion::end)
            .max()
            .ok_or(BootError::NoMemoryMap)?;

        let framebuffer = FRAMEBUFFER_REQUEST
            .get_response()
            .and_then(|response| response.framebuffers().next())
            .and_then(|fb| {
                Some(FramebufferInfo {
                    address: (fb.addr() as u64).checked_sub(hhdm_offset)?,
                    width: fb.width(),
                    height: fb.height(),
                    pitch: fb.pitch(),
                })
            });

        Ok(Self {
            memory_size,
            usable,
            hhdm_offset,
            framebuffer,
        })
    }

    /// Lowest page-aligned address at or above `after` with `bytes` of
    /// usable RAM behind it.
    pub fn bitmap_site(&self, after: PhysAddr, bytes: u64) -> Option<PhysAddr> {
        self.usable
            .iter()
            .filter_map(|region| {
                let start = region.base.max(after.as_u64()).next_multiple_of(PAGE_SIZE);
                let end = start.checked_add(bytes)?;
                region.contains(start, end).then_some(start)
            })
            .min()
            .map(PhysAddr::new)
    }
}

/// Physical address of the first page after the kernel image.
///
/// # Safety
/// Only meaningful on bare metal, after limine has answered the kernel
/// address request.
#[cfg(target_os = "none")]
pub unsafe fn kernel_end() -> Option<PhysAddr> {
    extern "C" {
        static _kernel_end: u64;
    }
    let response = KERNEL_ADDRESS_REQUEST.get_response()?;
    let virt_end = core::ptr::addr_of!(_kernel_end) as u64;
    let phys_end = virt_end.checked_sub(response.virtual_base())? + response.physical_base();
    Some(PhysAddr::new(phys_end).align_up(PAGE_SIZE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    UnsupportedRevision,
    NoMemoryMap,
    Frames(FrameError),
    Heap(HeapError),
    Paging(PagingError),
    System(SystemError),
}

impl From<FrameError> for BootError {
    fn from(err: FrameError) -> Self {
        BootError::Frames(err)
    }
}

impl From<HeapError> for BootError {
    fn from(err: HeapError) -> Self {
        BootError::Heap(err)
    }
}

impl From<PagingError> for BootError {
    fn from(err: PagingError) -> Self {
        BootError::Paging(err)
    }
}

impl From<SystemError> for BootError {
    fn from(err: SystemError) -> Self {
        BootError::System(err)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::UnsupportedRevision => write!(f, "bootloader revision not supported"),
            BootError::NoMemoryMap => write!(f, "no usable memory map"),
            BootError::Frames(err) => write!(f, "frame allocator: {}", err),
            BootError::Heap(err) => write!(f, "heap: {}", err),
            BootError::Paging(err) => write!(f, "paging: {}", err),
            BootError::System(err) => write!(f, "system: {}", err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub paging_mode: PagingMode,
    /// Bytes given to the physical heap before paging is on
    pub heap_size: u64,
    /// Size of the memory-resident volume
    pub volume_sectors: u64,
    pub log_level: LevelFilter,
    pub system: SystemConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            paging_mode: PagingMode::detect(),
            heap_size: HEAP_INITIAL_SIZE,
            volume_sectors: DEFAULT_VOLUME_SECTORS,
            log_level: logging::default_level(),
            system: SystemConfig::default(),
        }
    }
}

/// Brings up frames, heap, paging and the DMA pool, in that order.
///
/// `bitmap` backs the frame bitmap and lives at physical `bitmap_base`;
/// everything below the end of the bitmap stays reserved, as does every
/// frame outside the usable ranges of `boot_info`.
pub fn init_memory<M: PhysMemory, H: PagingHardware>(
    config: &KernelConfig,
    boot_info: &BootInfo,
    memory: M,
    hardware: H,
    bitmap: &'static mut [u64],
    bitmap_base: PhysAddr,
) -> Result<MemoryManager<M, H>, BootError> {
    info!(
        "init: {} MB of memory, {:?} paging",
        boot_info.memory_size / (1024 * 1024),
        config.paging_mode
    );

    let frames = BitmapFrameAllocator::init_with_regions(&boot_info.usable, bitmap_base, bitmap)?;
    let mut manager = MemoryManager::new(memory, hardware, frames, config.paging_mode);
    manager.heap_init(config.heap_size)?;
    manager.paging_init(boot_info.framebuffer.as_ref())?;
    manager.heap_init_virtual()?;
    manager.dma_init();

    memory::log_summary(&mut manager);
    Ok(manager)
}

/// A booted kernel: the memory manager and the storage stack on top of it
pub struct Kernel<M, H, D: BlockDevice> {
    pub memory: MemoryManager<M, H>,
    pub system: System<D>,
}

impl<M: PhysMemory, H: PagingHardware, D: BlockDevice> Kernel<M, H, D> {
    /// Runs the whole bring-up against `disk`.
    ///
    /// On bare metal the memory manager must be installed as the global
    /// allocator before the storage stack allocates, so the entry point
    /// calls [`init_memory`] and [`System::boot`] itself instead.
    pub fn boot(
        config: &KernelConfig,
        boot_info: &BootInfo,
        memory: M,
        hardware: H,
        bitmap: &'static mut [u64],
        bitmap_base: PhysAddr,
        disk: D,
    ) -> Result<Self, BootError> {
        let memory = init_memory(config, boot_info, memory, hardware, bitmap, bitmap_base)?;
        let system = System::boot(disk, &config.system)?;
        info!("init: boot complete");
        Ok(Self { memory, system })
    }

    /// Clean shutdown of the storage stack.
    pub fn shutdown(&mut self) -> Result<(), BootError> {
        self.system.shutdown()?;
        Ok(())
    }
}
