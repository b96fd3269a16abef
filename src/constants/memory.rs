//! Physical and virtual memory layout.

pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

/// Low-memory window reserved for legacy DMA, `[DMA_REGION_START, DMA_REGION_END)`.
pub const DMA_REGION_START: u64 = 0x10000;
pub const DMA_REGION_END: u64 = 0xA0000;
pub const DMA_BLOCK_GRANULE: u64 = 0x1000;
/// Upper bound on DMA block descriptors (one per granule).
pub const DMA_MAX_BLOCKS: usize = ((DMA_REGION_END - DMA_REGION_START) / DMA_BLOCK_GRANULE) as usize;

/// Physical memory identity-mapped during paging bring-up.
pub const IDENTITY_MAP_SIZE: u64 = 32 * 1024 * 1024;
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

pub const VGA_TEXT_BUFFER: u64 = 0xB8000;

/// Kernel heap virtual range with 32-bit paging.
pub const LEGACY_HEAP_START: u64 = 0xC010_0000;
pub const LEGACY_HEAP_END: u64 = 0xC800_0000;

// Changed the first non F character of kernel_end to an F
pub const HEAP_START: u64 = 0xFFFF_FFFF_0000_0000;
pub const HEAP_END: u64 = HEAP_START + (LEGACY_HEAP_END - LEGACY_HEAP_START);

/// Device mappings created by `physical_to_virtual`.
pub const EPHEMERAL_KERNEL_MAPPINGS_START: u64 = 0xFFFF_FF80_0000_0000;
pub const LEGACY_DEVICE_MAPPINGS_START: u64 = 0xF000_0000;

pub const HEAP_INITIAL_SIZE: u64 = 16 * 1024 * 1024;
pub const HEAP_MAGIC: u32 = 0xDEADBEEF;
pub const HEAP_ALIGNMENT: u64 = 8;
pub const HEAP_MIN_BLOCK_SIZE: u64 = 32;
/// Extra bytes requested on top of a failed allocation when the heap grows.
pub const HEAP_GROWTH_SLACK: u64 = 4096;

/// Usable RAM ranges kept from the bootloader memory map.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Capacity of the freed virtual region pool.
pub const MAX_FREE_REGIONS: usize = 64;
