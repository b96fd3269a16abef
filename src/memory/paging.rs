//! Page tables.
//!
//! One walker covers both table formats: 32-bit legacy paging (two levels,
//! 10-bit indices, 4-byte entries) and x86_64 long-mode paging (four levels,
//! 9-bit indices, 8-byte entries). Tables live in physical memory and are
//! accessed through [`PhysMemory`], so the same code builds the tables the
//! CPU walks and the ones the host tests inspect.

use core::fmt;

use log::{debug, info, warn};
use raw_cpuid::CpuId;
use x86_64::{
    structures::paging::{FrameAllocator, PageTableFlags, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::{
    constants::memory::{
        EPHEMERAL_KERNEL_MAPPINGS_START, HEAP_END, HEAP_START, HUGE_PAGE_SIZE, IDENTITY_MAP_SIZE,
        LEGACY_DEVICE_MAPPINGS_START, LEGACY_HEAP_END, LEGACY_HEAP_START, PAGE_SIZE,
        VGA_TEXT_BUFFER,
    },
    init::FramebufferInfo,
    memory::{mmu::PagingHardware, phys::PhysMemory},
};

/// Page-table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 2-level, 32-bit tables. No NX bit.
    Legacy32,
    /// 4-level, 64-bit tables.
    Long4,
}

impl PagingMode {
    /// Long mode when the CPU reports it, 32-bit paging otherwise.
    pub fn detect() -> Self {
        let long_mode = CpuId::new()
            .get_extended_processor_and_feature_identifiers()
            .is_some_and(|features| features.has_64bit_mode());
        if long_mode {
            PagingMode::Long4
        } else {
            PagingMode::Legacy32
        }
    }

    pub const fn levels(self) -> usize {
        match self {
            PagingMode::Legacy32 => 2,
            PagingMode::Long4 => 4,
        }
    }

    pub const fn entry_size(self) -> u64 {
        match self {
            PagingMode::Legacy32 => 4,
            PagingMode::Long4 => 8,
        }
    }

    const fn index_bits(self) -> u32 {
        match self {
            PagingMode::Legacy32 => 10,
            PagingMode::Long4 => 9,
        }
    }

    /// Bits of virtual address covered by one entry at `level` (0 = root).
    const fn shift(self, level: usize) -> u32 {
        12 + self.index_bits() * (self.levels() - 1 - level) as u32
    }

    fn index(self, virt: u64, level: usize) -> u64 {
        (virt >> self.shift(level)) & ((1 << self.index_bits()) - 1)
    }

    const fn address_mask(self) -> u64 {
        match self {
            PagingMode::Legacy32 => 0xFFFF_F000,
            PagingMode::Long4 => 0x000F_FFFF_FFFF_F000,
        }
    }

    /// Highest address (exclusive) the format can express.
    const fn address_limit(self) -> u64 {
        match self {
            PagingMode::Legacy32 => 1 << 32,
            PagingMode::Long4 => u64::MAX,
        }
    }

    /// Virtual range backing `kmalloc_virtual`.
    pub const fn heap_range(self) -> (u64, u64) {
        match self {
            PagingMode::Legacy32 => (LEGACY_HEAP_START, LEGACY_HEAP_END),
            PagingMode::Long4 => (HEAP_START, HEAP_END),
        }
    }

    /// Start of the window used by `physical_to_virtual`.
    pub const fn device_window(self) -> u64 {
        match self {
            PagingMode::Legacy32 => LEGACY_DEVICE_MAPPINGS_START,
            PagingMode::Long4 => EPHEMERAL_KERNEL_MAPPINGS_START,
        }
    }

    fn encode(self, phys: u64, flags: PageTableFlags) -> u64 {
        let mut bits = flags.bits();
        if self == PagingMode::Legacy32 {
            bits &= 0xFFF;
        }
        (phys & self.address_mask()) | bits
    }

    fn read_entry<M: PhysMemory>(self, mem: &M, slot: u64) -> u64 {
        match self {
            PagingMode::Legacy32 => mem.read_u32(slot) as u64,
            PagingMode::Long4 => mem.read_u64(slot),
        }
    }

    fn write_entry<M: PhysMemory>(self, mem: &mut M, slot: u64, entry: u64) {
        match self {
            PagingMode::Legacy32 => mem.write_u32(slot, entry as u32),
            PagingMode::Long4 => mem.write_u64(slot, entry),
        }
    }

    fn slot(self, table: u64, virt: u64, level: usize) -> u64 {
        table + self.index(virt, level) * self.entry_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingState {
    Uninitialized,
    IdentityMapped,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    NotInitialized,
    AlreadyInitialized,
    /// No frame left for a page table.
    OutOfFrames,
    /// The walk hit a huge-page entry covering this address.
    HugePageConflict(VirtAddr),
    /// Address not expressible in the current table format.
    AddressOutOfRange(u64),
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagingError::NotInitialized => write!(f, "paging not initialized"),
            PagingError::AlreadyInitialized => write!(f, "paging already initialized"),
            PagingError::OutOfFrames => write!(f, "out of frames for page tables"),
            PagingError::HugePageConflict(virt) => {
                write!(f, "{:#x} is covered by a huge page", virt.as_u64())
            }
            PagingError::AddressOutOfRange(addr) => {
                write!(f, "{:#x} not addressable in this paging mode", addr)
            }
        }
    }
}

/// The kernel's page tables.
pub struct PageMapper {
    mode: PagingMode,
    root: Option<PhysAddr>,
    state: PagingState,
    device_next: u64,
    tables_allocated: usize,
}

const ENTRIES_PER_TABLE: u64 = 512;
/// First long-mode root entry covering the higher half.
const KERNEL_HALF_FIRST_ENTRY: u64 = 256;

/// Copies the higher-half entries of the long-mode root `from` into `to`.
fn share_kernel_half<M: PhysMemory>(mem: &mut M, from: PhysAddr, to: PhysAddr) {
    for index in KERNEL_HALF_FIRST_ENTRY..ENTRIES_PER_TABLE {
        let entry = mem.read_u64(from.as_u64() + index * 8);
        mem.write_u64(to.as_u64() + index * 8, entry);
    }
}

impl PageMapper {
    pub const fn new(mode: PagingMode) -> Self {
        Self {
            mode,
            root: None,
            state: PagingState::Uninitialized,
            device_next: 0,
            tables_allocated: 0,
        }
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn state(&self) -> PagingState {
        self.state
    }

    pub fn root(&self) -> Option<PhysAddr> {
        self.root
    }

    /// Page-table frames allocated so far, root included.
    pub fn tables_allocated(&self) -> usize {
        self.tables_allocated
    }

    /// Builds the bootstrap address space and turns paging on.
    ///
    /// Identity-maps the low [`IDENTITY_MAP_SIZE`] bytes, the VGA text buffer
    /// and, when `framebuffer` is valid, the linear framebuffer. In long mode
    /// the upper half of the active root (kernel image, stack, direct map) is
    /// carried over before the new root is loaded.
    pub fn init<M, A, H>(
        &mut self,
        mem: &mut M,
        frames: &mut A,
        hw: &mut H,
        framebuffer: Option<&FramebufferInfo>,
    ) -> Result<(), PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
        H: PagingHardware,
    {
        if self.state != PagingState::Uninitialized {
            return Err(PagingError::AlreadyInitialized);
        }

        info!("paging: building {:?} tables", self.mode);
        let root = self.alloc_table(mem, frames)?;
        self.root = Some(root);

        if self.mode == PagingMode::Long4 {
            if let Some(active) = hw.active_root() {
                share_kernel_half(mem, active, root);
                debug!("paging: kernel half shared with {:#x}", active.as_u64());
            }
        }

        self.identity_map_low(mem, frames, root)?;
        self.state = PagingState::IdentityMapped;
        info!(
            "paging: identity mapped first {} MB",
            IDENTITY_MAP_SIZE / (1024 * 1024)
        );

        self.identity_map_range(mem, frames, VGA_TEXT_BUFFER, PAGE_SIZE)?;

        match framebuffer.filter(|fb| fb.is_valid()) {
            Some(fb) => {
                info!(
                    "paging: framebuffer {}x{} pitch {} at {:#x}",
                    fb.width, fb.height, fb.pitch, fb.address
                );
                match self.identity_map_range(mem, frames, fb.address, fb.size()) {
                    Err(PagingError::AddressOutOfRange(addr)) => {
                        warn!("paging: framebuffer at {:#x} not addressable, skipped", addr)
                    }
                    other => other?,
                }
            }
            None => info!("paging: no graphics framebuffer"),
        }

        hw.load_root(root);
        hw.enable_paging(self.mode);
        self.state = PagingState::Enabled;
        info!(
            "paging: enabled, root table at {:#x}, {} tables",
            root.as_u64(),
            self.tables_allocated
        );
        Ok(())
    }

    fn alloc_table<M, A>(&mut self, mem: &mut M, frames: &mut A) -> Result<PhysAddr, PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
    {
        let frame = frames.allocate_frame().ok_or(PagingError::OutOfFrames)?;
        let addr = frame.start_address();
        if addr.as_u64() >= self.mode.address_limit() {
            return Err(PagingError::AddressOutOfRange(addr.as_u64()));
        }
        mem.fill(addr.as_u64(), PAGE_SIZE, 0);
        self.tables_allocated += 1;
        Ok(addr)
    }

    fn identity_map_low<M, A>(
        &mut self,
        mem: &mut M,
        frames: &mut A,
        root: PhysAddr,
    ) -> Result<(), PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
    {
        let table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        match self.mode {
            PagingMode::Long4 => {
                let pdpt = self.alloc_table(mem, frames)?;
                let pd = self.alloc_table(mem, frames)?;
                let mode = self.mode;
                mode.write_entry(mem, root.as_u64(), mode.encode(pdpt.as_u64(), table_flags));
                mode.write_entry(mem, pdpt.as_u64(), mode.encode(pd.as_u64(), table_flags));
                for i in 0..IDENTITY_MAP_SIZE / HUGE_PAGE_SIZE {
                    let huge = table_flags | PageTableFlags::HUGE_PAGE;
                    let entry = mode.encode(i * HUGE_PAGE_SIZE, huge);
                    mode.write_entry(mem, pd.as_u64() + i * 8, entry);
                }
            }
            PagingMode::Legacy32 => {
                for addr in (0..IDENTITY_MAP_SIZE).step_by(PAGE_SIZE as usize) {
                    self.install(mem, frames, root, addr, addr, PageTableFlags::WRITABLE)?;
                }
            }
        }
        Ok(())
    }

    /// Identity-maps `[start, start + len)`, leaving pages that already
    /// translate to themselves untouched.
    fn identity_map_range<M, A>(
        &mut self,
        mem: &mut M,
        frames: &mut A,
        start: u64,
        len: u64,
    ) -> Result<(), PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
    {
        let root = self.root.ok_or(PagingError::NotInitialized)?;
        let first = start & !(PAGE_SIZE - 1);
        let end = start
            .checked_add(len.max(1))
            .ok_or(PagingError::AddressOutOfRange(start))?
            .next_multiple_of(PAGE_SIZE);

        let mut mapped = 0;
        for addr in (first..end).step_by(PAGE_SIZE as usize) {
            if self.translate_raw(mem, addr) == Some(addr) {
                continue;
            }
            self.install(mem, frames, root, addr, addr, PageTableFlags::WRITABLE)?;
            mapped += 1;
        }
        debug!(
            "paging: identity mapped {:#x}..{:#x} ({} new pages)",
            first, end, mapped
        );
        Ok(())
    }

    /// Maps `virt` to `phys`, creating intermediate tables as needed, then
    /// drops the stale TLB entry.
    pub fn map_page<M, A, H>(
        &mut self,
        mem: &mut M,
        frames: &mut A,
        hw: &mut H,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
        H: PagingHardware,
    {
        let root = self.root.ok_or(PagingError::NotInitialized)?;
        self.install(mem, frames, root, virt.as_u64(), phys.as_u64(), flags)?;
        hw.invalidate(virt);
        Ok(())
    }

    fn install<M, A>(
        &mut self,
        mem: &mut M,
        frames: &mut A,
        root: PhysAddr,
        virt: u64,
        phys: u64,
        flags: PageTableFlags,
    ) -> Result<(), PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
    {
        let mode = self.mode;
        for addr in [virt, phys] {
            if addr >= mode.address_limit() {
                return Err(PagingError::AddressOutOfRange(addr));
            }
        }

        let user = flags & PageTableFlags::USER_ACCESSIBLE;
        let mut table = root.as_u64();
        for level in 0..mode.levels() - 1 {
            let slot = mode.slot(table, virt, level);
            let entry = mode.read_entry(mem, slot);
            let entry_flags = PageTableFlags::from_bits_truncate(entry);

            table = if !entry_flags.contains(PageTableFlags::PRESENT) {
                let next = self.alloc_table(mem, frames)?;
                let table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | user;
                mode.write_entry(mem, slot, mode.encode(next.as_u64(), table_flags));
                next.as_u64()
            } else if entry_flags.contains(PageTableFlags::HUGE_PAGE) {
                return Err(PagingError::HugePageConflict(VirtAddr::new_truncate(virt)));
            } else {
                if !user.is_empty() && !entry_flags.contains(PageTableFlags::USER_ACCESSIBLE) {
                    mode.write_entry(mem, slot, entry | user.bits());
                }
                entry & mode.address_mask()
            };
        }

        let leaf = mode.slot(table, virt, mode.levels() - 1);
        mode.write_entry(mem, leaf, mode.encode(phys, flags | PageTableFlags::PRESENT));
        Ok(())
    }

    /// Clears the present bit of the mapping for `virt`. Intermediate tables
    /// are kept even when they become empty; unmapped addresses are ignored.
    pub fn unmap_page<M, H>(
        &mut self,
        mem: &mut M,
        hw: &mut H,
        virt: VirtAddr,
    ) -> Result<(), PagingError>
    where
        M: PhysMemory,
        H: PagingHardware,
    {
        let Some(slot) = self.leaf_slot(mem, virt.as_u64())? else {
            return Ok(());
        };
        let mode = self.mode;
        let entry = mode.read_entry(mem, slot);
        mode.write_entry(mem, slot, entry & !PageTableFlags::PRESENT.bits());
        hw.invalidate(virt);
        Ok(())
    }

    /// Location of the 4 KiB leaf entry for `virt`, if its tables exist.
    fn leaf_slot<M: PhysMemory>(&self, mem: &M, virt: u64) -> Result<Option<u64>, PagingError> {
        let root = self.root.ok_or(PagingError::NotInitialized)?;
        let mode = self.mode;
        let mut table = root.as_u64();
        for level in 0..mode.levels() - 1 {
            let entry = mode.read_entry(mem, mode.slot(table, virt, level));
            let flags = PageTableFlags::from_bits_truncate(entry);
            if !flags.contains(PageTableFlags::PRESENT) {
                return Ok(None);
            }
            if flags.contains(PageTableFlags::HUGE_PAGE) {
                return Err(PagingError::HugePageConflict(VirtAddr::new_truncate(virt)));
            }
            table = entry & mode.address_mask();
        }
        Ok(Some(mode.slot(table, virt, mode.levels() - 1)))
    }

    /// Physical address `virt` currently maps to.
    pub fn translate<M: PhysMemory>(&self, mem: &M, virt: VirtAddr) -> Option<PhysAddr> {
        self.translate_raw(mem, virt.as_u64()).map(PhysAddr::new)
    }

    fn translate_raw<M: PhysMemory>(&self, mem: &M, virt: u64) -> Option<u64> {
        self.walk(mem, virt).map(|(entry, page_size)| {
            (entry & self.mode.address_mask() & !(page_size - 1)) | (virt & (page_size - 1))
        })
    }

    /// Flags of the entry mapping `virt`.
    pub fn entry_flags<M: PhysMemory>(&self, mem: &M, virt: VirtAddr) -> Option<PageTableFlags> {
        self.walk(mem, virt.as_u64())
            .map(|(entry, _)| PageTableFlags::from_bits_truncate(entry))
    }

    /// Returns the present entry mapping `virt` and the size of the page it maps.
    fn walk<M: PhysMemory>(&self, mem: &M, virt: u64) -> Option<(u64, u64)> {
        let mode = self.mode;
        if virt >= mode.address_limit() {
            return None;
        }
        let mut table = self.root?.as_u64();
        for level in 0..mode.levels() {
            let entry = mode.read_entry(mem, mode.slot(table, virt, level));
            let flags = PageTableFlags::from_bits_truncate(entry);
            if !flags.contains(PageTableFlags::PRESENT) {
                return None;
            }
            let is_leaf = level == mode.levels() - 1;
            if is_leaf || flags.contains(PageTableFlags::HUGE_PAGE) {
                return Some((entry, 1 << mode.shift(level)));
            }
            table = entry & mode.address_mask();
        }
        None
    }

    /// Maps a device range into the kernel's device window and returns the
    /// virtual address of `phys`.
    pub fn physical_to_virtual<M, A, H>(
        &mut self,
        mem: &mut M,
        frames: &mut A,
        hw: &mut H,
        phys: PhysAddr,
        size: u64,
    ) -> Result<VirtAddr, PagingError>
    where
        M: PhysMemory,
        A: FrameAllocator<Size4KiB>,
        H: PagingHardware,
    {
        let base = phys.align_down(PAGE_SIZE);
        let offset = phys - base;
        let pages = (offset + size.max(1)).div_ceil(PAGE_SIZE);
        let window = self.mode.device_window() + self.device_next;
        let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_CACHE;

        for i in 0..pages {
            let virt = VirtAddr::new(window + i * PAGE_SIZE);
            self.map_page(mem, frames, hw, virt, base + i * PAGE_SIZE, flags)?;
        }
        self.device_next += pages * PAGE_SIZE;

        debug!(
            "paging: device {:#x} ({} bytes) mapped at {:#x}",
            phys.as_u64(),
            size,
            window + offset
        );
        Ok(VirtAddr::new(window + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        mmu::{MmuEvent, SimulatedPaging},
        phys::RamArena,
    };
    use alloc::{boxed::Box, vec};

    const MEMORY: u64 = 16 * 1024 * 1024;

    struct Rig {
        mem: RamArena,
        frames: BitmapFrameAllocator,
        hw: SimulatedPaging,
        mapper: PageMapper,
    }

    fn rig(mode: PagingMode) -> Rig {
        let words = BitmapFrameAllocator::bitmap_words(MEMORY);
        let storage = Box::leak(vec![0u64; words].into_boxed_slice());
        Rig {
            mem: RamArena::new(MEMORY as usize),
            frames: BitmapFrameAllocator::init(MEMORY, PhysAddr::new(0x100000), storage).unwrap(),
            hw: SimulatedPaging::new(),
            mapper: PageMapper::new(mode),
        }
    }

    fn booted(mode: PagingMode, fb: Option<&FramebufferInfo>) -> Rig {
        let mut rig = rig(mode);
        rig.mapper
            .init(&mut rig.mem, &mut rig.frames, &mut rig.hw, fb)
            .unwrap();
        rig
    }

    const FRAMEBUFFER: FramebufferInfo = FramebufferInfo {
        address: 0xFD00_0000,
        width: 800,
        height: 600,
        pitch: 3200,
    };

    fn identity(rig: &Rig, addr: u64) -> bool {
        rig.mapper.translate(&rig.mem, VirtAddr::new(addr)) == Some(PhysAddr::new(addr))
    }

    #[test]
    fn test_long_mode_init_identity_maps_low_memory() {
        let rig = booted(PagingMode::Long4, None);

        assert_eq!(rig.mapper.state(), PagingState::Enabled);
        // Root, PDPT and one page directory of 2 MiB pages.
        assert_eq!(rig.mapper.tables_allocated(), 3);
        for addr in [0x0, 0x1234, VGA_TEXT_BUFFER, 0x1F_FFFF, IDENTITY_MAP_SIZE - 1] {
            assert!(identity(&rig, addr), "{:#x} not identity mapped", addr);
        }
        assert_eq!(rig.mapper.translate(&rig.mem, VirtAddr::new(IDENTITY_MAP_SIZE)), None);

        let root = rig.mapper.root().unwrap();
        assert_eq!(
            &rig.hw.events[..],
            &[MmuEvent::LoadRoot(root), MmuEvent::Enable(PagingMode::Long4)]
        );
        assert!(rig.hw.enabled);
    }

    #[test]
    fn test_legacy_init_uses_small_pages() {
        let rig = booted(PagingMode::Legacy32, None);

        // Page directory plus eight page tables for 32 MiB.
        assert_eq!(rig.mapper.tables_allocated(), 9);
        assert!(identity(&rig, 0x12_3456));
        assert!(identity(&rig, VGA_TEXT_BUFFER));
        let flags = rig
            .mapper
            .entry_flags(&rig.mem, VirtAddr::new(0x5000))
            .unwrap();
        assert!(!flags.contains(PageTableFlags::HUGE_PAGE));
        assert!(flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn test_framebuffer_mapped_when_valid() {
        for mode in [PagingMode::Long4, PagingMode::Legacy32] {
            let rig = booted(mode, Some(&FRAMEBUFFER));
            let last = FRAMEBUFFER.address + FRAMEBUFFER.size() - 1;
            assert!(identity(&rig, FRAMEBUFFER.address));
            assert!(identity(&rig, last));
            assert_eq!(
                rig.mapper.translate(&rig.mem, VirtAddr::new(last.next_multiple_of(PAGE_SIZE))),
                None
            );
        }
    }

    #[test]
    fn test_invalid_framebuffer_ignored() {
        let baseline = booted(PagingMode::Long4, None).mapper.tables_allocated();
        for address in [0, u64::MAX, VGA_TEXT_BUFFER] {
            let fb = FramebufferInfo {
                address,
                ..FRAMEBUFFER
            };
            let rig = booted(PagingMode::Long4, Some(&fb));
            assert_eq!(rig.mapper.tables_allocated(), baseline);
        }
    }

    #[test]
    fn test_long_mode_init_shares_kernel_half() {
        let mut rig = rig(PagingMode::Long4);
        let active = rig.frames.allocate_frame().unwrap().start_address();
        rig.mem.fill(active.as_u64(), PAGE_SIZE, 0);
        rig.mem.write_u64(active.as_u64(), 0xDEAD_0003);
        rig.mem.write_u64(active.as_u64() + 256 * 8, 0x0040_0003);
        rig.mem.write_u64(active.as_u64() + 511 * 8, 0x0050_0063);
        rig.hw.boot_root = Some(active);

        rig.mapper
            .init(&mut rig.mem, &mut rig.frames, &mut rig.hw, None)
            .unwrap();
        let root = rig.mapper.root().unwrap().as_u64();
        assert_eq!(rig.mem.read_u64(root + 256 * 8), 0x0040_0003);
        assert_eq!(rig.mem.read_u64(root + 511 * 8), 0x0050_0063);
        assert_ne!(rig.mem.read_u64(root), 0xDEAD_0003);
        assert!(identity(&rig, 0x1234));
    }

    #[test]
    fn test_legacy_init_ignores_active_root() {
        let mut rig = rig(PagingMode::Legacy32);
        rig.hw.boot_root = Some(PhysAddr::new(0x40_0000));
        rig.mem.write_u32(0x40_0000 + 1023 * 4, 0x0080_0003);
        rig.mapper
            .init(&mut rig.mem, &mut rig.frames, &mut rig.hw, None)
            .unwrap();
        let root = rig.mapper.root().unwrap().as_u64();
        assert_eq!(rig.mem.read_u32(root + 1023 * 4), 0);
    }

    #[test]
    fn test_init_twice_rejected() {
        let mut rig = booted(PagingMode::Long4, None);
        let result = rig.mapper.init(&mut rig.mem, &mut rig.frames, &mut rig.hw, None);
        assert_eq!(result, Err(PagingError::AlreadyInitialized));
    }

    #[test]
    fn test_map_before_init_fails() {
        let mut rig = rig(PagingMode::Long4);
        let result = rig.mapper.map_page(
            &mut rig.mem,
            &mut rig.frames,
            &mut rig.hw,
            VirtAddr::new(HEAP_START),
            PhysAddr::new(0x200000),
            PageTableFlags::WRITABLE,
        );
        assert_eq!(result, Err(PagingError::NotInitialized));
    }

    #[test]
    fn test_map_and_unmap_page() {
        for mode in [PagingMode::Long4, PagingMode::Legacy32] {
            let mut rig = booted(mode, None);
            let (heap_start, _) = mode.heap_range();
            let virt = VirtAddr::new(heap_start + 0x3000);
            let phys = rig.frames.alloc_page().unwrap();
            let tables_before = rig.mapper.tables_allocated();

            let flags = PageTableFlags::WRITABLE;
            rig.mapper
                .map_page(&mut rig.mem, &mut rig.frames, &mut rig.hw, virt, phys, flags)
                .unwrap();
            assert!(rig.mapper.tables_allocated() > tables_before);
            assert_eq!(rig.mapper.translate(&rig.mem, virt + 0x10u64), Some(phys + 0x10u64));
            assert_eq!(rig.hw.invalidations().last(), Some(virt));

            let used = rig.frames.stats().used_frames;
            rig.mapper.unmap_page(&mut rig.mem, &mut rig.hw, virt).unwrap();
            assert_eq!(rig.mapper.translate(&rig.mem, virt), None);
            assert_eq!(rig.hw.invalidations().last(), Some(virt));
            // Intermediate tables stay allocated.
            assert_eq!(rig.frames.stats().used_frames, used);
        }
    }

    #[test]
    fn test_no_execute_only_in_long_mode() {
        for (mode, expect_nx) in [(PagingMode::Long4, true), (PagingMode::Legacy32, false)] {
            let mut rig = booted(mode, None);
            let virt = VirtAddr::new(mode.heap_range().0);
            let phys = rig.frames.alloc_page().unwrap();
            let flags = PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
            rig.mapper
                .map_page(&mut rig.mem, &mut rig.frames, &mut rig.hw, virt, phys, flags)
                .unwrap();

            let stored = rig.mapper.entry_flags(&rig.mem, virt).unwrap();
            assert_eq!(stored.contains(PageTableFlags::NO_EXECUTE), expect_nx);
            assert!(stored.contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE));
        }
    }

    #[test]
    fn test_user_flag_propagates_to_tables() {
        let mut rig = booted(PagingMode::Long4, None);
        let virt = VirtAddr::new(0x4000_0000);
        let phys = rig.frames.alloc_page().unwrap();
        rig.mapper
            .map_page(
                &mut rig.mem,
                &mut rig.frames,
                &mut rig.hw,
                virt,
                phys,
                PageTableFlags::USER_ACCESSIBLE,
            )
            .unwrap();

        let root = rig.mapper.root().unwrap().as_u64();
        let pml4e = rig.mem.read_u64(root);
        let pml4e = PageTableFlags::from_bits_truncate(pml4e);
        assert!(pml4e.contains(PageTableFlags::USER_ACCESSIBLE));
        let leaf = rig.mapper.entry_flags(&rig.mem, virt).unwrap();
        assert!(leaf.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(!leaf.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn test_huge_page_conflict() {
        let mut rig = booted(PagingMode::Long4, None);
        let virt = VirtAddr::new(0x20_0000);
        let result = rig.mapper.map_page(
            &mut rig.mem,
            &mut rig.frames,
            &mut rig.hw,
            virt,
            PhysAddr::new(0x40_0000),
            PageTableFlags::WRITABLE,
        );
        assert_eq!(result, Err(PagingError::HugePageConflict(virt)));
        assert!(identity(&rig, 0x20_0000));
    }

    #[test]
    fn test_legacy_rejects_wide_addresses() {
        let mut rig = booted(PagingMode::Legacy32, None);
        let result = rig.mapper.map_page(
            &mut rig.mem,
            &mut rig.frames,
            &mut rig.hw,
            VirtAddr::new(0x1_0000_0000),
            PhysAddr::new(0x40_0000),
            PageTableFlags::WRITABLE,
        );
        assert_eq!(result, Err(PagingError::AddressOutOfRange(0x1_0000_0000)));
    }

    #[test]
    fn test_physical_to_virtual_keeps_offset() {
        for mode in [PagingMode::Long4, PagingMode::Legacy32] {
            let mut rig = booted(mode, None);
            let phys = PhysAddr::new(0xFEC0_0020);
            let virt = rig
                .mapper
                .physical_to_virtual(&mut rig.mem, &mut rig.frames, &mut rig.hw, phys, 0x1000)
                .unwrap();

            assert_eq!(virt.as_u64(), mode.device_window() + 0x20);
            assert_eq!(rig.mapper.translate(&rig.mem, virt), Some(phys));
            // The range spills into a second page.
            assert_eq!(
                rig.mapper.translate(&rig.mem, virt + 0x1000u64),
                Some(phys + 0x1000u64)
            );

            let next = rig
                .mapper
                .physical_to_virtual(&mut rig.mem, &mut rig.frames, &mut rig.hw, phys, 4)
                .unwrap();
            assert_eq!(next.as_u64(), mode.device_window() + 0x2000 + 0x20);
        }
    }
}
