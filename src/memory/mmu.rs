//! Control-register and TLB access used by the page mapper.

use alloc::vec::Vec;
use x86_64::{PhysAddr, VirtAddr};

use super::paging::PagingMode;

/// The CPU side of paging: root table register, enable bit and TLB.
pub trait PagingHardware {
    /// Point the page-table base register at `root`.
    fn load_root(&mut self, root: PhysAddr);

    /// The root table in use before `load_root`, if any.
    fn active_root(&self) -> Option<PhysAddr> {
        None
    }

    /// Set the paging enable bit.
    fn enable_paging(&mut self, mode: PagingMode);

    /// Drop any cached translation for `virt`.
    fn invalidate(&mut self, virt: VirtAddr);

    /// Whether the CPU actually walks the tables, so mapped virtual
    /// addresses can be dereferenced directly.
    fn live(&self) -> bool {
        false
    }
}

/// Programs the real MMU.
///
/// Only meaningful in ring 0 on bare metal; the host build can name the
/// type but must never call into it.
pub struct X86Paging;

#[cfg(target_arch = "x86_64")]
impl PagingHardware for X86Paging {
    fn load_root(&mut self, root: PhysAddr) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;

        // SAFETY: the root was built by `PageMapper::init`. It shares the
        // upper half of the active root, where the kernel image, its stack
        // and the direct map live.
        unsafe { Cr3::write(PhysFrame::containing_address(root), Cr3Flags::empty()) };
    }

    fn active_root(&self) -> Option<PhysAddr> {
        use x86_64::registers::control::Cr3;

        let (frame, _) = Cr3::read();
        Some(frame.start_address())
    }

    fn enable_paging(&mut self, mode: PagingMode) {
        use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

        if mode == PagingMode::Long4 {
            // SAFETY: long mode requires PAE, which the bootloader already set.
            unsafe { Cr4::update(|flags| flags.insert(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION)) };
        }
        // SAFETY: CR3 holds a complete identity map of the kernel.
        unsafe { Cr0::update(|flags| flags.insert(Cr0Flags::PAGING)) };
    }

    fn invalidate(&mut self, virt: VirtAddr) {
        x86_64::instructions::tlb::flush(virt);
    }

    fn live(&self) -> bool {
        true
    }
}

/// What [`SimulatedPaging`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuEvent {
    LoadRoot(PhysAddr),
    Enable(PagingMode),
    Invalidate(VirtAddr),
}

/// Paging hardware stand-in for hosted runs. Records every request.
#[derive(Debug, Default)]
pub struct SimulatedPaging {
    pub events: Vec<MmuEvent>,
    pub root: Option<PhysAddr>,
    pub enabled: bool,
    /// Root reported as active before the first `load_root`.
    pub boot_root: Option<PhysAddr>,
}

impl SimulatedPaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.events.iter().filter_map(|event| match event {
            MmuEvent::Invalidate(virt) => Some(*virt),
            _ => None,
        })
    }
}

impl PagingHardware for SimulatedPaging {
    fn load_root(&mut self, root: PhysAddr) {
        self.root = Some(root);
        self.events.push(MmuEvent::LoadRoot(root));
    }

    fn active_root(&self) -> Option<PhysAddr> {
        self.root.or(self.boot_root)
    }

    fn enable_paging(&mut self, mode: PagingMode) {
        self.enabled = true;
        self.events.push(MmuEvent::Enable(mode));
    }

    fn invalidate(&mut self, virt: VirtAddr) {
        self.events.push(MmuEvent::Invalidate(virt));
    }
}
