#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod filesys;
pub mod init;
pub mod logging;
pub mod memory;
pub mod system;

#[cfg(target_os = "none")]
use memory::{heap::KernelAllocator, mmu::X86Paging, phys::DirectMap};

/// Kernel heap. Fails every allocation until [`init::Kernel::boot`] installs
/// the memory manager.
#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: KernelAllocator<DirectMap, X86Paging> = KernelAllocator::new();

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

/// Parks the CPU for good: interrupts off, then `hlt` forever.
pub fn halt_loop() -> ! {
    #[cfg(target_arch = "x86_64")]
    x86_64::instructions::interrupts::disable();
    loop {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::hlt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}
