#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use log::{error, info};
    use osax::{
        filesys::{block::MemoryBlockDevice, exfat::constants::SECTOR_SIZE},
        halt_loop,
        init::{self, BootError, BootInfo, KernelConfig},
        logging,
        memory::{bitmap_frame_allocator::BitmapFrameAllocator, mmu::X86Paging, phys::DirectMap},
        serial_println,
        system::System,
        ALLOCATOR,
    };

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        let config = KernelConfig::default();
        // A second logger cannot be installed here; nothing to do about it.
        let _ = logging::init(config.log_level);
        serial_println!("Booting BSP...");

        // Kept alive for as long as the CPU runs.
        let _system = match boot(&config) {
            Ok(system) => Some(system),
            Err(err) => {
                error!("system: boot failed: {}", err);
                None
            }
        };
        info!("system: entering idle loop");
        halt_loop()
    }

    fn boot(config: &KernelConfig) -> Result<System<MemoryBlockDevice>, BootError> {
        let boot_info = BootInfo::from_limine()?;
        // SAFETY: limine has answered the kernel address request by now.
        let kernel_end = unsafe { init::kernel_end() }.ok_or(BootError::NoMemoryMap)?;

        // The frame bitmap takes the first usable pages after the kernel
        // image, reached through the higher-half direct map.
        let words = BitmapFrameAllocator::bitmap_words(boot_info.memory_size);
        let bitmap_base = boot_info
            .bitmap_site(kernel_end, (words * 8) as u64)
            .ok_or(BootError::NoMemoryMap)?;
        // SAFETY: the bitmap pages are usable RAM that nothing else
        // references; the frame allocator reserves them.
        let bitmap = unsafe {
            core::slice::from_raw_parts_mut(
                (boot_info.hhdm_offset + bitmap_base.as_u64()) as *mut u64,
                words,
            )
        };
        // SAFETY: limine maps all physical memory at the HHDM offset.
        let memory = unsafe { DirectMap::new(boot_info.hhdm_offset, boot_info.memory_size) };

        let manager =
            init::init_memory(config, &boot_info, memory, X86Paging, bitmap, bitmap_base)?;
        ALLOCATOR.install(manager);

        let disk = MemoryBlockDevice::new(config.volume_sectors, SECTOR_SIZE);
        let system = System::boot(disk, &config.system)?;
        info!(
            "system: boot #{} ready, {} objects",
            system.state().boot_count,
            system.metafs().object_count()
        );
        Ok(system)
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("Kernel panic: {}", info);
        halt_loop()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
