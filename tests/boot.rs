use log::LevelFilter;
use osax::filesys::block::MemoryBlockDevice;
use osax::filesys::exfat::constants::SECTOR_SIZE;
use osax::filesys::metafs::ObjectType;
use osax::filesys::FileSystem;
use osax::init::{BootInfo, FramebufferInfo, Kernel, KernelConfig};
use osax::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use osax::memory::mmu::SimulatedPaging;
use osax::memory::paging::PagingMode;
use osax::memory::phys::RamArena;
use osax::system::{BootKind, LOG_HEADER, LOG_PATH};
use x86_64::PhysAddr;

const MEMORY: u64 = 64 * 1024 * 1024;

type TestKernel = Kernel<RamArena, SimulatedPaging, MemoryBlockDevice>;

fn config() -> KernelConfig {
    let mut config = KernelConfig {
        paging_mode: PagingMode::Long4,
        heap_size: 1024 * 1024,
        ..KernelConfig::default()
    };
    config.system.log_level = LevelFilter::Info;
    config
}

fn boot_info() -> BootInfo {
    BootInfo {
        framebuffer: Some(FramebufferInfo {
            address: 0x0200_0000,
            width: 640,
            height: 480,
            pitch: 2560,
        }),
        ..BootInfo::with_memory(MEMORY)
    }
}

fn boot(disk: MemoryBlockDevice) -> TestKernel {
    let words = BitmapFrameAllocator::bitmap_words(MEMORY);
    let bitmap = Box::leak(vec![0u64; words].into_boxed_slice());
    Kernel::boot(
        &config(),
        &boot_info(),
        RamArena::new(MEMORY as usize),
        SimulatedPaging::new(),
        bitmap,
        PhysAddr::new(0x100000),
        disk,
    )
    .unwrap()
}

#[test]
fn boot_then_reboot() {
    let disk = MemoryBlockDevice::new(config().volume_sectors, SECTOR_SIZE);
    let mut kernel = boot(disk);
    assert_eq!(kernel.system.boot_kind(), BootKind::First);
    assert_eq!(kernel.system.state().boot_count, 1);
    assert!(kernel.system.metafs().view_exists("/kernel"));
    assert!(kernel.memory.translate(x86_64::VirtAddr::new(0x0200_0000)).is_some());

    let id = {
        let metafs = kernel.system.metafs_mut();
        let id = metafs.object_create(ObjectType::Document).unwrap();
        metafs.set_name(id, "notes").unwrap();
        metafs.object_write_data(id, b"kept across reboots").unwrap();
        id
    };
    kernel.shutdown().unwrap();

    let mut kernel = boot(kernel.system.into_device());
    assert_eq!(kernel.system.boot_kind(), BootKind::Normal);
    assert_eq!(kernel.system.state().boot_count, 2);
    assert!(!kernel.system.state().clean_shutdown);

    let metafs = kernel.system.metafs_mut();
    assert_eq!(metafs.resolve_by_name("notes"), Some(id));
    let mut buf = [0u8; 19];
    assert_eq!(metafs.object_read_data(id, &mut buf).unwrap(), 19);
    assert_eq!(&buf, b"kept across reboots");

    let log = metafs.volume_mut().read_to_vec(LOG_PATH).unwrap();
    let log = String::from_utf8(log).unwrap();
    assert_eq!(log.matches(LOG_HEADER).count(), 2);
    assert!(log.contains("Boot #2 successful"));
    assert!(!log.contains("Dirty shutdown detected"));
}

#[test]
fn reboot_without_shutdown_is_dirty() {
    let disk = MemoryBlockDevice::new(config().volume_sectors, SECTOR_SIZE);
    let kernel = boot(disk);
    let mut kernel = boot(kernel.system.into_device());
    assert_eq!(kernel.system.boot_kind(), BootKind::Normal);

    let log = kernel.system.metafs_mut().volume_mut().read_to_vec(LOG_PATH).unwrap();
    assert!(String::from_utf8(log).unwrap().contains("Dirty shutdown detected"));
}

#[test]
fn exfat_visible_under_metafs() {
    let disk = MemoryBlockDevice::new(config().volume_sectors, SECTOR_SIZE);
    let mut kernel = boot(disk);
    let volume = kernel.system.metafs_mut().volume_mut();
    let names: Vec<String> = volume
        .read_dir("/")
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    for expected in [".kernel", "data", "views"] {
        assert!(names.iter().any(|name| name == expected), "{expected} missing");
    }
}
