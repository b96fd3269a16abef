//! Block devices backing a volume.

mod memory;

pub use memory::MemoryBlockDevice;
