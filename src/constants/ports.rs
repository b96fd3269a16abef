//! I/O ports.

/// COM1, the kernel log and `serial_print!` target.
pub const SERIAL_PORT: u16 = 0x3F8;
