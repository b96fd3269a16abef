//! Compile-time constants: memory layout and I/O ports.

pub mod memory;
pub mod ports;
