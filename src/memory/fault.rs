//! Page fault reporting.
//!
//! Faults are fatal: the decoded error code and faulting address are logged
//! and the CPU is parked.

use core::fmt;

use log::error;
use x86_64::structures::idt::PageFaultErrorCode;

/// A decoded page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultInfo {
    pub address: u64,
    pub error_code: PageFaultErrorCode,
}

impl PageFaultInfo {
    /// Decodes the raw error code the CPU pushed. Unknown bits are dropped.
    pub fn decode(address: u64, code: u64) -> Self {
        Self {
            address,
            error_code: PageFaultErrorCode::from_bits_truncate(code),
        }
    }

    /// Protection violation rather than a non-present page.
    pub fn present(&self) -> bool {
        self.error_code
            .contains(PageFaultErrorCode::PROTECTION_VIOLATION)
    }

    pub fn write(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    pub fn user(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::USER_MODE)
    }

    /// A reserved bit was set in a paging structure.
    pub fn reserved(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::MALFORMED_TABLE)
    }

    pub fn instruction_fetch(&self) -> bool {
        self.error_code
            .contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    }
}

impl fmt::Display for PageFaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PAGE FAULT at {:#x}", self.address)?;
        writeln!(
            f,
            "  cause: {}",
            if self.present() {
                "protection violation"
            } else {
                "page not present"
            }
        )?;
        writeln!(f, "  access: {}", if self.write() { "write" } else { "read" })?;
        write!(
            f,
            "  mode: {}",
            if self.user() { "user" } else { "kernel" }
        )?;
        if self.reserved() {
            write!(f, "\n  reserved bit set in page table")?;
        }
        if self.instruction_fetch() {
            write!(f, "\n  instruction fetch")?;
        }
        Ok(())
    }
}

/// Logs the fault and halts. There is no recovery path.
pub fn page_fault(address: u64, code: u64) -> ! {
    error!("{}", PageFaultInfo::decode(address, code));
    crate::halt_loop()
}

/// Entry point for the page-fault vector: reads the faulting address from CR2.
#[cfg(target_arch = "x86_64")]
pub fn handle_page_fault(error_code: PageFaultErrorCode) -> ! {
    let address = x86_64::registers::control::Cr2::read_raw();
    page_fault(address, error_code.bits())
}
