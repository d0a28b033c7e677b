//! Page-fault handling
//!
//! Registered on vector 14. There is no demand paging beyond the heap's own
//! growth path, so every fault that reaches the handler is a kernel bug or
//! corruption: the handler reports the faulting address, the owning task
//! and the error-code classification, then halts.

use bitflags::bitflags;

use crate::arch::{
    cpu,
    interrupts::{self, InterruptFrame, PAGE_FAULT_VECTOR},
};

bitflags! {
    /// Error code pushed by the CPU on a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// Set: protection violation; clear: page not present.
        const PRESENT = 1 << 0;
        /// Set: the access was a write.
        const WRITE = 1 << 1;
        /// Set: the access came from user mode.
        const USER = 1 << 2;
        /// Set: a reserved bit was set in a paging structure.
        const RESERVED = 1 << 3;
        /// Set: the fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Everything worth printing about a fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// Faulting virtual address (CR2).
    pub address: usize,
    /// CPU error code.
    pub code: PageFaultErrorCode,
    /// Task that was running, if tasking is up.
    pub pid: Option<u32>,
}

impl PageFaultInfo {
    /// Human-readable classification of the error code.
    pub fn classification(&self) -> (&'static str, &'static str, &'static str) {
        let cause = if self.code.contains(PageFaultErrorCode::PRESENT) {
            "protection violation"
        } else {
            "page not present"
        };
        let access = if self.code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            "instruction fetch"
        } else if self.code.contains(PageFaultErrorCode::WRITE) {
            "write"
        } else {
            "read"
        };
        let mode = if self.code.contains(PageFaultErrorCode::USER) {
            "user"
        } else {
            "kernel"
        };
        (cause, access, mode)
    }
}

/// Install the handler on vector 14 (step 2 of the memory init order).
pub fn init() {
    interrupts::register_interrupt_handler(PAGE_FAULT_VECTOR, page_fault_handler);
}

fn page_fault_handler(frame: &mut InterruptFrame) {
    let info = PageFaultInfo {
        address: cpu::read_cr2(),
        code: PageFaultErrorCode::from_bits_truncate(frame.err_code),
        pid: crate::task::current_pid().map(|pid| pid.0),
    };

    let (cause, access, mode) = info.classification();
    println!(
        "page fault at {:#010x} (eip {:#010x}): {} on {} {} (pid {})",
        info.address,
        frame.eip,
        cause,
        access,
        mode,
        info.pid.unwrap_or(0),
    );
    if info.code.contains(PageFaultErrorCode::RESERVED) {
        println!("  reserved bit set in a paging structure");
    }
    panic!("unrecoverable page fault");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn not_present_read_classifies() {
        let info = PageFaultInfo {
            address: 0xDEAD_0000,
            code: PageFaultErrorCode::empty(),
            pid: None,
        };
        assert_eq!(
            info.classification(),
            ("page not present", "read", "kernel")
        );
    }

    #[test]
    fn user_write_protection_violation_classifies() {
        let info = PageFaultInfo {
            address: 0x1000,
            code: PageFaultErrorCode::PRESENT
                | PageFaultErrorCode::WRITE
                | PageFaultErrorCode::USER,
            pid: Some(3),
        };
        assert_eq!(
            info.classification(),
            ("protection violation", "write", "user")
        );
    }

    #[test]
    fn instruction_fetch_wins_over_write() {
        let info = PageFaultInfo {
            address: 0x1000,
            code: PageFaultErrorCode::WRITE | PageFaultErrorCode::INSTRUCTION_FETCH,
            pid: None,
        };
        assert_eq!(info.classification().1, "instruction fetch");
    }
}
