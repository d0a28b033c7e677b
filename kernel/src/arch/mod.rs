//! Architecture support
//!
//! Everything that touches control registers, the interrupt flag, port I/O
//! or the stack pointer lives here. On hosted builds (unit tests) the same
//! interface is served by inert stand-ins so the memory and task layers can
//! be exercised without hardware.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{context, cpu, port};

pub mod interrupts;

// Hosted stand-ins. Addresses translate as the identity and "hardware"
// state reports protected mode with paging on, which is what the memory
// layer asserts at init.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub mod cpu {
    pub fn is_protected_mode() -> bool {
        true
    }

    pub fn is_paging_enabled() -> bool {
        true
    }

    pub fn read_cr2() -> usize {
        0
    }

    pub fn read_cr3() -> usize {
        0
    }

    /// # Safety
    /// No-op off target; callers uphold the on-target contract.
    pub unsafe fn write_cr3(_phys: usize) {}

    pub fn flush_tlb() {}

    pub fn flush_tlb_entry(_addr: usize) {}

    pub fn halt() -> ! {
        panic!("halt");
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub mod context {
    /// Fork-point capture; meaningless off target.
    pub fn read_eip() -> usize {
        0
    }

    pub fn stack_pointers() -> (usize, usize) {
        (0, 0)
    }

    /// # Safety
    /// No-op off target; callers uphold the on-target contract.
    pub unsafe fn switch_stack(_esp: usize, _ebp: usize) {}

    /// # Safety
    /// No-op off target; callers uphold the on-target contract.
    pub unsafe fn reload_address_space() {}
}

/// Halt the CPU (spin forever on hosted builds is not useful; panic there).
pub fn halt() -> ! {
    cpu::halt()
}
