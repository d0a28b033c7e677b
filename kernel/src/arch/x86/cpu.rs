//! Control-register access and TLB maintenance

use core::arch::asm;

/// CR0 bit 0: protection enable.
const CR0_PE: usize = 1;
/// CR0 bit 31: paging enable.
const CR0_PG: usize = 1 << 31;

fn read_cr0() -> usize {
    let cr0: usize;
    // SAFETY: reading CR0 has no side effects.
    unsafe {
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
    }
    cr0
}

/// Whether the CPU runs in protected mode (CR0.PE).
pub fn is_protected_mode() -> bool {
    read_cr0() & CR0_PE != 0
}

/// Whether paging is enabled (CR0.PG). The boot loader must have turned it
/// on before the memory layer initializes.
pub fn is_paging_enabled() -> bool {
    read_cr0() & CR0_PG != 0
}

/// Faulting linear address of the last page fault.
pub fn read_cr2() -> usize {
    let cr2: usize;
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

/// Physical address of the active page directory.
pub fn read_cr3() -> usize {
    let cr3: usize;
    // SAFETY: reading CR3 has no side effects.
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

/// Load a page directory.
///
/// # Safety
/// `phys` must be the physical address of a directory whose mappings keep
/// the currently executing code and stack reachable.
pub unsafe fn write_cr3(phys: usize) {
    // SAFETY: contract forwarded to the caller.
    unsafe {
        asm!("mov cr3, {}", in(reg) phys, options(nostack, preserves_flags));
    }
}

/// Flush the whole TLB by reloading CR3.
pub fn flush_tlb() {
    // SAFETY: rewriting the current CR3 value only invalidates the TLB.
    unsafe {
        asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidate the TLB entry for one virtual address.
pub fn flush_tlb_entry(addr: usize) {
    // SAFETY: invlpg only drops a translation cache entry.
    unsafe {
        asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Stop the CPU. Interrupts are left disabled so the halt is final.
pub fn halt() -> ! {
    loop {
        // SAFETY: cli+hlt is the canonical fatal stop.
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
