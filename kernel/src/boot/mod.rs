//! Boot interface
//!
//! The early trampoline, GDT/IDT install and paging enable happen before
//! this kernel gets control; what crosses the boundary is a Multiboot v1
//! info pointer and the linker-provided image bounds exposed here.

pub mod multiboot;

use crate::mm::VirtualAddress;

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
    static __kernel_text_section_start: u8;
    static __kernel_text_section_end: u8;
    static __kernel_rodata_section_start: u8;
    static __kernel_rodata_section_end: u8;
    static __kernel_data_section_start: u8;
    static __kernel_data_section_end: u8;
    static __kernel_bss_section_start: u8;
    static __kernel_bss_section_end: u8;
}

/// First virtual address of the kernel image.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn kernel_start() -> VirtualAddress {
    // SAFETY: taking the address of a linker symbol never reads it.
    VirtualAddress(unsafe { core::ptr::addr_of!(_kernel_start) } as usize)
}

/// First virtual address past the kernel image.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn kernel_end() -> VirtualAddress {
    // SAFETY: taking the address of a linker symbol never reads it.
    VirtualAddress(unsafe { core::ptr::addr_of!(_kernel_end) } as usize)
}

/// Section bounds of the kernel image, in link order.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sections() -> [(&'static str, VirtualAddress, VirtualAddress); 4] {
    // SAFETY: taking the address of a linker symbol never reads it.
    unsafe {
        [
            (
                "text",
                VirtualAddress(core::ptr::addr_of!(__kernel_text_section_start) as usize),
                VirtualAddress(core::ptr::addr_of!(__kernel_text_section_end) as usize),
            ),
            (
                "rodata",
                VirtualAddress(core::ptr::addr_of!(__kernel_rodata_section_start) as usize),
                VirtualAddress(core::ptr::addr_of!(__kernel_rodata_section_end) as usize),
            ),
            (
                "data",
                VirtualAddress(core::ptr::addr_of!(__kernel_data_section_start) as usize),
                VirtualAddress(core::ptr::addr_of!(__kernel_data_section_end) as usize),
            ),
            (
                "bss",
                VirtualAddress(core::ptr::addr_of!(__kernel_bss_section_start) as usize),
                VirtualAddress(core::ptr::addr_of!(__kernel_bss_section_end) as usize),
            ),
        ]
    }
}

// Hosted builds have no kernel image; fixed bounds keep the callers honest.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn kernel_start() -> VirtualAddress {
    VirtualAddress(0x10_0000)
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn kernel_end() -> VirtualAddress {
    VirtualAddress(0x40_0000)
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn sections() -> [(&'static str, VirtualAddress, VirtualAddress); 4] {
    [
        ("text", VirtualAddress(0x10_0000), VirtualAddress(0x20_0000)),
        ("rodata", VirtualAddress(0x20_0000), VirtualAddress(0x28_0000)),
        ("data", VirtualAddress(0x28_0000), VirtualAddress(0x30_0000)),
        ("bss", VirtualAddress(0x30_0000), VirtualAddress(0x40_0000)),
    ]
}
