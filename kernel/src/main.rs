//! Kernel entry point
//!
//! The boot trampoline has already installed the GDT/IDT, remapped the
//! PIC, programmed the PIT, enabled paging with a provisional higher-half
//! mapping and dropped us here with the Multiboot magic and info pointer.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use helium_kernel::{
    arch, boot::multiboot, logger, mm, println, sched,
    task::{lifecycle, signal},
};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt();
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info: *const multiboot::BootInfo) -> ! {
    let (esp, _) = arch::context::stack_pointers();
    lifecycle::record_boot_stack(esp);

    logger::init(log::LevelFilter::Info);
    println!("Helium v{}", env!("CARGO_PKG_VERSION"));

    if magic != multiboot::BOOTLOADER_MAGIC {
        panic!("invalid multiboot magic {:#x}", magic);
    }
    // SAFETY: the loader hands over a static info record; it is never
    // written again.
    let info = unsafe { &*info };
    multiboot::set_boot_info(info);

    if let Err(e) = mm::init(info) {
        panic!("memory init failed: {}", e);
    }

    match lifecycle::init_tasking() {
        Ok(pid) => println!("[KERNEL] tasking up, kernel task {}", pid),
        Err(e) => panic!("tasking init failed: {}", e),
    }
    signal::init_signals();
    sched::init();

    println!("[KERNEL] initialized");

    idle();
}

/// Idle with interrupts on; every tick wakes us to dispatch.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn idle() -> ! {
    loop {
        // SAFETY: sti;hlt is the canonical idle; the next interrupt resumes.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack));
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
