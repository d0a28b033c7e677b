//! Host-test support
//!
//! On the host the allocators' "physical memory" is leaked heap buffers:
//! address translation is the identity there, so carving the global bump
//! allocator out of a leaked region gives every test real storage behind
//! the same code paths the kernel runs. The bump cursor only moves forward,
//! which makes the shared globals safe under the parallel test harness;
//! tests that assert on shared *mutable* state (the global frame allocator)
//! serialize through [`global_lock`].

use spin::{Mutex, MutexGuard, Once};

use crate::boot::multiboot::{BootInfo, MmapEntry, FLAG_MMAP};
use crate::mm::{ealloc, frame, paging::PageDirectory, pool, PhysicalAddress, PAGE_SIZE};

const EARLY_REGION: usize = 64 * 1024 * 1024;
const FAKE_MEMORY: usize = 64 * 1024 * 1024;

static GLOBALS: Once<()> = Once::new();
static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

/// Leak a page-aligned buffer and return its base address.
pub fn leak_region(size: usize) -> usize {
    let buf = vec![0u8; size + PAGE_SIZE];
    let addr = Box::leak(buf.into_boxed_slice()).as_mut_ptr() as usize;
    crate::mm::align_up(addr, PAGE_SIZE)
}

/// Leak a zeroed page directory.
pub fn leak_directory() -> &'static mut PageDirectory {
    let dir = Box::new(PageDirectory {
        tables: [core::ptr::null_mut(); crate::mm::PAGE_ENTRIES],
        tables_physical: [0; crate::mm::PAGE_ENTRIES],
        physical_addr: 0,
    });
    Box::leak(dir)
}

/// Build a leaked Multiboot info record with the given
/// `(addr, len, entry_type)` memory-map entries.
pub fn fake_boot_info(regions: &[(u64, u64, u32)]) -> &'static BootInfo {
    let entries: Vec<MmapEntry> = regions
        .iter()
        .map(|&(addr, len, entry_type)| MmapEntry {
            size: (core::mem::size_of::<MmapEntry>() - 4) as u32,
            addr,
            len,
            entry_type,
        })
        .collect();
    let entries = Box::leak(entries.into_boxed_slice());

    let info = Box::new(BootInfo {
        flags: FLAG_MMAP,
        mem_lower: 0,
        mem_upper: 0,
        boot_device: 0,
        cmdline: 0,
        mods_count: 0,
        mods_addr: 0,
        syms: [0; 4],
        mmap_length: core::mem::size_of_val(entries) as u32,
        mmap_addr: entries.as_ptr() as usize,
    });
    Box::leak(info)
}

/// A boot record whose memory-map flag is clear.
pub fn fake_boot_info_without_mmap() -> &'static BootInfo {
    let info = Box::new(BootInfo {
        flags: 0,
        mem_lower: 0,
        mem_upper: 0,
        boot_device: 0,
        cmdline: 0,
        mods_count: 0,
        mods_addr: 0,
        syms: [0; 4],
        mmap_length: 0,
        mmap_addr: 0,
    });
    Box::leak(info)
}

/// One-time setup of the global allocator chain: the bump allocator over a
/// leaked region, the frame allocator over a synthetic machine, and the
/// page-table pool.
pub fn init_globals() {
    GLOBALS.call_once(|| {
        let base = leak_region(EARLY_REGION);
        ealloc::set_placement_addr(PhysicalAddress(base));

        let info = fake_boot_info(&[(0, FAKE_MEMORY as u64, 1)]);
        frame::init(
            FAKE_MEMORY,
            info,
            PhysicalAddress(0x10_0000),
            PhysicalAddress(0x40_0000),
        )
        .expect("frame allocator setup failed");

        pool::init().expect("pool setup failed");
    });
}

/// Serialize tests that assert on the globally shared frame allocator.
pub fn global_lock() -> MutexGuard<'static, ()> {
    GLOBAL_LOCK.lock()
}
