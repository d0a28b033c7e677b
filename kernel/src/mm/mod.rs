//! Memory management
//!
//! Address types, the layout constants every subsystem agrees on, and the
//! boot-time initialization sequence. The order of `init` is load-bearing:
//! each step consumes state the previous one produced, starting from the
//! bump allocator that exists before anything else can.

pub mod directory;
pub mod ealloc;
pub mod frame;
pub mod heap;
pub mod page_fault;
pub mod paging;
pub mod pool;

use crate::{
    arch::cpu,
    boot::{self, multiboot::BootInfo},
    error::KernelResult,
};

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Entries per page table and per page directory.
pub const PAGE_ENTRIES: usize = 1024;

/// Virtual base of the higher-half kernel mapping.
pub const KERNEL_VIRTUAL_BASE: usize = 0xC000_0000;

/// Directory slot covering the kernel base (768).
pub const KERNEL_PAGE_DIR_INDEX: usize = KERNEL_VIRTUAL_BASE / (PAGE_SIZE * PAGE_ENTRIES);

/// Heap placement relative to the kernel base.
pub const HEAP_START_OFFSET: usize = 0x40_0000;

/// First virtual address of the kernel heap.
pub const HEAP_START: usize = KERNEL_VIRTUAL_BASE + HEAP_START_OFFSET;

/// Initial heap extent (1 MiB).
pub const HEAP_INITIAL_SIZE: usize = 0x10_0000;

/// Hard ceiling on heap growth.
pub const HEAP_MAX_SIZE: usize = 0x4000_0000 - HEAP_START_OFFSET;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Number of the frame containing this address.
    pub const fn frame(&self) -> usize {
        self.0 / PAGE_SIZE
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Directory slot covering this address (top ten translated bits).
    pub const fn table_index(&self) -> usize {
        (self.0 >> 22) & (PAGE_ENTRIES - 1)
    }

    /// Entry within the owning page table (middle ten translated bits).
    pub const fn page_index(&self) -> usize {
        (self.0 >> 12) & (PAGE_ENTRIES - 1)
    }
}

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub const fn new(num: usize) -> Self {
        Self(num)
    }

    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress(self.0 * PAGE_SIZE)
    }
}

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Translate a physical address into the higher-half window.
#[cfg(target_os = "none")]
pub const fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress(phys.0 + KERNEL_VIRTUAL_BASE)
}

/// Translate a kernel virtual address back to physical. Addresses below the
/// kernel base are identity-mapped.
#[cfg(target_os = "none")]
pub const fn virt_to_phys(virt: VirtualAddress) -> PhysicalAddress {
    if virt.0 < KERNEL_VIRTUAL_BASE {
        PhysicalAddress(virt.0)
    } else {
        PhysicalAddress(virt.0 - KERNEL_VIRTUAL_BASE)
    }
}

// Hosted builds treat test buffers as their own physical memory.
#[cfg(not(target_os = "none"))]
pub const fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress(phys.0)
}

#[cfg(not(target_os = "none"))]
pub const fn virt_to_phys(virt: VirtualAddress) -> PhysicalAddress {
    PhysicalAddress(virt.0)
}

/// Bring up the whole memory layer. Each step consumes state the previous
/// one produced; reordering them is undefined behavior.
pub fn init(info: &'static BootInfo) -> KernelResult<()> {
    if !cpu::is_protected_mode() {
        panic!("mm::init: not in protected mode");
    }
    if !cpu::is_paging_enabled() {
        panic!("mm::init: paging is off, the boot loader must enable it");
    }

    page_fault::init();

    ealloc::set_placement_addr(virt_to_phys(boot::kernel_end()));

    let mem_size = info.available_memory();
    println!("[MM] {} MiB available", mem_size / 1024 / 1024);

    frame::init(
        mem_size,
        info,
        virt_to_phys(boot::kernel_start()),
        virt_to_phys(boot::kernel_end()),
    )?;

    let dir = directory::create_kernel_directory()?;
    pool::init()?;

    // SAFETY: the directory was just allocated and is not yet shared.
    let dir_ref = unsafe { dir.get() };
    directory::setup_higher_half(dir_ref)?;

    // Pre-map the heap's initial extent so the heap can place blocks there
    // before its own growth path exists.
    let mut va = HEAP_START;
    while va < HEAP_START + HEAP_INITIAL_SIZE {
        let pte = dir_ref
            .create_page(VirtualAddress(va), true)
            .map_err(crate::error::KernelError::Pool)?;
        frame::allocate_frame(pte, true, frame::PageFlags::PRESENT | frame::PageFlags::RW);
        va += PAGE_SIZE;
    }
    validate_mappings(dir_ref, VirtualAddress(HEAP_START), VirtualAddress(HEAP_START + HEAP_INITIAL_SIZE));

    // Identity-map everything the bump allocator has handed out so far; the
    // pre-paging code and data stay reachable after the switch.
    let placement = ealloc::placement_addr().0;
    let mut pa = 0usize;
    while pa < placement {
        let pte = dir_ref
            .create_page(VirtualAddress(pa), true)
            .map_err(crate::error::KernelError::Pool)?;
        if pte.frame() == 0 {
            let f = pa / PAGE_SIZE;
            frame::mark_kernel(f, f + 1);
            pte.set_frame(f as u32);
            pte.set_present(true);
            pte.set_rw(true);
        }
        pa += PAGE_SIZE;
    }

    directory::switch_page_directory(dir);

    heap::init(dir);

    println!(
        "[MM] frames: {} used / {} total, heap at {:#x}",
        frame::used_frames(),
        frame::frame_count(),
        HEAP_START
    );
    Ok(())
}

/// Panic unless every page in `[start, end)` is present and writable in
/// `dir` and translates linearly.
pub fn validate_mappings(dir: &paging::PageDirectory, start: VirtualAddress, end: VirtualAddress) {
    let mut va = start.0;
    while va < end.0 {
        match dir.get_page(VirtualAddress(va)) {
            Some(pte) if pte.present() && pte.rw() => {}
            _ => panic!("invalid mapping at {:#x}", va),
        }
        if va >= KERNEL_VIRTUAL_BASE {
            let phys = virt_to_phys(VirtualAddress(va));
            if phys_to_virt(phys).0 != va {
                panic!("non-linear kernel mapping at {:#x}", va);
            }
        }
        va += PAGE_SIZE;
    }
}
