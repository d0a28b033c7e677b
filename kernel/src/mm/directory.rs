//! Page-directory lifecycle
//!
//! The kernel directory and whichever directory is loaded in CR3 are
//! process-wide singletons. Directory cloning is a deep copy: every
//! populated entry in the source gets its own table and its own frame in
//! the clone; nothing is shared and nothing is copy-on-write.

use core::ptr::NonNull;

use spin::Mutex;

use super::{
    frame::{self, PageFlags},
    heap,
    paging::{PageDirectory, PageTable},
    pool, virt_to_phys, VirtualAddress, KERNEL_PAGE_DIR_INDEX, PAGE_ENTRIES,
};
use crate::arch::cpu;
use crate::error::{KernelError, KernelResult};

/// Shared handle to a directory. Directories live in heap or bump storage
/// and are never moved, so the pointer stays valid for the kernel's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryRef(NonNull<PageDirectory>);

// SAFETY: every mutation of a referenced directory happens inside an
// interrupt-disabled critical section or before tasking starts.
unsafe impl Send for DirectoryRef {}

impl DirectoryRef {
    pub fn new(ptr: NonNull<PageDirectory>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> *mut PageDirectory {
        self.0.as_ptr()
    }

    /// Borrow the directory.
    ///
    /// # Safety
    /// The caller must not hold another live borrow obtained from the same
    /// handle.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &'static mut PageDirectory {
        // SAFETY: contract forwarded to the caller.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn physical_addr(&self) -> usize {
        // SAFETY: read-only access to a live directory field.
        unsafe { (*self.0.as_ptr()).physical_addr }
    }
}

static KERNEL_DIRECTORY: Mutex<Option<DirectoryRef>> = Mutex::new(None);
static CURRENT_DIRECTORY: Mutex<Option<DirectoryRef>> = Mutex::new(None);

pub fn kernel_directory() -> Option<DirectoryRef> {
    *KERNEL_DIRECTORY.lock()
}

pub fn current_directory() -> Option<DirectoryRef> {
    *CURRENT_DIRECTORY.lock()
}

pub fn set_current_directory(dir: DirectoryRef) {
    *CURRENT_DIRECTORY.lock() = Some(dir);
}

/// Allocate and register the kernel's own directory (step 4 of the memory
/// init order; pre-heap, so the storage comes from the bump allocator).
pub fn create_kernel_directory() -> KernelResult<DirectoryRef> {
    let (va, phys) = heap::kmalloc_ap(core::mem::size_of::<PageDirectory>())?;
    // SAFETY: freshly allocated storage sized for a PageDirectory; the
    // all-zero pattern is its valid empty state.
    unsafe {
        core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, core::mem::size_of::<PageDirectory>());
        (*va.as_mut_ptr::<PageDirectory>()).physical_addr = phys.0;
    }

    let dir = DirectoryRef::new(NonNull::new(va.as_mut_ptr()).expect("null directory"));
    *KERNEL_DIRECTORY.lock() = Some(dir);
    log::info!("directory: kernel directory at {:#x} (cr3 {:#x})", va.0, phys.0);
    Ok(dir)
}

/// Load `dir` into CR3 and flush the TLB.
pub fn switch_page_directory(dir: DirectoryRef) {
    set_current_directory(dir);
    // SAFETY: the directory carries its own CR3 value and maps the kernel
    // linearly at the higher half.
    unsafe {
        cpu::write_cr3(dir.physical_addr());
    }
    cpu::flush_tlb();
}

/// Install the higher-half window: directory slot 768 maps
/// `0xC0000000..0xC0400000` linearly onto the first 4 MiB of physical
/// memory. The window frames are claimed as kernel-owned.
pub fn setup_higher_half(dir: &mut PageDirectory) -> KernelResult<()> {
    let table = pool::alloc().map_err(KernelError::Pool)?;

    frame::mark_kernel(0, PAGE_ENTRIES);
    for j in 0..PAGE_ENTRIES {
        // SAFETY: the pool handed out a zeroed, exclusively owned table.
        let pte = unsafe { &mut (*table.as_ptr()).entries[j] };
        pte.set_frame(j as u32);
        pte.set_present(true);
        pte.set_rw(true);
    }

    let table_phys = virt_to_phys(VirtualAddress(table.as_ptr() as usize)).0;
    dir.tables[KERNEL_PAGE_DIR_INDEX] = table.as_ptr();
    dir.tables_physical[KERNEL_PAGE_DIR_INDEX] =
        table_phys | (PageFlags::PRESENT | PageFlags::RW).bits() as usize;

    log::info!("directory: higher-half table at {:#x}", table.as_ptr() as usize);
    Ok(())
}

/// Deep-copy `src`. Every populated slot gets a fresh table, every mapped
/// entry keeps its flags but is backed by a freshly claimed frame. On
/// failure every partial mapping is torn back down.
pub fn clone_directory(src: &PageDirectory) -> KernelResult<DirectoryRef> {
    let (dir_va, dir_phys) = heap::kmalloc_ap(core::mem::size_of::<PageDirectory>())?;
    // SAFETY: freshly allocated storage; all-zero is the valid empty state.
    unsafe {
        core::ptr::write_bytes(
            dir_va.as_mut_ptr::<u8>(),
            0,
            core::mem::size_of::<PageDirectory>(),
        );
        (*dir_va.as_mut_ptr::<PageDirectory>()).physical_addr = dir_phys.0;
    }
    let new_dir = DirectoryRef::new(NonNull::new(dir_va.as_mut_ptr()).expect("null directory"));

    for i in 0..PAGE_ENTRIES {
        if src.tables[i].is_null() {
            continue;
        }

        let (table_va, table_phys) = match heap::kmalloc_ap(core::mem::size_of::<PageTable>()) {
            Ok(pair) => pair,
            Err(e) => {
                destroy_directory(new_dir);
                return Err(e);
            }
        };
        let table = table_va.as_mut_ptr::<PageTable>();
        // SAFETY: freshly allocated table storage; zero is its empty state.
        unsafe {
            core::ptr::write_bytes(table_va.as_mut_ptr::<u8>(), 0, core::mem::size_of::<PageTable>());
        }

        // SAFETY: source tables are live for the duration of the clone.
        let src_table = unsafe { &*src.tables[i] };
        for j in 0..PAGE_ENTRIES {
            let entry = src_table.entries[j];
            if entry.frame() == 0 {
                continue;
            }
            // SAFETY: `table` is exclusively owned until it is published in
            // the new directory below.
            let copy = unsafe { &mut (*table).entries[j] };
            frame::allocate_frame(copy, true, entry.flags());
        }

        // SAFETY: the new directory is exclusively owned until returned.
        unsafe {
            (*new_dir.as_ptr()).tables[i] = table;
            (*new_dir.as_ptr()).tables_physical[i] =
                table_phys.0 | (PageFlags::PRESENT | PageFlags::RW).bits() as usize;
        }
    }

    Ok(new_dir)
}

/// Free every frame a directory owns and return its storage. The directory
/// must not be the one loaded in CR3.
pub fn destroy_directory(dir: DirectoryRef) {
    debug_assert!(
        current_directory() != Some(dir),
        "destroying the live page directory"
    );

    // SAFETY: the caller is giving the directory up; no other borrow exists.
    let d = unsafe { dir.get() };
    for i in 0..PAGE_ENTRIES {
        let table = d.tables[i];
        if table.is_null() {
            continue;
        }
        for j in 0..PAGE_ENTRIES {
            // SAFETY: non-null table pointers reference live tables.
            frame::free_frame(unsafe { &mut (*table).entries[j] });
        }
        heap::kfree(VirtualAddress(table as usize));
        d.tables[i] = core::ptr::null_mut();
        d.tables_physical[i] = 0;
    }
    heap::kfree(VirtualAddress(dir.as_ptr() as usize));
}
