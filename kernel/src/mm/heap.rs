//! Kernel heap
//!
//! A single growable region starting at [`HEAP_START`], managed as a
//! doubly-linked list of blocks embedded in the region itself. First-fit
//! allocation, split on surplus, coalesce on free. Growth maps fresh pages
//! at the tail by pulling page tables from the pool and frames from the
//! frame allocator; the two never depend back on the heap.
//!
//! Until `init` runs, the allocation entry points fall through to the bump
//! allocator so the paging setup can allocate its own structures.

use spin::Mutex;

use super::{
    align_up,
    directory::{self, DirectoryRef},
    ealloc, frame,
    frame::PageFlags,
    PhysicalAddress, VirtualAddress, HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HEAP_START, PAGE_SIZE,
};
use crate::arch::cpu;
use crate::error::{HeapError, KernelResult, MemoryError};

/// Stamped into every block header; a mismatch means the heap is gone.
pub const HEAP_BLOCK_MAGIC: u32 = 0xDEAD_BEEF;

/// Alignment unit for aligned allocations.
pub const ALIGNMENT: usize = PAGE_SIZE;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Block header, placed at the start of each block; the payload begins
/// immediately after it.
#[repr(C)]
struct BlockHeader {
    size: usize,
    is_free: bool,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
    magic: u32,
}

pub struct Heap {
    start: usize,
    size: usize,
    dir: DirectoryRef,
    first: *mut BlockHeader,
    last: *mut BlockHeader,
}

// SAFETY: the heap's raw block pointers all target its own region, which is
// only reached through the mutex around the global instance (or exclusive
// ownership in tests).
unsafe impl Send for Heap {}

impl Heap {
    /// Lay out a heap over `[start, start + initial_size)`.
    ///
    /// # Safety
    /// The whole range must be mapped writable in `dir` and reserved for
    /// this heap alone.
    pub unsafe fn create(start: usize, initial_size: usize, dir: DirectoryRef) -> Self {
        let first = start as *mut BlockHeader;
        // SAFETY: per the function contract the range is mapped and ours.
        unsafe {
            initialize_block(first, initial_size - HEADER_SIZE * 2, true);
        }
        Self {
            start,
            size: initial_size,
            dir,
            first,
            last: first,
        }
    }

    /// Current extent of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.size
    }

    /// First-fit scan of the block list.
    fn find_free_block(&self, size: usize) -> Option<*mut BlockHeader> {
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list pointers only reference headers inside the region.
            let block = unsafe { &*current };
            if block.is_free && block.size >= size {
                if block.magic != HEAP_BLOCK_MAGIC {
                    panic!("heap corruption detected during find_free_block (magic mismatch)");
                }
                return Some(current);
            }
            current = block.next;
        }
        None
    }

    /// Grow the region by whole pages and install one free block spanning
    /// the new extent. Partial page mappings are rolled back on failure.
    fn request_space(&mut self, size: usize) -> Option<*mut BlockHeader> {
        let total = HEADER_SIZE + size;
        let pages = total.div_ceil(PAGE_SIZE);

        if self.size + pages * PAGE_SIZE > HEAP_MAX_SIZE {
            return None;
        }

        // SAFETY: the heap exclusively borrows its directory while growing.
        let dir = unsafe { self.dir.get() };
        for i in 0..pages {
            let addr = VirtualAddress(self.start + self.size + i * PAGE_SIZE);
            if dir.create_page(addr, true).is_err() {
                for j in 0..i {
                    let rollback = VirtualAddress(self.start + self.size + j * PAGE_SIZE);
                    if let Some(pte) = dir.get_page(rollback) {
                        frame::free_frame(pte);
                    }
                    dir.destroy_page(rollback);
                }
                return None;
            }
            let pte = dir.get_page(addr)?;
            frame::allocate_frame(pte, true, PageFlags::PRESENT | PageFlags::RW);
            cpu::flush_tlb_entry(addr.0);
        }

        self.size += pages * PAGE_SIZE;

        let block = (self.start + self.size - pages * PAGE_SIZE) as *mut BlockHeader;
        // SAFETY: the pages backing `block` were just mapped.
        unsafe {
            initialize_block(block, pages * PAGE_SIZE - HEADER_SIZE, true);
            (*block).prev = self.last;
            if !self.last.is_null() {
                (*self.last).next = block;
            }
        }
        self.last = block;
        if self.first.is_null() {
            self.first = block;
        }
        Some(block)
    }

    /// Split `block` so its payload ends after `size` bytes, creating a free
    /// tail block. Reports whether the split happened; a remainder too small
    /// to hold a useful block leaves the block alone.
    fn split_block(&mut self, block: *mut BlockHeader, size: usize) -> bool {
        // SAFETY: `block` is a live header inside the region.
        unsafe {
            if (*block).size <= size + HEADER_SIZE + ALIGNMENT {
                return false;
            }

            let new_block = (block as usize + HEADER_SIZE + size) as *mut BlockHeader;
            initialize_block(new_block, (*block).size - size - HEADER_SIZE, true);
            (*new_block).next = (*block).next;
            (*new_block).prev = block;

            if !(*new_block).next.is_null() {
                (*(*new_block).next).prev = new_block;
            } else {
                self.last = new_block;
            }

            (*block).size = size;
            (*block).next = new_block;
        }
        true
    }

    /// Merge `block` with free neighbors, next first, then previous.
    fn coalesce(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` and its links are live headers inside the region.
        unsafe {
            let next = (*block).next;
            if !next.is_null() && (*next).is_free {
                if (*next).magic != HEAP_BLOCK_MAGIC {
                    panic!("heap corruption detected during coalesce (next block magic mismatch)");
                }
                (*block).size += HEADER_SIZE + (*next).size;
                (*block).next = (*next).next;
                if !(*block).next.is_null() {
                    (*(*block).next).prev = block;
                } else {
                    self.last = block;
                }
            }

            let prev = (*block).prev;
            if !prev.is_null() && (*prev).is_free {
                if (*prev).magic != HEAP_BLOCK_MAGIC {
                    panic!(
                        "heap corruption detected during coalesce (previous block magic mismatch)"
                    );
                }
                (*prev).size += HEADER_SIZE + (*block).size;
                (*prev).next = (*block).next;
                if !(*block).next.is_null() {
                    (*(*block).next).prev = prev;
                } else {
                    self.last = prev;
                }
            }
        }
    }

    /// Allocate `size` bytes, optionally page-aligned. `None` means the
    /// heap can neither satisfy the request nor grow for it.
    pub fn alloc(&mut self, size: usize, aligned: bool) -> Option<VirtualAddress> {
        if size == 0 {
            return None;
        }

        let aligned_size = if aligned {
            align_up(size, ALIGNMENT)
        } else {
            size
        };

        let mut block = match self.find_free_block(aligned_size) {
            Some(block) => block,
            None => self.request_space(aligned_size)?,
        };

        if aligned {
            let addr = block as usize + HEADER_SIZE;
            let aligned_addr = align_up(addr, ALIGNMENT);
            let padding = aligned_addr - addr;

            if padding > 0 {
                if padding >= HEADER_SIZE + ALIGNMENT
                    && self.split_block(block, padding - HEADER_SIZE)
                {
                    // carved a pad block in front of the aligned payload
                    // SAFETY: split_block just linked the successor.
                    block = unsafe { (*block).next };
                } else {
                    // this block cannot host the pad header; take one with
                    // enough slack for padding plus payload
                    block = match self.find_free_block(aligned_size + padding) {
                        Some(candidate) => candidate,
                        None => self.request_space(aligned_size + padding)?,
                    };
                    let addr = block as usize + HEADER_SIZE;
                    let aligned_addr = align_up(addr, ALIGNMENT);
                    let padding = aligned_addr - addr;
                    if padding > 0 {
                        if padding < HEADER_SIZE || !self.split_block(block, padding - HEADER_SIZE)
                        {
                            // the replacement cannot be padded either
                            return None;
                        }
                        // SAFETY: split_block just linked the successor.
                        block = unsafe { (*block).next };
                    }
                }
            }
        }

        // SAFETY: `block` is a live free header chosen above.
        unsafe {
            (*block).is_free = false;
            if (*block).size >= aligned_size + HEADER_SIZE + ALIGNMENT {
                self.split_block(block, aligned_size);
            }
        }

        Some(VirtualAddress(block as usize + HEADER_SIZE))
    }

    /// Return a payload pointer to the heap. Pointers outside the region
    /// are ignored; a corrupted header is fatal.
    pub fn free(&mut self, ptr: VirtualAddress) {
        if ptr.is_null() {
            return;
        }

        let Some(block_addr) = ptr.0.checked_sub(HEADER_SIZE) else {
            return;
        };
        if !self.contains(block_addr) {
            return;
        }

        let block = block_addr as *mut BlockHeader;
        // SAFETY: bounds-checked header address inside the region.
        unsafe {
            if (*block).magic != HEAP_BLOCK_MAGIC {
                panic!("heap corruption detected during free (magic mismatch)");
            }
            (*block).is_free = true;
        }
        self.coalesce(block);
    }

    /// Resize an allocation. Shrinks split in place; growth moves the
    /// payload to a fresh block.
    pub fn realloc(&mut self, ptr: VirtualAddress, size: usize) -> Option<VirtualAddress> {
        if ptr.is_null() {
            return self.alloc(size, false);
        }
        if size == 0 {
            self.free(ptr);
            return None;
        }

        let Some(block_addr) = ptr.0.checked_sub(HEADER_SIZE) else {
            return None;
        };
        if !self.contains(block_addr) {
            return None;
        }
        let block = block_addr as *mut BlockHeader;

        // SAFETY: bounds-checked header address inside the region.
        let old_size = unsafe {
            if (*block).magic != HEAP_BLOCK_MAGIC {
                panic!("heap corruption detected during realloc (magic mismatch)");
            }
            (*block).size
        };

        if old_size >= size {
            if old_size >= size + HEADER_SIZE + ALIGNMENT {
                self.split_block(block, size);
            }
            return Some(ptr);
        }

        let new_ptr = self.alloc(size, false)?;
        // SAFETY: both payloads are live and at least `old_size` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr::<u8>(),
                new_ptr.as_mut_ptr::<u8>(),
                old_size,
            );
        }
        self.free(ptr);
        Some(new_ptr)
    }

    /// Payload size of an allocation. A corrupted header is fatal.
    pub fn block_size(&self, ptr: VirtualAddress) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let block = (ptr.0 - HEADER_SIZE) as *const BlockHeader;
        // SAFETY: caller hands back a pointer this heap produced.
        unsafe {
            if (*block).magic != HEAP_BLOCK_MAGIC {
                panic!("heap corruption detected during block_size (magic mismatch)");
            }
            (*block).size
        }
    }

    /// Log the block list.
    pub fn dump_blocks(&self) {
        let mut current = self.first;
        let mut index = 0usize;
        while !current.is_null() {
            // SAFETY: list pointers only reference headers in the region.
            let block = unsafe { &*current };
            log::debug!(
                "heap: block {} at {:#x}, size {}, {}",
                index,
                current as usize,
                block.size,
                if block.is_free { "free" } else { "used" }
            );
            current = block.next;
            index += 1;
        }
    }

    #[cfg(all(test, not(target_os = "none")))]
    fn block_list(&self) -> std::vec::Vec<(usize, bool)> {
        let mut blocks = std::vec::Vec::new();
        let mut current = self.first;
        while !current.is_null() {
            // SAFETY: list pointers only reference headers in the region.
            let block = unsafe { &*current };
            blocks.push((block.size, block.is_free));
            current = block.next;
        }
        blocks
    }
}

/// # Safety
/// `block` must point at writable storage with room for a header.
unsafe fn initialize_block(block: *mut BlockHeader, size: usize, is_free: bool) {
    // SAFETY: contract forwarded to the caller.
    unsafe {
        (*block).size = size;
        (*block).is_free = is_free;
        (*block).next = core::ptr::null_mut();
        (*block).prev = core::ptr::null_mut();
        (*block).magic = HEAP_BLOCK_MAGIC;
    }
}

static KERNEL_HEAP: Mutex<Option<Heap>> = Mutex::new(None);

/// Bring up the heap over the pre-mapped initial range (step 10 of the
/// memory init order).
pub fn init(dir: DirectoryRef) {
    // SAFETY: mm::init pre-mapped `[HEAP_START, HEAP_START +
    // HEAP_INITIAL_SIZE)` in `dir` before calling here.
    let heap = unsafe { Heap::create(HEAP_START, HEAP_INITIAL_SIZE, dir) };
    *KERNEL_HEAP.lock() = Some(heap);
    log::info!(
        "heap: {} KiB at {:#x}",
        HEAP_INITIAL_SIZE / 1024,
        HEAP_START
    );
}

fn intermediate_alloc(
    size: usize,
    aligned: bool,
) -> KernelResult<(VirtualAddress, PhysicalAddress)> {
    let mut guard = KERNEL_HEAP.lock();
    match guard.as_mut() {
        Some(heap) => {
            let va = heap
                .alloc(size, aligned)
                .ok_or(HeapError::OutOfMemory { requested: size })?;
            drop(guard);

            let phys = directory::kernel_directory()
                .and_then(|dir| {
                    // SAFETY: read-only page walk of the kernel directory.
                    unsafe { dir.get() }.get_page(va).map(|pte| {
                        PhysicalAddress((pte.frame() as usize) * PAGE_SIZE + (va.0 & 0xFFF))
                    })
                })
                .unwrap_or(PhysicalAddress(0));
            Ok((va, phys))
        }
        None => {
            // pre-heap: route to the bump allocator
            let align = if aligned { PAGE_SIZE } else { 0 };
            ealloc::alloc_aligned_phys(size, align)
                .ok_or_else(|| MemoryError::PlacementOverflow { requested: size }.into())
        }
    }
}

/// Allocate from the kernel heap (bump allocator before `init`).
pub fn kmalloc(size: usize) -> KernelResult<VirtualAddress> {
    intermediate_alloc(size, false).map(|(va, _)| va)
}

/// Page-aligned allocation.
pub fn kmalloc_a(size: usize) -> KernelResult<VirtualAddress> {
    intermediate_alloc(size, true).map(|(va, _)| va)
}

/// Allocation that also reports the physical address of its first byte.
pub fn kmalloc_p(size: usize) -> KernelResult<(VirtualAddress, PhysicalAddress)> {
    intermediate_alloc(size, false)
}

/// Page-aligned allocation with the physical address of its first byte.
pub fn kmalloc_ap(size: usize) -> KernelResult<(VirtualAddress, PhysicalAddress)> {
    intermediate_alloc(size, true)
}

/// Release a heap allocation. Before `init` this is a no-op, matching the
/// bump allocator's inability to free.
pub fn kfree(ptr: VirtualAddress) {
    if let Some(heap) = KERNEL_HEAP.lock().as_mut() {
        heap.free(ptr);
    }
}

/// Zeroed allocation of `count * size` bytes.
pub fn kcalloc(count: usize, size: usize) -> KernelResult<VirtualAddress> {
    let total = count * size;
    let va = kmalloc(total)?;
    // SAFETY: `va` was just allocated with room for `total` bytes.
    unsafe {
        core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, total);
    }
    Ok(va)
}

/// Resize a heap allocation. `Ok(None)` reports a zero-size request that
/// freed the pointer.
pub fn krealloc(ptr: VirtualAddress, size: usize) -> KernelResult<Option<VirtualAddress>> {
    let mut guard = KERNEL_HEAP.lock();
    match guard.as_mut() {
        Some(heap) => {
            if ptr.is_null() {
                return heap
                    .alloc(size, false)
                    .ok_or_else(|| HeapError::OutOfMemory { requested: size }.into())
                    .map(Some);
            }
            if size == 0 {
                heap.free(ptr);
                return Ok(None);
            }
            heap.realloc(ptr, size)
                .ok_or_else(|| HeapError::OutOfBounds { addr: ptr.0 }.into())
                .map(Some)
        }
        None => Err(crate::error::KernelError::NotInitialized { subsystem: "heap" }),
    }
}

/// Payload size of a heap allocation; 0 for null or pre-heap pointers.
pub fn ksize(ptr: VirtualAddress) -> usize {
    KERNEL_HEAP
        .lock()
        .as_ref()
        .map(|heap| heap.block_size(ptr))
        .unwrap_or(0)
}

/// `GlobalAlloc` hook so in-kernel `alloc` users are served by this heap.
#[cfg(target_os = "none")]
pub struct KernelAllocator;

#[cfg(target_os = "none")]
// SAFETY: delegates to the locked kernel heap; null signals failure as the
// GlobalAlloc contract requires.
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        let result = if layout.align() <= core::mem::align_of::<usize>() {
            kmalloc(layout.size())
        } else {
            kmalloc_a(layout.size())
        };
        match result {
            Ok(va) => va.as_mut_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        kfree(VirtualAddress(ptr as usize));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::testutil;

    const TEST_HEAP: usize = HEAP_INITIAL_SIZE;

    fn fresh_heap() -> Heap {
        testutil::init_globals();
        // slack behind the initial extent so growth stays inside the region
        let region = testutil::leak_region(3 * TEST_HEAP);
        let dir = testutil::leak_directory();
        let dir_ref = DirectoryRef::new(core::ptr::NonNull::new(dir as *mut _).unwrap());
        // SAFETY: the leaked region is writable and exclusively ours; page
        // bookkeeping for growth goes through the leaked directory.
        unsafe { Heap::create(region, TEST_HEAP, dir_ref) }
    }

    #[test]
    fn fresh_heap_is_one_free_block() {
        let heap = fresh_heap();
        assert_eq!(heap.block_list(), vec![(TEST_HEAP - HEADER_SIZE * 2, true)]);
    }

    #[test]
    fn round_trip_restores_a_single_free_block() {
        let mut heap = fresh_heap();
        let a = heap.alloc(100, false).unwrap();
        let b = heap.alloc(2048, false).unwrap();
        let c = heap.alloc(7, false).unwrap();

        heap.free(b);
        heap.free(a);
        heap.free(c);

        assert_eq!(heap.block_list(), vec![(TEST_HEAP - HEADER_SIZE * 2, true)]);
    }

    #[test]
    fn adjacent_free_blocks_coalesce_in_either_order() {
        let mut heap = fresh_heap();
        let a = heap.alloc(256, false).unwrap();
        let b = heap.alloc(256, false).unwrap();
        let _hold = heap.alloc(256, false).unwrap();

        heap.free(a);
        heap.free(b);
        let no_adjacent_free = heap.block_list().windows(2).all(|w| !(w[0].1 && w[1].1));
        assert!(no_adjacent_free, "adjacent free blocks after free");
    }

    #[test]
    fn first_fit_reuses_the_earliest_hole() {
        let mut heap = fresh_heap();
        let a = heap.alloc(512, false).unwrap();
        let _b = heap.alloc(512, false).unwrap();
        heap.free(a);
        let c = heap.alloc(100, false).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn growth_maps_pages_and_appends_a_block() {
        let _g = testutil::global_lock();
        let mut heap = fresh_heap();
        let big = heap.alloc(TEST_HEAP, false).unwrap();
        assert!(heap.size() > TEST_HEAP);
        assert_eq!(heap.size() % PAGE_SIZE, 0);
        heap.free(big);
    }

    #[test]
    fn grown_heap_frees_back_to_free_blocks_only() {
        let _g = testutil::global_lock();
        let mut heap = fresh_heap();
        assert_eq!(heap.block_list().len(), 1);

        let big = heap.alloc(1 << 20, false).unwrap();
        let grown = heap.size();
        heap.free(big);

        let blocks = heap.block_list();
        assert!(blocks.len() <= 2, "expected coalesced tail, got {:?}", blocks);
        let total: usize = blocks.iter().map(|(s, _)| s).sum();
        assert_eq!(total + blocks.len() * HEADER_SIZE, grown - HEADER_SIZE);
        assert!(blocks.iter().all(|&(_, free)| free));
    }

    #[test]
    fn aligned_alloc_returns_page_aligned_payload() {
        let mut heap = fresh_heap();
        let p = heap.alloc(0x1000, true).unwrap();
        assert_eq!(p.0 & 0xFFF, 0);
        assert_eq!(heap.block_size(p), 0x1000);
        heap.free(p);
        assert_eq!(heap.block_list(), vec![(TEST_HEAP - HEADER_SIZE * 2, true)]);
    }

    #[test]
    fn zero_size_alloc_is_refused() {
        let mut heap = fresh_heap();
        assert!(heap.alloc(0, false).is_none());
    }

    #[test]
    fn free_of_foreign_pointer_is_ignored() {
        let mut heap = fresh_heap();
        let before = heap.block_list();
        heap.free(VirtualAddress(0x10));
        heap.free(VirtualAddress(heap.start + heap.size + PAGE_SIZE));
        assert_eq!(heap.block_list(), before);
    }

    #[test]
    fn realloc_grows_and_preserves_contents() {
        let mut heap = fresh_heap();
        let p = heap.alloc(16, false).unwrap();
        // SAFETY: payload is live and 16 bytes long.
        unsafe {
            core::ptr::copy_nonoverlapping(b"helium!!".as_ptr(), p.as_mut_ptr::<u8>(), 8);
        }
        let q = heap.realloc(p, 4096).unwrap();
        // SAFETY: realloc copied the old payload into `q`.
        let copied = unsafe { core::slice::from_raw_parts(q.as_ptr::<u8>(), 8) };
        assert_eq!(copied, b"helium!!");
    }

    #[test]
    fn realloc_shrink_keeps_the_pointer() {
        let mut heap = fresh_heap();
        let p = heap.alloc(8192, false).unwrap();
        let q = heap.realloc(p, 128).unwrap();
        assert_eq!(p, q);
        assert!(heap.block_size(q) >= 128);
    }

    #[test]
    #[should_panic(expected = "heap corruption detected during free")]
    fn corrupted_magic_is_fatal_on_free() {
        let mut heap = fresh_heap();
        let p = heap.alloc(64, false).unwrap();
        // deliberately clobber the magic word of the live header
        // SAFETY: the header is live; the corruption is the point.
        unsafe {
            let header = (p.0 - HEADER_SIZE) as *mut BlockHeader;
            (*header).magic = 0xBAD0_BAD0;
        }
        heap.free(p);
    }

    #[test]
    #[should_panic(expected = "heap corruption detected during block_size")]
    fn corrupted_magic_is_fatal_on_size_query() {
        let mut heap = fresh_heap();
        let p = heap.alloc(64, false).unwrap();
        // SAFETY: the header is live; the corruption is the point.
        unsafe {
            let header = (p.0 - HEADER_SIZE) as *mut BlockHeader;
            (*header).magic = 0;
        }
        let _ = heap.block_size(p);
    }

    #[test]
    fn oversized_request_is_refused_without_growing() {
        let _g = testutil::global_lock();
        let mut heap = fresh_heap();
        assert!(heap.alloc(HEAP_MAX_SIZE, false).is_none());
        assert_eq!(heap.size(), TEST_HEAP);
    }
}
