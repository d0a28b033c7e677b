//! Physical frame allocator
//!
//! A bit-packed set over every 4 KiB frame the machine has, seeded from the
//! Multiboot memory map. One frame, one owner: a frame number lives in
//! exactly one page-table entry (or a reserved range) until it is freed
//! through that same entry.

use bitflags::bitflags;
use spin::Mutex;

use super::{ealloc, paging::PageTableEntry, virt_to_phys, FrameNumber, PhysicalAddress, PAGE_SIZE};
use crate::{
    boot::multiboot::{BootInfo, MEMORY_AVAILABLE},
    error::{KernelResult, MemoryError},
};

/// Hard cap on tracked frames (4 GiB of address space).
pub const MAX_FRAMES: usize = 1_048_576;

const BITS_PER_WORD: usize = 32;

bitflags! {
    /// Page attribute bits, as stored in a [`PageTableEntry`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 3;
        const DIRTY = 1 << 4;
        const NX = 1 << 5;
    }
}

pub struct FrameAllocator {
    bitmap: &'static mut [u32],
    frame_count: usize,
    used: usize,
    free: usize,
}

impl FrameAllocator {
    pub const fn empty() -> Self {
        Self {
            bitmap: &mut [],
            frame_count: 0,
            used: 0,
            free: 0,
        }
    }

    fn set(&mut self, frame: usize) {
        self.bitmap[frame / BITS_PER_WORD] |= 1 << (frame % BITS_PER_WORD);
        self.used += 1;
        self.free -= 1;
    }

    fn clear(&mut self, frame: usize) {
        self.bitmap[frame / BITS_PER_WORD] &= !(1 << (frame % BITS_PER_WORD));
        self.used -= 1;
        self.free += 1;
    }

    fn test(&self, frame: usize) -> bool {
        self.bitmap[frame / BITS_PER_WORD] & (1 << (frame % BITS_PER_WORD)) != 0
    }

    /// First clear bit. Running out of physical memory is fatal.
    fn first_free(&self) -> usize {
        for frame in 0..self.frame_count {
            if !self.test(frame) {
                return frame;
            }
        }
        panic!("first_free: no free frames");
    }

    /// Seed the allocator: carve the bitmap from the early allocator, mark
    /// everything free, reserve the low megabyte, the kernel image and the
    /// bitmap itself, then walk the loader's memory map. Reserved bits stay
    /// set no matter what the map claims.
    pub fn init(
        &mut self,
        mem_size: usize,
        info: &BootInfo,
        kernel_start: PhysicalAddress,
        kernel_end: PhysicalAddress,
    ) -> KernelResult<()> {
        if !info.has_memory_map() {
            return Err(MemoryError::NoMemoryMap.into());
        }

        self.frame_count = core::cmp::min(mem_size / PAGE_SIZE, MAX_FRAMES);

        let words = self.frame_count.div_ceil(BITS_PER_WORD);
        let bitmap_va = ealloc::alloc_aligned(words * 4, 4).ok_or(MemoryError::PlacementOverflow {
            requested: words * 4,
        })?;
        // SAFETY: the region was just carved for exactly `words` u32s and is
        // never handed out again by the bump allocator.
        self.bitmap =
            unsafe { core::slice::from_raw_parts_mut(bitmap_va.as_mut_ptr::<u32>(), words) };
        self.bitmap.fill(0);
        self.used = 0;
        self.free = self.frame_count;

        // Lower 1 MiB: BIOS data, VGA, option ROMs.
        self.mark_reserved(0, 256);

        self.mark_kernel(kernel_start.frame(), kernel_end.0.div_ceil(PAGE_SIZE));

        let bitmap_phys = virt_to_phys(bitmap_va);
        let bitmap_frames = (words * 4).div_ceil(PAGE_SIZE);
        self.mark_reserved(bitmap_phys.frame(), bitmap_phys.frame() + bitmap_frames);

        for entry in info.memory_map() {
            if entry.entry_type != MEMORY_AVAILABLE {
                continue;
            }
            let start = entry.addr as usize;
            if start >= mem_size {
                continue;
            }
            let end = core::cmp::min((entry.addr + entry.len) as usize, mem_size);

            // The range goes back to free, except bits a reservation
            // already claimed; those stay set.
            let last = core::cmp::min(end / PAGE_SIZE, self.frame_count);
            let mut kept = 0usize;
            for frame in start / PAGE_SIZE..last {
                if self.test(frame) {
                    kept += 1;
                }
            }
            log::debug!(
                "frame: available {:#x}..{:#x} ({} MiB), {} reserved frames kept",
                start,
                end,
                (end - start) / 1024 / 1024,
                kept
            );
        }

        log::info!(
            "frame: {} frames, {} used, {} free, bitmap at {:#x}",
            self.frame_count,
            self.used,
            self.free,
            bitmap_va.0
        );
        Ok(())
    }

    /// Back `pte` with a frame. An already-mapped entry is returned
    /// unchanged; otherwise the first free frame is claimed and the flag
    /// bits are written from `flags`.
    pub fn allocate_frame(
        &mut self,
        pte: &mut PageTableEntry,
        _is_kernel: bool,
        flags: PageFlags,
    ) -> FrameNumber {
        if pte.frame() != 0 {
            return FrameNumber(pte.frame() as usize);
        }

        let frame = self.first_free();
        self.set(frame);
        pte.set_frame(frame as u32);
        pte.set_present(flags.contains(PageFlags::PRESENT));
        pte.set_rw(flags.contains(PageFlags::RW));
        pte.set_user(flags.contains(PageFlags::USER));
        pte.set_accessed(flags.contains(PageFlags::ACCESSED));
        pte.set_dirty(flags.contains(PageFlags::DIRTY));
        pte.set_nx(flags.contains(PageFlags::NX));
        FrameNumber(frame)
    }

    /// Release the frame owned by `pte`. Idempotent: an unmapped entry is
    /// left alone.
    pub fn free_frame(&mut self, pte: &mut PageTableEntry) {
        if pte.frame() == 0 {
            return;
        }
        self.clear(pte.frame() as usize);
        pte.set_frame(0);
    }

    /// Claim `[start, end)` for the kernel image. Already-set bits are
    /// skipped, never double-marked.
    pub fn mark_kernel(&mut self, start: usize, end: usize) {
        for frame in start..core::cmp::min(end, self.frame_count) {
            if !self.test(frame) {
                self.set(frame);
            }
        }
    }

    /// Claim `[start, end)` as reserved. Already-set bits are skipped.
    pub fn mark_reserved(&mut self, start: usize, end: usize) {
        for frame in start..core::cmp::min(end, self.frame_count) {
            if !self.test(frame) {
                self.set(frame);
            }
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn used_frames(&self) -> usize {
        self.used
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Whether `frame` is currently claimed.
    pub fn is_used(&self, frame: usize) -> bool {
        self.test(frame)
    }
}

pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

/// Seed the global allocator (step 3 of the memory init order).
pub fn init(
    mem_size: usize,
    info: &BootInfo,
    kernel_start: PhysicalAddress,
    kernel_end: PhysicalAddress,
) -> KernelResult<()> {
    FRAME_ALLOCATOR
        .lock()
        .init(mem_size, info, kernel_start, kernel_end)
}

pub fn allocate_frame(pte: &mut PageTableEntry, is_kernel: bool, flags: PageFlags) -> FrameNumber {
    FRAME_ALLOCATOR.lock().allocate_frame(pte, is_kernel, flags)
}

pub fn free_frame(pte: &mut PageTableEntry) {
    FRAME_ALLOCATOR.lock().free_frame(pte)
}

pub fn mark_kernel(start: usize, end: usize) {
    FRAME_ALLOCATOR.lock().mark_kernel(start, end)
}

pub fn mark_reserved(start: usize, end: usize) {
    FRAME_ALLOCATOR.lock().mark_reserved(start, end)
}

pub fn frame_count() -> usize {
    FRAME_ALLOCATOR.lock().frame_count()
}

pub fn used_frames() -> usize {
    FRAME_ALLOCATOR.lock().used_frames()
}

pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_frames()
}
