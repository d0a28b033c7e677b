//! Multiboot v1 handoff
//!
//! The loader leaves a physical pointer to its info record in EBX. Only the
//! memory map is consumed here; everything else is carried for completeness
//! of the record layout.

use spin::Once;

use crate::mm::{phys_to_virt, PhysicalAddress};

/// Magic value in EAX at entry.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// `flags` bit: the `mmap_*` fields are valid.
pub const FLAG_MMAP: u32 = 1 << 6;

/// Memory-map entry type for usable RAM.
pub const MEMORY_AVAILABLE: u32 = 1;

/// Loader-provided physical pointer. 32 bits on the wire; hosted test
/// builds widen it so synthetic records can point at test buffers.
#[cfg(target_os = "none")]
pub type BootPtr = u32;
#[cfg(not(target_os = "none"))]
pub type BootPtr = usize;

/// Multiboot v1 information record, up to the memory-map fields.
#[repr(C)]
pub struct BootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: BootPtr,
}

/// One memory-map entry. `size` counts the bytes after itself, so the next
/// entry starts `size + 4` bytes further.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MmapEntry {
    pub size: u32,
    pub addr: u64,
    pub len: u64,
    pub entry_type: u32,
}

impl BootInfo {
    pub fn has_memory_map(&self) -> bool {
        self.flags & FLAG_MMAP != 0
    }

    /// Iterate the memory map. Empty if the loader did not provide one.
    pub fn memory_map(&self) -> MmapIter {
        if !self.has_memory_map() {
            return MmapIter { cursor: 0, end: 0 };
        }
        let base = phys_to_virt(PhysicalAddress(self.mmap_addr as usize)).0;
        MmapIter {
            cursor: base,
            end: base + self.mmap_length as usize,
        }
    }

    /// Total bytes of AVAILABLE memory reported by the loader.
    pub fn available_memory(&self) -> usize {
        let mut total = 0usize;
        for entry in self.memory_map() {
            if entry.entry_type == MEMORY_AVAILABLE {
                total += entry.len as usize;
            }
        }
        total
    }
}

pub struct MmapIter {
    cursor: usize,
    end: usize,
}

impl Iterator for MmapIter {
    type Item = MmapEntry;

    fn next(&mut self) -> Option<MmapEntry> {
        if self.cursor >= self.end {
            return None;
        }
        // SAFETY: the loader guarantees `mmap_length` bytes of entries at
        // `mmap_addr`; entries are packed, hence the unaligned read.
        let entry = unsafe { core::ptr::read_unaligned(self.cursor as *const MmapEntry) };
        self.cursor += entry.size as usize + core::mem::size_of::<u32>();
        Some(entry)
    }
}

static BOOT_INFO: Once<&'static BootInfo> = Once::new();

/// Record the loader handoff. Called once from the entry point.
pub fn set_boot_info(info: &'static BootInfo) {
    BOOT_INFO.call_once(|| info);
}

/// The recorded handoff, if any.
pub fn boot_info() -> Option<&'static BootInfo> {
    BOOT_INFO.get().copied()
}
