//! Page tables and directories
//!
//! Two-level 32-bit paging: a directory of 1024 slots, each naming a table
//! of 1024 entries. The directory keeps both the table reference the kernel
//! walks and the physical word the CPU walks; the two must agree.

use bitfield_struct::bitfield;

use super::{pool, virt_to_phys, VirtualAddress, PAGE_ENTRIES};
use crate::arch::cpu;
use crate::error::PoolError;
use crate::mm::frame::PageFlags;

/// One page-table entry. `nx` has no hardware meaning without PAE and is
/// carried as a software attribute.
#[bitfield(u32)]
pub struct PageTableEntry {
    pub present: bool,
    pub rw: bool,
    pub user: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub nx: bool,
    #[bits(6)]
    __: u8,
    #[bits(20)]
    pub frame: u32,
}

impl PageTableEntry {
    /// An entry with `frame == 0` is unmapped regardless of its flag bits.
    pub const fn is_mapped(&self) -> bool {
        self.frame() != 0
    }

    /// Flag-bit view of the entry; the low six bits line up with
    /// [`PageFlags`].
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits() & 0x3F)
    }
}

/// 1024 contiguous entries, 4 KiB aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; PAGE_ENTRIES],
}

/// Two-level directory. `tables` is what the kernel dereferences,
/// `tables_physical` is what goes into CR3's tree, `physical_addr` is the
/// CR3 value itself.
#[repr(C, align(4096))]
pub struct PageDirectory {
    pub tables: [*mut PageTable; PAGE_ENTRIES],
    pub tables_physical: [usize; PAGE_ENTRIES],
    pub physical_addr: usize,
}

impl PageDirectory {
    /// The PTE for `va` if its owning table exists. No side effects.
    #[allow(clippy::mut_from_ref)]
    pub fn get_page(&self, va: VirtualAddress) -> Option<&mut PageTableEntry> {
        let table = self.tables[va.table_index()];
        if table.is_null() {
            return None;
        }
        // SAFETY: non-null table pointers in `tables` always reference live
        // pool- or heap-backed page tables owned by this directory.
        Some(unsafe { &mut (*table).entries[va.page_index()] })
    }

    /// The PTE for `va`, allocating the owning table from the pool when
    /// missing. Idempotent for already-populated slots.
    pub fn create_page(
        &mut self,
        va: VirtualAddress,
        is_kernel: bool,
    ) -> Result<&mut PageTableEntry, PoolError> {
        let table_idx = va.table_index();

        if self.tables[table_idx].is_null() {
            let table = pool::alloc()?;
            self.tables[table_idx] = table.as_ptr();

            let table_phys = virt_to_phys(VirtualAddress(table.as_ptr() as usize)).0;
            let mut word = table_phys | (PageFlags::PRESENT | PageFlags::RW).bits() as usize;
            if !is_kernel {
                word |= PageFlags::USER.bits() as usize;
            }
            self.tables_physical[table_idx] = word;
        }

        // SAFETY: the slot was just verified (or made) non-null.
        Ok(unsafe { &mut (*self.tables[table_idx]).entries[va.page_index()] })
    }

    /// Unmap `va`: clear the frame and present bits. The owning table stays;
    /// tables are lifetime-bound to the directory.
    pub fn destroy_page(&mut self, va: VirtualAddress) {
        let table = self.tables[va.table_index()];
        if table.is_null() {
            return;
        }
        // SAFETY: non-null table pointers reference live page tables.
        let pte = unsafe { &mut (*table).entries[va.page_index()] };
        pte.set_frame(0);
        pte.set_present(false);
    }
}

/// Apply `rw`/`user` from `flags` to every mapped page in the range and
/// flush each touched translation.
pub fn protect_region(dir: &PageDirectory, start: VirtualAddress, len: usize, flags: PageFlags) {
    let mut va = start.0;
    while va < start.0 + len {
        if let Some(pte) = dir.get_page(VirtualAddress(va)) {
            pte.set_rw(flags.contains(PageFlags::RW));
            pte.set_user(flags.contains(PageFlags::USER));
            cpu::flush_tlb_entry(va);
        }
        va += super::PAGE_SIZE;
    }
}

/// Set or clear the software no-execute attribute for one page.
pub fn set_nx(dir: &PageDirectory, va: VirtualAddress, enable: bool) {
    if let Some(pte) = dir.get_page(va) {
        pte.set_nx(enable);
        cpu::flush_tlb_entry(va.0);
    }
}

/// Structural probe: every present entry must name a frame.
pub fn validate_directory(dir: &PageDirectory) -> bool {
    for i in 0..PAGE_ENTRIES {
        let table = dir.tables[i];
        if table.is_null() {
            continue;
        }
        for j in 0..PAGE_ENTRIES {
            // SAFETY: non-null table pointers reference live page tables.
            let pte = unsafe { &(*table).entries[j] };
            if pte.present() && pte.frame() == 0 {
                return false;
            }
        }
    }
    true
}

/// Entry-by-entry comparison of two directories.
pub fn directories_equal(a: &PageDirectory, b: &PageDirectory) -> bool {
    if core::ptr::eq(a, b) {
        return true;
    }
    for i in 0..PAGE_ENTRIES {
        match (a.tables[i].is_null(), b.tables[i].is_null()) {
            (true, true) => continue,
            (false, false) => {}
            _ => return false,
        }
        for j in 0..PAGE_ENTRIES {
            // SAFETY: both tables were just verified non-null.
            let (x, y) = unsafe { (&(*a.tables[i]).entries[j], &(*b.tables[i]).entries[j]) };
            if x.into_bits() != y.into_bits() {
                return false;
            }
        }
    }
    true
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{frame::PageFlags, PAGE_SIZE};
    use crate::testutil;

    #[test]
    fn entry_bit_layout_matches_hardware() {
        let pte = PageTableEntry::new()
            .with_present(true)
            .with_rw(true)
            .with_frame(0x1234);
        assert_eq!(pte.into_bits(), 0x1234 << 12 | 0b11);
    }

    #[test]
    fn unmapped_entry_has_zero_frame() {
        let pte = PageTableEntry::new().with_present(true);
        assert!(!pte.is_mapped());
    }

    #[test]
    fn get_page_is_side_effect_free() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        assert!(dir.get_page(VirtualAddress(0xC040_0000)).is_none());
        assert!(dir.tables[VirtualAddress(0xC040_0000).table_index()].is_null());
    }

    #[test]
    fn create_page_wires_the_physical_word() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let va = VirtualAddress(0x0040_0000);

        dir.create_page(va, true).unwrap();
        let idx = va.table_index();
        let table = dir.tables[idx];
        assert!(!table.is_null());
        let word = dir.tables_physical[idx];
        assert_eq!(word & !(PAGE_SIZE - 1), table as usize);
        assert_eq!(
            word & 0x7,
            (PageFlags::PRESENT | PageFlags::RW).bits() as usize
        );
    }

    #[test]
    fn create_page_marks_user_tables() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let va = VirtualAddress(0x0080_0000);
        dir.create_page(va, false).unwrap();
        let word = dir.tables_physical[va.table_index()];
        assert!(word & PageFlags::USER.bits() as usize != 0);
    }

    #[test]
    fn create_page_is_idempotent() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let va = VirtualAddress(0x00C0_0000);
        dir.create_page(va, true).unwrap();
        let table = dir.tables[va.table_index()];
        dir.create_page(va.add(PAGE_SIZE), true).unwrap();
        assert_eq!(dir.tables[va.table_index()], table);
    }

    #[test]
    fn destroy_page_clears_frame_and_present() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let va = VirtualAddress(0x0100_0000);
        {
            let pte = dir.create_page(va, true).unwrap();
            pte.set_frame(42);
            pte.set_present(true);
            pte.set_rw(true);
        }
        dir.destroy_page(va);
        let pte = dir.get_page(va).unwrap();
        assert_eq!(pte.frame(), 0);
        assert!(!pte.present());
        assert!(pte.rw());
    }

    #[test]
    fn protect_region_rewrites_rw_and_user() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let base = VirtualAddress(0x0180_0000);
        for i in 0..4 {
            let pte = dir.create_page(base.add(i * PAGE_SIZE), true).unwrap();
            pte.set_frame(100 + i as u32);
            pte.set_present(true);
            pte.set_rw(true);
        }

        protect_region(dir, base, 4 * PAGE_SIZE, PageFlags::USER);
        for i in 0..4 {
            let pte = dir.get_page(base.add(i * PAGE_SIZE)).unwrap();
            assert!(!pte.rw());
            assert!(pte.user());
        }
    }

    #[test]
    fn nx_attribute_toggles() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let va = VirtualAddress(0x01C0_0000);
        {
            let pte = dir.create_page(va, true).unwrap();
            pte.set_frame(7);
        }
        set_nx(dir, va, true);
        assert!(dir.get_page(va).unwrap().nx());
        set_nx(dir, va, false);
        assert!(!dir.get_page(va).unwrap().nx());
    }

    #[test]
    fn validate_directory_spots_present_without_frame() {
        testutil::init_globals();
        let dir = testutil::leak_directory();
        let va = VirtualAddress(0x0140_0000);
        {
            let pte = dir.create_page(va, true).unwrap();
            pte.set_present(true);
        }
        assert!(!validate_directory(dir));
        dir.get_page(va).unwrap().set_frame(7);
        assert!(validate_directory(dir));
    }
}
