//! Page-table entries and tables.
//!
//! One entry type serves all four levels; the walk code knows which level it
//! is on and which fields mean what there. Bit 7 is the PageSize bit in PDPT
//! and PD entries (the PAT selector in a PT entry; this crate leaves it
//! clear in every entry it writes).

use bitfield_struct::bitfield;
use veil_memory_addresses::{PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress};

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// A 64-bit page-table entry.
///
/// - Non-leaf form: bits 51:12 hold the 4 KiB-aligned base of the next
///   table; PageSize is clear.
/// - 4 KiB leaf form (PT level): bits 51:12 hold the mapped page.
/// - Large leaf forms (PD/PDPT with PageSize set): recognised by the walker
///   but never written by this crate.
#[bitfield(u64)]
pub struct PageTableEntry {
    /// Present (bit 0). Clear means the entry is ignored and access faults.
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User-accessible (bit 2). Never set here; the heap is kernel memory.
    pub user: bool,
    /// Write-through (bit 3).
    pub write_through: bool,
    /// Cache disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5), set by the CPU.
    pub accessed: bool,
    /// Dirty (bit 6), set by the CPU on write; leaf entries only.
    pub dirty: bool,
    /// PageSize (bit 7) at the PDPT/PD levels; PAT selector in a PT entry.
    pub page_size: bool,
    /// Global (bit 8).
    pub global: bool,
    /// OS-available (bits 9–11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical base, bits 51:12 (4 KiB aligned).
    #[bits(40)]
    phys_addr_51_12: u64,
    /// OS-available (bits 52–58).
    #[bits(7)]
    pub os_available_high: u8,
    /// Protection key (bits 59–62).
    #[bits(4)]
    pub protection_key: u8,
    /// No-execute (bit 63); requires `EFER.NXE`, reserved otherwise.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A cleared (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Link to a next-level table: present + writable, never user.
    #[must_use]
    pub const fn table_link(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_physical_page(table)
    }

    /// A 4 KiB leaf: present + writable, NX per configuration.
    #[must_use]
    pub const fn leaf_4k(page: PhysicalPage<Size4K>, no_execute: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(no_execute)
            .with_physical_page(page)
    }

    /// The 4 KiB-aligned base stored in bits 51:12.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalAddress::new(self.phys_addr_51_12() << 12).page::<Size4K>()
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_page(mut self, page: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(page.base().as_u64() >> 12);
        self
    }

    /// Next-level table page, if this is a present non-leaf entry.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() && !self.page_size() {
            Some(self.physical_page())
        } else {
            None
        }
    }

    /// Base of a 2 MiB leaf (PD entry with PageSize set).
    #[inline]
    #[must_use]
    pub const fn leaf_base_2m(self) -> PhysicalPage<Size2M> {
        PhysicalAddress::new(self.into_bits() & 0x000F_FFFF_FFE0_0000).page::<Size2M>()
    }

    /// Base of a 1 GiB leaf (PDPT entry with PageSize set).
    #[inline]
    #[must_use]
    pub const fn leaf_base_1g(self) -> PhysicalPage<Size1G> {
        PhysicalAddress::new(self.into_bits() & 0x000F_FFFF_C000_0000).page::<Size1G>()
    }
}

/// A page table: 512 entries, one 4 KiB frame, any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    /// A table with every entry non-present.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageTableEntry {
        self.entries[i]
    }

    #[inline]
    pub const fn set(&mut self, i: usize, e: PageTableEntry) {
        self.entries[i] = e;
    }

    #[inline]
    pub const fn set_zero(&mut self, i: usize) {
        self.entries[i] = PageTableEntry::zero();
    }

    /// True when no entry has the Present bit, the reclamation condition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

/// Table indices of `va`, root-first: `(pml4, pdpt, pd, pt)`.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (usize, usize, usize, usize) {
    let v = va.as_u64();
    (
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    )
}
