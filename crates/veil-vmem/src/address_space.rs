//! Range mapping and unmapping against one live page-table tree.
//!
//! Contiguous ranges are not walked per page: the cursor keeps the four
//! level indices plus a reference per level, bumps the PT index mod 512,
//! and re-derives table references only when an index wraps. A fresh
//! root-down walk per page costs roughly eight times as much and this path
//! sits under every allocation.

use crate::page_table::{ENTRIES, PageTable, PageTableEntry, split_indices};
use crate::{FrameAlloc, IDENTITY_MAP_LIMIT, PhysMapper};
use log::{debug, trace};
use veil_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};

/// Handle to one concrete address space, rooted at a PML4 frame.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

/// Failure installing a range of 4 KiB mappings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemapError {
    /// The frame allocator could not supply a page-table frame.
    #[error("out of memory allocating a page table")]
    OutOfMemory,
    /// A target leaf already had Present set. Double-mapping an alias is
    /// forbidden; the caller treats this as fatal.
    #[error("virtual page {virt} already maps {existing}")]
    AlreadyMapped {
        virt: VirtualAddress,
        existing: PhysicalAddress,
    },
}

/// Failure revoking a range of 4 KiB mappings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnmapError {
    /// The leaf for this page was already clear.
    #[error("virtual page {0} is not mapped")]
    NotMapped(VirtualAddress),
    /// An intermediate level is missing, so the leaf cannot be reached.
    #[error("no page-table chain reaches {0}")]
    MissingTable(VirtualAddress),
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wrap an explicit root frame.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// The currently active address space, root read from CR3.
    ///
    /// The CR3 read is cached after the first call (this system never
    /// switches address spaces); `bypass_cache` forces a re-read.
    ///
    /// # Safety
    /// CPL 0 with paging enabled; CR3 must hold a valid root frame that is
    /// reachable through `mapper`.
    #[inline]
    pub unsafe fn from_current(mapper: &'m M, bypass_cache: bool) -> Self {
        let root = unsafe { crate::current_root(bypass_cache) };
        Self { root, mapper }
    }

    /// Physical page of the root table.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Install 4 KiB mappings so `size` bytes of physical memory at `from`
    /// read and write through the virtual range at `to`.
    ///
    /// Intermediate tables are created on demand (present + writable, never
    /// user); leaves are present + writable with NX per `no_execute`.
    ///
    /// # Errors
    /// [`RemapError::AlreadyMapped`] if any target leaf has Present set,
    /// [`RemapError::OutOfMemory`] if a table frame cannot be allocated.
    /// Both are fatal in the aliasing engine.
    ///
    /// # Panics
    /// `from` must lie in the identity-mapped low gigabyte: the engine only
    /// republishes memory the backing allocator handed out from there.
    pub fn remap_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        from: PhysicalAddress,
        to: VirtualAddress,
        size: u64,
        no_execute: bool,
    ) -> Result<(), RemapError> {
        assert!(
            from.as_u64() < IDENTITY_MAP_LIMIT,
            "origin {from} outside the identity-mapped low GiB"
        );
        debug_assert_eq!(from.offset_in::<Size4K>(), 0, "unaligned physical start");
        debug_assert_eq!(to.offset_in::<Size4K>(), 0, "unaligned virtual start");
        debug_assert!(size > 0);

        let pages = size.div_ceil(Size4K::SIZE);
        let (mut i4, mut i3, mut i2, mut i1) = split_indices(to);

        let pml4 = self.table(self.root);
        let mut pdpt = self.next_table_or_create(pml4, i4, alloc)?;
        let mut pd = self.next_table_or_create(pdpt, i3, alloc)?;
        let mut pt = self.next_table_or_create(pd, i2, alloc)?;

        trace!("remap {pages} pages {from} -> {to}");
        for n in 0..pages {
            let leaf = pt.get(i1);
            if leaf.present() {
                return Err(RemapError::AlreadyMapped {
                    virt: VirtualAddress::new(to.as_u64() + n * Size4K::SIZE),
                    existing: leaf.physical_page().base(),
                });
            }

            let src = PhysicalAddress::new(from.as_u64() + n * Size4K::SIZE).page::<Size4K>();
            pt.set(i1, PageTableEntry::leaf_4k(src, no_execute));

            // Stop before the advance would create a table the range never
            // touches.
            if n + 1 == pages {
                break;
            }

            i1 = (i1 + 1) % ENTRIES;
            if i1 == 0 {
                i2 = (i2 + 1) % ENTRIES;
                if i2 == 0 {
                    i3 = (i3 + 1) % ENTRIES;
                    if i3 == 0 {
                        i4 += 1;
                        pdpt = self.next_table_or_create(pml4, i4, alloc)?;
                    }
                    pd = self.next_table_or_create(pdpt, i3, alloc)?;
                }
                pt = self.next_table_or_create(pd, i2, alloc)?;
            }
        }
        Ok(())
    }

    /// Clear the leaf for every 4 KiB page in `[virt, virt + size)`.
    ///
    /// Each cleared page is followed by a TLB invalidation of the physical
    /// address it used to map (the identity-mapped origin window), issued
    /// after any table reclamation for that step so the invalidation covers
    /// the table edits too.
    ///
    /// A PT whose 512 entries all ended up non-present is handed back to
    /// `free` and its PD entry cleared; a PD that empties the same way
    /// follows it. The PDPT level is never reclaimed. Reclamation runs at
    /// every index-wrap boundary and once more after the final page.
    ///
    /// # Errors
    /// [`UnmapError::NotMapped`] if a leaf was already clear,
    /// [`UnmapError::MissingTable`] if the chain to a leaf does not exist.
    /// Both are fatal in the aliasing engine.
    pub fn unmap_range<F: FrameAlloc>(
        &self,
        free: &mut F,
        virt: VirtualAddress,
        size: u64,
    ) -> Result<(), UnmapError> {
        debug_assert_eq!(virt.offset_in::<Size4K>(), 0, "unaligned virtual start");
        debug_assert!(size > 0);

        let pages = size.div_ceil(Size4K::SIZE);
        let (mut i4, mut i3, mut i2, mut i1) = split_indices(virt);

        let missing = UnmapError::MissingTable(virt);
        let pml4 = self.table(self.root);
        let (mut pdpt_page, mut pdpt) = self.next_table_of(pml4, i4).ok_or(missing)?;
        let (mut pd_page, mut pd) = self.next_table_of(pdpt, i3).ok_or(missing)?;
        let (mut pt_page, mut pt) = self.next_table_of(pd, i2).ok_or(missing)?;

        trace!("unmap {pages} pages at {virt}");
        for n in 0..pages {
            let va = VirtualAddress::new(virt.as_u64() + n * Size4K::SIZE);
            let leaf = pt.get(i1);
            if !leaf.present() {
                return Err(UnmapError::NotMapped(va));
            }
            let spent = leaf.physical_page().base();
            pt.set_zero(i1);

            let last = n + 1 == pages;
            i1 = (i1 + 1) % ENTRIES;
            if i1 == 0 {
                let pt_freed = self.reclaim_if_empty(free, pd, i2, pt_page);
                i2 = (i2 + 1) % ENTRIES;
                if i2 == 0 {
                    self.reclaim_if_empty(free, pdpt, i3, pd_page);
                    i3 = (i3 + 1) % ENTRIES;
                    if i3 == 0 {
                        i4 += 1;
                        if !last {
                            (pdpt_page, pdpt) = self
                                .next_table_of(pml4, i4)
                                .ok_or(UnmapError::MissingTable(va))?;
                        }
                    }
                    if !last {
                        (pd_page, pd) = self
                            .next_table_of(pdpt, i3)
                            .ok_or(UnmapError::MissingTable(va))?;
                    }
                } else if last && pt_freed {
                    self.reclaim_if_empty(free, pdpt, i3, pd_page);
                }
                if !last {
                    (pt_page, pt) = self
                        .next_table_of(pd, i2)
                        .ok_or(UnmapError::MissingTable(va))?;
                }
            } else if last && self.reclaim_if_empty(free, pd, i2, pt_page) {
                self.reclaim_if_empty(free, pdpt, i3, pd_page);
            }

            // Flush after reclamation so the INVLPG also covers the table
            // edits. The spent frame is identity-mapped, so its physical
            // address is the stale translation to kill.
            self.mapper
                .invalidate_tlb(VirtualAddress::new(spent.as_u64()));
        }
        Ok(())
    }

    /// Translate `va` if mapped, honouring 1 GiB and 2 MiB leaves.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (i4, i3, i2, i1) = split_indices(va);

        let pml4 = self.table(self.root);
        let pdpt = self.table(pml4.get(i4).next_table()?);

        let e3 = pdpt.get(i3);
        if e3.present() && e3.page_size() {
            return Some(e3.leaf_base_1g().base() + va.offset_in::<Size1G>());
        }
        let pd = self.table(e3.next_table()?);

        let e2 = pd.get(i2);
        if e2.present() && e2.page_size() {
            return Some(e2.leaf_base_2m().base() + va.offset_in::<Size2M>());
        }
        let pt = self.table(e2.next_table()?);

        let e1 = pt.get(i1);
        if !e1.present() {
            return None;
        }
        Some(e1.physical_page().base() + va.offset_in::<Size4K>())
    }

    /// Walk the whole tree and emit one `debug!` line per mapping.
    ///
    /// With `skip_identity_gib` the bulk identity mapping of the low
    /// gigabyte is summarised instead of listed.
    pub fn dump(&self, skip_identity_gib: bool) {
        debug!("page tables rooted at {}", self.root.base());

        let pml4 = self.table(self.root);
        for i4 in 0..ENTRIES {
            let Some(pdpt_page) = pml4.get(i4).next_table() else {
                continue;
            };
            let va4 = canonical((i4 as u64) << 39);
            debug!("|- pml4[{i4:3}] -> table {}", pdpt_page.base());

            let pdpt = self.table(pdpt_page);
            for i3 in 0..ENTRIES {
                let e3 = pdpt.get(i3);
                if !e3.present() {
                    continue;
                }
                let va3 = va4 + ((i3 as u64) << 30);
                if e3.page_size() {
                    if skip_identity_gib && va3 < IDENTITY_MAP_LIMIT {
                        debug!("|  |- pdpt[{i3:3}] 1 GiB identity mapping omitted");
                    } else {
                        debug!(
                            "|  |- pdpt[{i3:3}] 1 GiB page {:#x}-{:#x} -> {}",
                            va3,
                            va3 + Size1G::SIZE - 1,
                            e3.leaf_base_1g().base()
                        );
                    }
                    continue;
                }
                debug!("|  |- pdpt[{i3:3}] -> table {}", e3.physical_page().base());

                let pd = self.table(e3.physical_page());
                for i2 in 0..ENTRIES {
                    let e2 = pd.get(i2);
                    if !e2.present() {
                        continue;
                    }
                    let va2 = va3 + ((i2 as u64) << 21);
                    if e2.page_size() {
                        if skip_identity_gib && va2 < IDENTITY_MAP_LIMIT {
                            debug!("|  |  |- pd[{i2:3}] 2 MiB identity mapping omitted");
                        } else {
                            debug!(
                                "|  |  |- pd[{i2:3}] 2 MiB page {:#x}-{:#x} -> {}",
                                va2,
                                va2 + Size2M::SIZE - 1,
                                e2.leaf_base_2m().base()
                            );
                        }
                        continue;
                    }
                    debug!("|  |  |- pd[{i2:3}] -> table {}", e2.physical_page().base());

                    let pt = self.table(e2.physical_page());
                    let mut mapped = 0usize;
                    for i1 in 0..ENTRIES {
                        let e1 = pt.get(i1);
                        if !e1.present() {
                            continue;
                        }
                        mapped += 1;
                        let va1 = va2 + ((i1 as u64) << 12);
                        debug!(
                            "|  |  |  |- pt[{i1:3}] {:#x}-{:#x} -> {} [nx={}]",
                            va1,
                            va1 + Size4K::SIZE - 1,
                            e1.physical_page().base(),
                            e1.no_execute()
                        );
                    }
                    if mapped == 0 {
                        debug!("|  |  |  ?? table has no mappings ??");
                    }
                }
            }
        }
    }

    /// Borrow the table held in `page` through the mapper.
    #[inline]
    fn table(&self, page: PhysicalPage<Size4K>) -> &'m mut PageTable {
        // Safety: `page` is a page-table frame reachable through the
        // mapper; exclusivity is provided by the engine's global lock.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Child table behind `parent[idx]`, if that entry links one.
    #[inline]
    fn next_table_of(
        &self,
        parent: &PageTable,
        idx: usize,
    ) -> Option<(PhysicalPage<Size4K>, &'m mut PageTable)> {
        let page = parent.get(idx).next_table()?;
        Some((page, self.table(page)))
    }

    /// Child table behind `parent[idx]`, creating a zeroed one when absent.
    fn next_table_or_create<A: FrameAlloc>(
        &self,
        parent: &mut PageTable,
        idx: usize,
        alloc: &mut A,
    ) -> Result<&'m mut PageTable, RemapError> {
        let e = parent.get(idx);
        if let Some(page) = e.next_table() {
            return Ok(self.table(page));
        }
        debug_assert!(!e.present(), "large-page leaf in an alias subtree");

        let page = alloc.alloc_4k().ok_or(RemapError::OutOfMemory)?;
        let table = self.table(page);
        *table = PageTable::zeroed();
        parent.set(idx, PageTableEntry::table_link(page));
        trace!("new page table at {}", page.base());
        Ok(table)
    }

    /// Free `child` back to `free` and clear `parent[idx]` when every entry
    /// of `child` is non-present. Returns whether it was reclaimed.
    fn reclaim_if_empty<F: FrameAlloc>(
        &self,
        free: &mut F,
        parent: &mut PageTable,
        idx: usize,
        child: PhysicalPage<Size4K>,
    ) -> bool {
        if !self.table(child).is_empty() {
            return false;
        }
        debug_assert!(
            parent.get(idx).present(),
            "reclaiming under a non-present entry"
        );
        parent.set_zero(idx);
        free.free_4k(child);
        trace!("reclaimed empty page table {}", child.base());
        true
    }
}

/// Sign-extend a 48-bit virtual address to its canonical form.
#[inline]
const fn canonical(va: u64) -> u64 {
    if va & (1 << 47) != 0 {
        va | 0xFFFF_0000_0000_0000
    } else {
        va
    }
}
