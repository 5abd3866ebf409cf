//! # Live Page-Table Manipulation
//!
//! The mapping half of the aliasing shim: installing and revoking 4 KiB
//! translations in the running address space, allocating and reclaiming the
//! intermediate tables as ranges come and go.
//!
//! ## The x86-64 walk
//!
//! A canonical 48-bit virtual address indexes four table levels, nine bits
//! each, with a 12-bit page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | offset |
//! ```
//!
//! Every level is a 4 KiB table of 512 eight-byte entries. A PT entry always
//! maps a 4 KiB page; PD and PDPT entries with the PageSize bit set map
//! 2 MiB and 1 GiB leaves. This crate *creates* only 4 KiB mappings; the
//! large forms are recognised so [`AddressSpace::query`] and
//! [`AddressSpace::dump`] can traverse the identity-mapped low gigabyte the
//! platform set up with huge pages.
//!
//! ## Seams
//!
//! Two small traits decouple the walk from the platform:
//!
//! - [`FrameAlloc`] supplies and takes back the 4 KiB frames that hold page
//!   tables (the backing buddy allocator in production, a vector of frames
//!   in tests);
//! - [`PhysMapper`] turns a physical address into a dereferencable pointer
//!   (the identity map in production, the frame vector in tests) and owns
//!   per-page TLB invalidation, since how stale translations die is as much
//!   an address-space property as how tables are reached.
//!
//! With both seams simulated the full walk, including table reclamation,
//! runs as ordinary host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address_space;
mod page_table;

pub use address_space::{AddressSpace, RemapError, UnmapError};
pub use page_table::{ENTRIES, PageTable, PageTableEntry, split_indices};

use core::sync::atomic::{AtomicU64, Ordering};
use veil_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size1G, Size4K, VirtualAddress};

/// Upper bound of the identity-mapped physical region.
///
/// The platform maps the low gigabyte 1:1 at boot; the backing allocator
/// only ever hands out memory from there, and `remap_range` asserts it.
pub const IDENTITY_MAP_LIMIT: u64 = Size1G::SIZE;

/// Source of 4 KiB physical frames for page tables.
///
/// Frames must be page-aligned. `None` means out of memory, which the shim
/// treats as fatal.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Window into physical memory, plus TLB maintenance for the address space
/// that window belongs to.
///
/// Production code runs on the unikernel's identity map, so `phys_to_mut`
/// is a cast and `invalidate_tlb` is one `INVLPG`. Tests back this with a
/// vector of frames and a no-op flush.
pub trait PhysMapper {
    /// Convert a physical address into a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current address space for the
    ///   whole lifetime `'a`.
    /// - The bytes at `pa` must be a valid `T`, and no aliasing references
    ///   may exist while the returned one lives.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Drop any cached translation for `va` on the calling CPU.
    ///
    /// Called once per page on unmap, after any table reclamation for that
    /// page, so the invalidation covers the table edits too. No cross-CPU
    /// shootdown: single-CPU deployment.
    fn invalidate_tlb(&self, va: VirtualAddress);
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }

    fn invalidate_tlb(&self, va: VirtualAddress) {
        (**self).invalidate_tlb(va);
    }
}

/// Invalidate one TLB entry via `INVLPG`.
///
/// Building block for [`PhysMapper::invalidate_tlb`] implementations on the
/// identity map.
///
/// # Safety
/// Privileged; CPL 0 only.
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    let addr = va.as_u64();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}

static CACHED_ROOT: AtomicU64 = AtomicU64::new(0);

/// Physical page of the active root table, read from CR3.
///
/// The first read is cached: this system never switches address spaces, so
/// CR3 is loaded exactly once per boot. `bypass_cache` forces a fresh read
/// for diagnostics.
///
/// # Safety
/// Reading CR3 is privileged; CPL 0 only.
#[must_use]
pub unsafe fn current_root(bypass_cache: bool) -> PhysicalPage<Size4K> {
    use veil_registers::LoadRegisterUnsafe;

    let cached = CACHED_ROOT.load(Ordering::Relaxed);
    if cached != 0 && !bypass_cache {
        return PhysicalAddress::new(cached).page::<Size4K>();
    }

    let root = unsafe { veil_registers::cr3::Cr3::load_unsafe() }.root_phys();
    CACHED_ROOT.store(root.as_u64(), Ordering::Relaxed);
    root.page::<Size4K>()
}
