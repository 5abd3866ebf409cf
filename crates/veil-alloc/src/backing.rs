//! Contract with the backing page allocator.
//!
//! The shim sits on top of whatever allocator the platform registered
//! before it (a binary buddy in the reference deployment). Everything the
//! engine needs from it is this trait; the engine never allocates for
//! itself any other way, which is what keeps the shim out of its own
//! call path.

use veil_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use veil_vmem::FrameAlloc;

/// The allocator underneath the shim.
///
/// All returned memory must be identity-mapped physical memory in the low
/// gigabyte; `remap_range` asserts it. `None` means out of memory, which
/// the engine treats as fatal.
pub trait BackingAllocator {
    fn malloc(&mut self, size: u64) -> Option<PhysicalAddress>;
    /// Zeroed allocation of `nmemb * size` bytes.
    fn calloc(&mut self, nmemb: u64, size: u64) -> Option<PhysicalAddress>;
    fn memalign(&mut self, align: u64, size: u64) -> Option<PhysicalAddress>;
    fn realloc(&mut self, ptr: PhysicalAddress, new_size: u64) -> Option<PhysicalAddress>;
    fn free(&mut self, ptr: PhysicalAddress);
    /// `2^order` contiguous pages, naturally aligned to the block size.
    fn palloc(&mut self, order: usize) -> Option<PhysicalAddress>;
    fn pfree(&mut self, ptr: PhysicalAddress, order: usize);
    fn available_bytes(&self) -> u64;
    /// Hand a further region to the allocator. Returns false if rejected.
    fn add_memory(&mut self, base: PhysicalAddress, size: u64) -> bool;
}

impl<T: BackingAllocator + ?Sized> BackingAllocator for &mut T {
    fn malloc(&mut self, size: u64) -> Option<PhysicalAddress> {
        (**self).malloc(size)
    }

    fn calloc(&mut self, nmemb: u64, size: u64) -> Option<PhysicalAddress> {
        (**self).calloc(nmemb, size)
    }

    fn memalign(&mut self, align: u64, size: u64) -> Option<PhysicalAddress> {
        (**self).memalign(align, size)
    }

    fn realloc(&mut self, ptr: PhysicalAddress, new_size: u64) -> Option<PhysicalAddress> {
        (**self).realloc(ptr, new_size)
    }

    fn free(&mut self, ptr: PhysicalAddress) {
        (**self).free(ptr);
    }

    fn palloc(&mut self, order: usize) -> Option<PhysicalAddress> {
        (**self).palloc(order)
    }

    fn pfree(&mut self, ptr: PhysicalAddress, order: usize) {
        (**self).pfree(ptr, order);
    }

    fn available_bytes(&self) -> u64 {
        (**self).available_bytes()
    }

    fn add_memory(&mut self, base: PhysicalAddress, size: u64) -> bool {
        (**self).add_memory(base, size)
    }
}

/// View of a backing allocator as a page-table frame source.
///
/// Page tables, alias-directory entry pages and VMA node pages are all
/// single pages drawn straight from the backing allocator, never from the
/// shim, which may be mid-operation when the need arises.
pub struct TableFrames<'a, B: BackingAllocator + ?Sized>(pub &'a mut B);

impl<B: BackingAllocator + ?Sized> FrameAlloc for TableFrames<'_, B> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.0.palloc(0).map(|pa| pa.page::<Size4K>())
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.0.pfree(page.base(), 0);
    }
}
