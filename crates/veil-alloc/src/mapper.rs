//! Physical-memory access on the identity-mapped unikernel.

use veil_memory_addresses::{PhysicalAddress, VirtualAddress};
use veil_vmem::PhysMapper;

/// [`PhysMapper`] for a platform whose low physical memory is mapped 1:1.
///
/// `phys_to_mut` is a cast and per-page TLB invalidation is one `INVLPG`.
/// This is the production mapper; host tests substitute a simulated frame
/// arena instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Safety: caller guarantees `pa` lies in the identity-mapped region
        // and is valid for `T`; identity mapping makes the address directly
        // dereferencable.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }

    fn invalidate_tlb(&self, va: VirtualAddress) {
        // Safety: the shim runs at CPL 0 by construction.
        unsafe { veil_vmem::invlpg(va) };
    }
}
