//! The virtual-area manager: carving one-shot reservations out of the
//! alias pool.
//!
//! The pool is a span of reserved virtual address space far above anything
//! the platform maps. `free` regions sit on an address-ordered list and
//! every reservation is carved out of the first (or a randomly chosen)
//! region that admits it. Nothing ever returns to `free`: a freed alias's
//! range moves to the `gc` list and stays there, which is the whole point:
//! a retired range that can never be re-issued is a use-after-free trap
//! forever.
//!
//! Region nodes come from a page-at-a-time pool, like alias records, so
//! managing address space never calls back into the allocator being
//! shimmed.

use crate::config::GuardPolicy;
use crate::rng::EntropySource;
use core::ptr;
use log::{debug, trace};
use veil_memory_addresses::{PageSize, Size4K, VirtualAddress, align_down, align_up};
use veil_vmem::{FrameAlloc, PhysMapper};

const PAGE: u64 = Size4K::SIZE;

/// Pool growth granularity: nodes carved from one 4 KiB page.
const NODES_PER_PAGE: usize = Size4K::SIZE as usize / size_of::<VmaRegion>();

#[repr(C)]
struct VmaRegion {
    addr: u64,
    size: u64,
    next: *mut VmaRegion,
}

/// Failure carving a reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    /// No free region admits the request. The pool is sized in terabytes;
    /// running dry means the deployment outlived its address budget.
    /// Fatal at the caller.
    #[error("no virtual region fits {size:#x} bytes aligned to {align:#x}")]
    Exhausted { size: u64, align: u64 },
    /// The backing allocator could not supply a node-pool page.
    #[error("out of memory growing the region node pool")]
    OutOfMemory,
}

/// Address-ordered free list plus the write-only `gc` list.
pub struct VmaManager {
    free: *mut VmaRegion,
    gc: *mut VmaRegion,
    pool: *mut VmaRegion,
}

// Safety: raw node pointers are only touched through &mut self; the engine
// serialises all access behind its global lock.
unsafe impl Send for VmaManager {}

impl VmaManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free: ptr::null_mut(),
            gc: ptr::null_mut(),
            pool: ptr::null_mut(),
        }
    }

    /// Add `[base, base + span)` to the free pool.
    ///
    /// # Errors
    /// [`ReserveError::OutOfMemory`] when no node page can be drawn.
    pub fn seed<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        base: VirtualAddress,
        span: u64,
    ) -> Result<(), ReserveError> {
        debug_assert_eq!(base.offset_in::<Size4K>(), 0);
        debug_assert!(span > 0 && span % PAGE == 0);

        let node = self.take_node(frames, mapper)?;
        // Safety: `node` is exclusively ours until linked; the walk below
        // only follows live free-list links.
        unsafe {
            (*node).addr = base.as_u64();
            (*node).size = span;

            let mut link: *mut *mut VmaRegion = &mut self.free;
            while !(*link).is_null() && (**link).addr < base.as_u64() {
                link = &mut (**link).next;
            }
            (*node).next = *link;
            *link = node;
        }
        debug!("virtual pool seeded: [{base}, +{span:#x})");
        Ok(())
    }

    /// Carve a reservation for a `span`-byte mapping.
    ///
    /// The reserved footprint is `guard.reserved_bytes(span)`: the mapped
    /// span plus any trailing guard space. First fit at the lowest aligned
    /// slot, or, when `rng` is given, a uniformly random aligned slot
    /// within the first region that admits the request.
    ///
    /// The front and tail remainders of the chosen region return to the
    /// free list; the reservation itself leaves the manager for good.
    ///
    /// # Errors
    /// [`ReserveError::Exhausted`] and [`ReserveError::OutOfMemory`]; both
    /// fatal at the caller.
    pub fn reserve<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        span: u64,
        align: u64,
        guard: GuardPolicy,
        mut rng: Option<&mut dyn EntropySource>,
    ) -> Result<VirtualAddress, ReserveError> {
        debug_assert!(align.is_power_of_two() && align % PAGE == 0);
        debug_assert!(span > 0 && span % PAGE == 0);
        let reserved = guard.reserved_bytes(span);

        let mut link: *mut *mut VmaRegion = &mut self.free;
        // Safety: `link` always points at a live chain link; nodes are only
        // unlinked through it.
        unsafe {
            while !(*link).is_null() {
                let node = *link;

                // Under a guard policy a single-page region can never serve
                // another request; drop it instead of re-walking it forever.
                if guard != GuardPolicy::None && (*node).size <= PAGE {
                    *link = (*node).next;
                    self.release_node(node);
                    continue;
                }

                if (*node).size < reserved {
                    link = &mut (*node).next;
                    continue;
                }

                let region_end = (*node).addr + (*node).size;
                let start = if let Some(rng) = rng.as_mut() {
                    let first = align_up((*node).addr, align);
                    let last = align_down(region_end - reserved, align);
                    if last < first {
                        link = &mut (*node).next;
                        continue;
                    }
                    let slots = (last - first) / align + 1;
                    first + (rng.next_u64() % slots) * align
                } else {
                    align_up((*node).addr, align)
                };
                if start + reserved > region_end {
                    link = &mut (*node).next;
                    continue;
                }

                // Cut the front remainder off; the chosen part becomes a
                // node of its own.
                let mut chosen = node;
                if start != (*node).addr {
                    chosen = self.split(frames, mapper, node, start)?;
                    link = &mut (*node).next;
                }
                // Cut the tail remainder off.
                if (*chosen).size > reserved {
                    self.split(frames, mapper, chosen, start + reserved)?;
                }
                debug_assert_eq!((*chosen).addr, start);
                debug_assert_eq!((*chosen).size, reserved);

                *link = (*chosen).next;
                self.release_node(chosen);
                trace!("reserved [{start:#x}, +{reserved:#x}) align {align:#x}");
                return Ok(VirtualAddress::new(start));
            }
        }
        Err(ReserveError::Exhausted {
            size: reserved,
            align,
        })
    }

    /// Record a spent reservation on the `gc` list.
    ///
    /// Nothing reads the list back; a retired range is permanently
    /// faulting. It exists so diagnostics can see where the address space
    /// went, and as the hook for a future address-space recycler.
    ///
    /// # Errors
    /// [`ReserveError::OutOfMemory`] when no node can be drawn.
    pub fn retire<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        base: VirtualAddress,
        span: u64,
    ) -> Result<(), ReserveError> {
        let node = self.take_node(frames, mapper)?;
        // Safety: `node` is exclusively ours.
        unsafe {
            (*node).addr = base.as_u64();
            (*node).size = span;
            (*node).next = self.gc;
        }
        self.gc = node;
        trace!("retired [{base}, +{span:#x})");
        Ok(())
    }

    /// Emit both lists at `debug!` level.
    pub fn dump(&self) {
        debug!("virtual pool:");
        let mut cur = self.free;
        while !cur.is_null() {
            // Safety: free-list links only hold live nodes.
            let r = unsafe { &*cur };
            debug!("  free [{:#x}, +{:#x})", r.addr, r.size);
            cur = r.next;
        }
        let mut cur = self.gc;
        while !cur.is_null() {
            // Safety: gc-list links only hold live nodes.
            let r = unsafe { &*cur };
            debug!("  gc   [{:#x}, +{:#x})", r.addr, r.size);
            cur = r.next;
        }
    }

    /// Split `[addr, end)` at `at`: the node keeps `[addr, at)`, a new node
    /// takes `[at, end)` and is linked right behind it. Returns the new
    /// node.
    unsafe fn split<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        node: *mut VmaRegion,
        at: u64,
    ) -> Result<*mut VmaRegion, ReserveError> {
        let new = self.take_node(frames, mapper)?;
        // Safety: both nodes are live and distinct; caller holds &mut self.
        unsafe {
            debug_assert!(at > (*node).addr && at < (*node).addr + (*node).size);
            (*new).addr = at;
            (*new).size = (*node).addr + (*node).size - at;
            (*new).next = (*node).next;
            (*node).size = at - (*node).addr;
            (*node).next = new;
        }
        Ok(new)
    }

    /// Merge `b` into `a`. `b` must directly follow `a` in the list and in
    /// the address space. Counterpart of [`split`](Self::split); no
    /// production path coalesces, the primitive exists for address-space
    /// recycling.
    unsafe fn join(&mut self, a: *mut VmaRegion, b: *mut VmaRegion) -> *mut VmaRegion {
        // Safety: caller guarantees adjacency in list and address space.
        unsafe {
            debug_assert_eq!((*a).next, b);
            debug_assert_eq!((*a).addr + (*a).size, (*b).addr);
            (*a).size += (*b).size;
            (*a).next = (*b).next;
        }
        self.release_node(b);
        a
    }

    fn take_node<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
    ) -> Result<*mut VmaRegion, ReserveError> {
        if self.pool.is_null() {
            let page = frames.alloc_4k().ok_or(ReserveError::OutOfMemory)?;
            trace!("region node pool grows by {NODES_PER_PAGE} at {}", page.base());

            // Safety: a fresh backing page, exclusively ours; VmaRegion is
            // plain data, so overwriting the raw bytes is fine.
            let nodes: &mut [VmaRegion; NODES_PER_PAGE] =
                unsafe { mapper.phys_to_mut(page.base()) };
            for node in nodes.iter_mut() {
                node.addr = 0;
                node.size = 0;
                node.next = self.pool;
                self.pool = node;
            }
        }
        let node = self.pool;
        // Safety: `node` came off the pool list; exclusively ours now.
        unsafe {
            self.pool = (*node).next;
            (*node).next = ptr::null_mut();
        }
        Ok(node)
    }

    fn release_node(&mut self, node: *mut VmaRegion) {
        // Safety: `node` was unlinked by the caller; exclusively ours.
        unsafe {
            *node = VmaRegion {
                addr: 0,
                size: 0,
                next: self.pool,
            };
        }
        self.pool = node;
    }

    #[cfg(test)]
    fn free_regions(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cur = self.free;
        while !cur.is_null() {
            let r = unsafe { &*cur };
            out.push((r.addr, r.size));
            cur = r.next;
        }
        out
    }

    #[cfg(test)]
    fn gc_regions(&self) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cur = self.gc;
        while !cur.is_null() {
            let r = unsafe { &*cur };
            out.push((r.addr, r.size));
            cur = r.next;
        }
        out
    }
}

impl Default for VmaManager {
    fn default() -> Self {
        Self::new()
    }
}
