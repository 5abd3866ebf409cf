//! The alias directory: alias address → (origin, size).
//!
//! Every live alias has exactly one record here. `free` and `realloc`
//! resolve the caller's pointer through this table, which is why the key
//! is the *exact* address handed out; an interior pointer misses, and the
//! engine turns that miss into a crash. That is the contract: you free
//! precisely what you were given.
//!
//! Records live in fixed-size nodes drawn from a pool that grows one
//! backing page at a time. The directory never allocates through the shim
//! itself; it would recurse.

use crate::rng::mix64;
use core::ptr;
use log::{debug, trace};
use veil_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, align_up};
use veil_vmem::{FrameAlloc, PhysMapper};

/// Hash buckets; power of two.
pub const BUCKET_COUNT: usize = 8192;

/// Pool growth granularity: nodes carved from one 4 KiB page.
const NODES_PER_PAGE: usize = Size4K::SIZE as usize / size_of::<AliasNode>();

#[repr(C)]
struct AliasNode {
    alias: u64,
    origin: u64,
    size: u64,
    next: *mut AliasNode,
}

/// A directory record, copied out on lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AliasRecord {
    pub origin: PhysicalAddress,
    pub alias: VirtualAddress,
    pub size: u64,
}

/// Failure registering an alias.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    /// The page-rounded range of the new alias intersects a registered
    /// one. Two live aliases must never share a page; fatal at the caller.
    #[error(
        "alias ranges overlap: new [{alias}, +{size}) against registered [{existing_alias}, +{existing_size})"
    )]
    Overlap {
        alias: VirtualAddress,
        size: u64,
        existing_alias: VirtualAddress,
        existing_size: u64,
    },
    /// The backing allocator could not supply a pool page.
    #[error("out of memory growing the alias node pool")]
    OutOfMemory,
}

/// Fixed-bucket hash table over intrusively chained nodes.
pub struct AliasDirectory {
    buckets: [*mut AliasNode; BUCKET_COUNT],
    pool: *mut AliasNode,
    live: usize,
}

// Safety: the raw node pointers are only ever touched through &mut self,
// and the engine serialises all access behind its global lock.
unsafe impl Send for AliasDirectory {}

impl AliasDirectory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buckets: [ptr::null_mut(); BUCKET_COUNT],
            pool: ptr::null_mut(),
            live: 0,
        }
    }

    /// Number of registered aliases.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Record that `alias` republishes `size` bytes of `origin`.
    ///
    /// Scans the target bucket for any record whose page-rounded range
    /// intersects the incoming one and refuses on a hit. Alias ranges are
    /// page-disjoint by construction, so an intersecting range can only
    /// mean engine state corruption.
    ///
    /// # Errors
    /// [`AliasError::Overlap`] and [`AliasError::OutOfMemory`]; both fatal
    /// at the caller.
    pub fn register<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
        origin: PhysicalAddress,
        alias: VirtualAddress,
        size: u64,
    ) -> Result<(), AliasError> {
        let key = bucket_of(alias);

        let mut cur = self.buckets[key];
        while !cur.is_null() {
            // Safety: bucket chains only hold nodes from the pool.
            let node = unsafe { &*cur };
            let new_end = align_up(alias.as_u64() + size, Size4K::SIZE);
            let old_end = align_up(node.alias + node.size, Size4K::SIZE);
            if node.alias <= new_end && alias.as_u64() <= old_end {
                return Err(AliasError::Overlap {
                    alias,
                    size,
                    existing_alias: VirtualAddress::new(node.alias),
                    existing_size: node.size,
                });
            }
            cur = node.next;
        }

        if self.pool.is_null() {
            self.grow_pool(frames, mapper)?;
        }
        let node = self.pool;
        // Safety: `node` came off the pool list; it is exclusively ours now.
        unsafe {
            self.pool = (*node).next;
            *node = AliasNode {
                alias: alias.as_u64(),
                origin: origin.as_u64(),
                size,
                next: self.buckets[key],
            };
        }
        self.buckets[key] = node;
        self.live += 1;
        trace!("alias registered: {alias} -> {origin} ({size} bytes)");
        Ok(())
    }

    /// Remove the record keyed exactly `alias`. Returns whether one existed.
    pub fn unregister(&mut self, alias: VirtualAddress) -> bool {
        let key = bucket_of(alias);

        let mut link: *mut *mut AliasNode = &mut self.buckets[key];
        // Safety: `link` always points at a live chain link of this bucket.
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).alias == alias.as_u64() {
                    *link = (*node).next;
                    *node = AliasNode {
                        alias: 0,
                        origin: 0,
                        size: 0,
                        next: self.pool,
                    };
                    self.pool = node;
                    self.live -= 1;
                    trace!("alias unregistered: {alias}");
                    return true;
                }
                link = &mut (*node).next;
            }
        }
        false
    }

    /// Exact-key lookup.
    #[must_use]
    pub fn search(&self, alias: VirtualAddress) -> Option<AliasRecord> {
        let key = bucket_of(alias);

        let mut cur = self.buckets[key];
        while !cur.is_null() {
            // Safety: bucket chains only hold nodes from the pool.
            let node = unsafe { &*cur };
            if node.alias == alias.as_u64() {
                return Some(AliasRecord {
                    origin: PhysicalAddress::new(node.origin),
                    alias,
                    size: node.size,
                });
            }
            cur = node.next;
        }
        None
    }

    /// Emit every record at `debug!` level, bucket by bucket.
    pub fn dump(&self) {
        debug!("alias directory: {} live", self.live);
        for (key, head) in self.buckets.iter().enumerate() {
            let mut cur = *head;
            if cur.is_null() {
                continue;
            }
            debug!("  [{key}]");
            while !cur.is_null() {
                // Safety: bucket chains only hold nodes from the pool.
                let node = unsafe { &*cur };
                debug!(
                    "    {{alias={:#x}, origin={:#x}, size={}}}",
                    node.alias, node.origin, node.size
                );
                cur = node.next;
            }
        }
    }

    /// Carve one backing page into pool nodes.
    fn grow_pool<F: FrameAlloc, M: PhysMapper>(
        &mut self,
        frames: &mut F,
        mapper: &M,
    ) -> Result<(), AliasError> {
        let page = frames.alloc_4k().ok_or(AliasError::OutOfMemory)?;
        trace!("alias node pool grows by {NODES_PER_PAGE} at {}", page.base());

        // Safety: a fresh backing page, exclusively ours; AliasNode is
        // plain data, so overwriting the raw bytes is fine.
        let nodes: &mut [AliasNode; NODES_PER_PAGE] = unsafe { mapper.phys_to_mut(page.base()) };
        for node in nodes.iter_mut() {
            *node = AliasNode {
                alias: 0,
                origin: 0,
                size: 0,
                next: self.pool,
            };
            self.pool = node;
        }
        Ok(())
    }
}

impl Default for AliasDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn bucket_of(alias: VirtualAddress) -> usize {
    (mix64(alias.as_u64()) % BUCKET_COUNT as u64) as usize
}
