//! The aliasing engine: the machinery behind every allocator operation.
//!
//! An allocation flows backing → reserve → remap → register and comes back
//! as an alias; a release flows search → unmap → unregister → backing.
//! The alias range itself is never recycled, so the freed pointer (and
//! every interior pointer derived from it) faults for the remainder of
//! the process.
//!
//! Everything fatal crashes here, with the typed error in the message.
//! A hardening shim that guessed its way past corrupted bookkeeping would
//! be defeating its own purpose.

use crate::alias::{AliasDirectory, AliasRecord};
use crate::backing::{BackingAllocator, TableFrames};
use crate::config::ShimConfig;
use crate::rng::{EntropySource, SplitMix64};
use crate::tail;
use crate::vma::{ReserveError, VmaManager};
use log::{info, trace};
use veil_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_down, align_up,
};
use veil_vmem::{AddressSpace, PhysMapper};

const PAGE: u64 = Size4K::SIZE;

/// The coupled alias directory, virtual-area manager and page-table
/// manipulator, behind the full allocator operation set.
///
/// One engine exists per process, owned by the global shim handle; every
/// method requires `&mut self` and relies on the caller's lock for
/// exclusivity (page-table edits and TLB invalidations cannot safely
/// interleave).
pub struct Engine<M: PhysMapper, B: BackingAllocator> {
    config: ShimConfig,
    mapper: M,
    backing: B,
    root: PhysicalPage<Size4K>,
    vmas: VmaManager,
    aliases: AliasDirectory,
    rng: SplitMix64,
}

impl<M: PhysMapper, B: BackingAllocator> Engine<M, B> {
    /// Assemble the engine and seed the alias pool with
    /// `[pool_base, pool_base + pool_span)`.
    ///
    /// # Errors
    /// [`ReserveError::OutOfMemory`] if the backing allocator cannot even
    /// supply the first bookkeeping page; fatal at the caller.
    pub fn new(
        config: ShimConfig,
        mapper: M,
        backing: B,
        root: PhysicalPage<Size4K>,
        pool_base: VirtualAddress,
        pool_span: u64,
    ) -> Result<Self, ReserveError> {
        let mut engine = Self {
            rng: SplitMix64::seeded(config.aslr_seed),
            config,
            mapper,
            backing,
            root,
            vmas: VmaManager::new(),
            aliases: AliasDirectory::new(),
        };
        let mut frames = TableFrames(&mut engine.backing);
        engine
            .vmas
            .seed(&mut frames, &engine.mapper, pool_base, pool_span)?;
        info!(
            "aliasing engine up: pool [{pool_base}, +{pool_span:#x}), guard {:?}, aslr {}, nx {}",
            engine.config.guard, engine.config.aslr, engine.config.nx
        );
        Ok(engine)
    }

    /// Republish `size` bytes of backing memory at a fresh alias and
    /// return the address to hand out.
    ///
    /// The alias preserves the origin's offset within its first page;
    /// `align` steers the page-aligned start of the mapped range.
    pub fn publish(&mut self, real: PhysicalAddress, size: u64, align: u64) -> VirtualAddress {
        debug_assert!(!real.is_null());
        debug_assert!(size > 0);

        let page_start = align_down(real.as_u64(), PAGE);
        let page_end = align_up(real.as_u64() + size, PAGE);
        let offset = real.as_u64() - page_start;
        let span = page_end - page_start;

        let guard = self.config.guard;
        let nx = self.config.nx;

        let mut frames = TableFrames(&mut self.backing);
        let rng: Option<&mut dyn EntropySource> = if self.config.aslr {
            Some(&mut self.rng)
        } else {
            None
        };
        let va = self
            .vmas
            .reserve(&mut frames, &self.mapper, span, align, guard, rng)
            .unwrap_or_else(|e| panic!("alias reservation failed: {e}"));

        let aspace = AddressSpace::from_root(&self.mapper, self.root);
        aspace
            .remap_range(&mut frames, PhysicalAddress::new(page_start), va, span, nx)
            .unwrap_or_else(|e| panic!("alias mapping failed: {e}"));

        let alias = va + offset;
        self.aliases
            .register(&mut frames, &self.mapper, real, alias, size)
            .unwrap_or_else(|e| panic!("alias bookkeeping failed: {e}"));

        if let Some(byte) = self.config.fill {
            tail::fill_phys(&self.mapper, real, size, byte);
        }
        trace!("published {real} as {alias} ({size} bytes)");
        alias
    }

    /// Resolve `alias`, tear its mappings down and retire its range.
    ///
    /// Returns the origin and recorded size, or `None` for an address
    /// that was never handed out (the caller decides how loudly to die).
    pub fn retract(&mut self, alias: VirtualAddress) -> Option<(PhysicalAddress, u64)> {
        let rec = self.aliases.search(alias)?;

        let page_start = align_down(alias.as_u64(), PAGE);
        let page_end = align_up(alias.as_u64() + rec.size, PAGE);
        let span = page_end - page_start;
        let reserved = self.config.guard.reserved_bytes(span);

        let mut frames = TableFrames(&mut self.backing);
        let aspace = AddressSpace::from_root(&self.mapper, self.root);
        aspace
            .unmap_range(&mut frames, VirtualAddress::new(page_start), span)
            .unwrap_or_else(|e| panic!("alias teardown failed: {e}"));

        let removed = self.aliases.unregister(alias);
        debug_assert!(removed, "record vanished between search and unregister");

        self.vmas
            .retire(
                &mut frames,
                &self.mapper,
                VirtualAddress::new(page_start),
                reserved,
            )
            .unwrap_or_else(|e| panic!("retirement bookkeeping failed: {e}"));

        trace!("retracted {alias} [origin {}, {} bytes]", rec.origin, rec.size);
        Some((rec.origin, rec.size))
    }

    /// Origin behind a live alias; crashes on an unknown address.
    #[must_use]
    pub fn origin_of(&self, alias: VirtualAddress) -> PhysicalAddress {
        self.aliases
            .search(alias)
            .map_or_else(|| panic!("unknown alias {alias}"), |rec| rec.origin)
    }

    /// Directory record behind a live alias, if any.
    #[must_use]
    pub fn lookup(&self, alias: VirtualAddress) -> Option<AliasRecord> {
        self.aliases.search(alias)
    }

    pub fn malloc(&mut self, size: u64) -> VirtualAddress {
        assert!(size > 0, "zero-size allocation");
        if self.config.passthrough {
            let real = self
                .backing
                .malloc(size)
                .unwrap_or_else(|| oom("malloc", size));
            return VirtualAddress::new(real.as_u64());
        }

        let real = if self.config.tail_frontend {
            tail::malloc(&mut self.backing, size)
        } else {
            self.backing.malloc(size)
        }
        .unwrap_or_else(|| oom("malloc", size));

        let alias = self.publish(real, size, PAGE);
        trace!("malloc(size={size}) => {alias} [real={real}]");
        alias
    }

    pub fn calloc(&mut self, nmemb: u64, size: u64) -> VirtualAddress {
        let bytes = nmemb
            .checked_mul(size)
            .unwrap_or_else(|| panic!("calloc element count overflows: {nmemb} x {size}"));
        assert!(bytes > 0, "zero-size allocation");
        if self.config.passthrough {
            let real = self
                .backing
                .calloc(nmemb, size)
                .unwrap_or_else(|| oom("calloc", bytes));
            return VirtualAddress::new(real.as_u64());
        }

        let real = if self.config.tail_frontend {
            tail::calloc(&mut self.backing, &self.mapper, nmemb, size)
        } else {
            self.backing.calloc(nmemb, size)
        }
        .unwrap_or_else(|| oom("calloc", bytes));

        let alias = self.publish(real, bytes, PAGE);
        trace!("calloc(nmemb={nmemb}, size={size}) => {alias} [real={real}]");
        alias
    }

    pub fn memalign(&mut self, align: u64, size: u64) -> VirtualAddress {
        assert!(size > 0, "zero-size allocation");
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if self.config.passthrough {
            let real = self
                .backing
                .memalign(align, size)
                .unwrap_or_else(|| oom("memalign", size));
            return VirtualAddress::new(real.as_u64());
        }

        let real = if self.config.tail_frontend {
            tail::memalign(&mut self.backing, align, size)
        } else {
            self.backing.memalign(align, size)
        }
        .unwrap_or_else(|| oom("memalign", size));

        let alias = self.publish(real, size, align_up(align, PAGE));
        trace!("memalign(align={align}, size={size}) => {alias} [real={real}]");
        alias
    }

    /// `posix_memalign` contract: the size must strictly exceed the
    /// alignment. The C surface returns zero on success; failure paths
    /// here are all fatal, so the alias is returned directly.
    pub fn posix_memalign(&mut self, align: u64, size: u64) -> VirtualAddress {
        assert!(size > 0, "zero-size allocation");
        assert!(size > align, "size must exceed the alignment");
        self.memalign(align, size)
    }

    pub fn realloc(&mut self, ptr: VirtualAddress, size: u64) -> VirtualAddress {
        if ptr.is_null() {
            let alias = self.malloc(size);
            trace!("realloc(ptr=NULL, size={size}) => {alias}");
            return alias;
        }
        if self.config.passthrough {
            let real = self
                .backing
                .realloc(PhysicalAddress::new(ptr.as_u64()), size)
                .unwrap_or_else(|| oom("realloc", size));
            return VirtualAddress::new(real.as_u64());
        }
        assert!(size > 0, "zero-size allocation");

        let (old_real, old_size) = self.retract(ptr).unwrap_or_else(|| invalid_free(ptr));
        let new_real = if self.config.tail_frontend {
            tail::realloc(&mut self.backing, &self.mapper, old_real, old_size, size)
        } else {
            self.backing.realloc(old_real, size)
        }
        .unwrap_or_else(|| oom("realloc", size));

        let alias = self.publish(new_real, size, PAGE);
        trace!("realloc(ptr={ptr}, size={size}) => {alias} [old={old_real}, new={new_real}]");
        alias
    }

    pub fn free(&mut self, ptr: VirtualAddress) {
        if ptr.is_null() {
            trace!("free(ptr=NULL)");
            return;
        }
        if self.config.passthrough {
            self.backing.free(PhysicalAddress::new(ptr.as_u64()));
            return;
        }

        let (real, size) = self.retract(ptr).unwrap_or_else(|| invalid_free(ptr));
        if self.config.tail_frontend {
            tail::free(&mut self.backing, real, size);
        } else {
            self.backing.free(real);
        }
        trace!("free(ptr={ptr}) [real={real}, size={size}]");
    }

    pub fn palloc(&mut self, order: usize) -> VirtualAddress {
        let bytes = PAGE << order;
        let real = self
            .backing
            .palloc(order)
            .unwrap_or_else(|| oom("palloc", bytes));
        if self.config.passthrough {
            return VirtualAddress::new(real.as_u64());
        }

        let alias = self.publish(real, bytes, bytes);
        trace!("palloc(order={order}) => {alias} [real={real}]");
        alias
    }

    pub fn pfree(&mut self, ptr: VirtualAddress, order: usize) {
        if self.config.passthrough {
            self.backing.pfree(PhysicalAddress::new(ptr.as_u64()), order);
            return;
        }

        let (real, size) = self.retract(ptr).unwrap_or_else(|| invalid_free(ptr));
        debug_assert_eq!(size, PAGE << order, "order does not match the published block");
        if let Some(byte) = self.config.fill {
            // Scrub before the pages go back into circulation.
            tail::fill_phys(&self.mapper, real, size, byte);
        }
        self.backing.pfree(real, order);
        trace!("pfree(ptr={ptr}, order={order}) [real={real}]");
    }

    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.backing.available_bytes()
    }

    pub fn add_memory(&mut self, base: PhysicalAddress, size: u64) -> bool {
        let accepted = self.backing.add_memory(base, size);
        trace!("add_memory(base={base}, size={size:#x}) => {accepted}");
        accepted
    }

    /// The live address space this engine edits.
    #[must_use]
    pub fn address_space(&self) -> AddressSpace<'_, M> {
        AddressSpace::from_root(&self.mapper, self.root)
    }

    #[must_use]
    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Number of live aliases.
    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Diagnostics: every directory record at `debug!` level.
    pub fn dump_aliases(&self) {
        self.aliases.dump();
    }

    /// Diagnostics: the free and retired address-space lists.
    pub fn dump_pool(&self) {
        self.vmas.dump();
    }

    /// Diagnostics: the full mapping tree.
    pub fn dump_page_tables(&self, skip_identity_gib: bool) {
        self.address_space().dump(skip_identity_gib);
    }
}

fn oom(op: &str, bytes: u64) -> ! {
    panic!("backing allocator out of memory ({op}, {bytes} bytes)")
}

fn invalid_free(ptr: VirtualAddress) -> ! {
    panic!("invalid free at {ptr}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardPolicy;
    use crate::testing::{TestBacking, TestPhys};
    use std::collections::HashSet;
    use veil_vmem::{PageTable, split_indices};

    const POOL: u64 = 0x0400_0000_0000; // 4 TiB

    fn with_engine<R>(
        config: ShimConfig,
        frames: usize,
        pool_span: u64,
        f: impl FnOnce(&TestPhys, &mut Engine<&TestPhys, TestBacking>) -> R,
    ) -> R {
        let phys = TestPhys::with_frames(frames);
        let mut backing = TestBacking::new(0, frames as u64 * PAGE);
        let root = backing.palloc(0).unwrap().page::<Size4K>();
        unsafe {
            *phys.phys_to_mut::<PageTable>(root.base()) = PageTable::zeroed();
        }
        let mut engine = Engine::new(
            config,
            &phys,
            backing,
            root,
            VirtualAddress::new(POOL),
            pool_span,
        )
        .unwrap();
        f(&phys, &mut engine)
    }

    #[test]
    fn publish_takes_the_lowest_slot_and_installs_one_leaf() {
        with_engine(ShimConfig::aliasing_only(), 64, 4 << 40, |_, e| {
            let alias = e.publish(PhysicalAddress::new(0x10000), 30, PAGE);
            assert_eq!(alias.as_u64(), POOL);

            assert_eq!(
                e.lookup(alias),
                Some(AliasRecord {
                    origin: PhysicalAddress::new(0x10000),
                    alias,
                    size: 30
                })
            );

            let aspace = e.address_space();
            assert_eq!(aspace.query(alias), Some(PhysicalAddress::new(0x10000)));
            assert_eq!(aspace.query(alias + 29), Some(PhysicalAddress::new(0x10000 + 29)));
            assert_eq!(aspace.query(alias + PAGE), None);
        });
    }

    #[test]
    fn publish_preserves_the_in_page_offset() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let real = PhysicalAddress::new(0x10_0000 + 0x123);
            let alias = e.publish(real, 200, PAGE);
            assert_eq!(alias.offset_in::<Size4K>(), 0x123);
            assert_eq!(e.address_space().query(alias), Some(real));
        });
    }

    #[test]
    fn guard_policies_space_reservations_apart() {
        for (guard, pages_apart) in [
            (GuardPolicy::None, 2u64),
            (GuardPolicy::Trailing, 3),
            (GuardPolicy::Quarantine, 5),
        ] {
            let mut config = ShimConfig::aliasing_only();
            config.guard = guard;
            with_engine(config, 128, 1 << 30, |_, e| {
                let a = e.publish(PhysicalAddress::new(0x10_0000), 5000, PAGE);
                let b = e.publish(PhysicalAddress::new(0x20_0000), 5000, PAGE);
                assert_eq!(
                    b.as_u64() - a.as_u64(),
                    pages_apart * PAGE,
                    "guard {guard:?}"
                );
            });
        }
    }

    #[test]
    fn free_tears_the_alias_down_for_good() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.malloc(40);
            assert_eq!(e.lookup(p).unwrap().size, 40);
            assert!(e.address_space().query(p).is_some());

            e.free(p);
            assert_eq!(e.lookup(p), None);
            assert_eq!(e.address_space().query(p), None);
            assert_eq!(e.alias_count(), 0);
        });
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn double_free_crashes() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.malloc(40);
            e.free(p);
            e.free(p);
        });
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn interior_pointer_free_crashes() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.malloc(40);
            e.free(p + 8);
        });
    }

    #[test]
    fn null_free_is_a_no_op() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            e.free(VirtualAddress::zero());
            assert_eq!(e.alias_count(), 0);
        });
    }

    #[test]
    #[should_panic(expected = "size must exceed the alignment")]
    fn posix_memalign_rejects_size_not_above_align() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let _ = e.posix_memalign(4096, 3);
        });
    }

    #[test]
    fn posix_memalign_aligns_the_alias() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.posix_memalign(8192, 10000);
            assert_eq!(p.as_u64() % 8192, 0);
            assert_eq!(e.lookup(p).unwrap().size, 10000);
        });
    }

    #[test]
    fn realloc_moves_to_a_fresh_alias_and_kills_the_old() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.malloc(100);
            let q = e.realloc(p, 200);

            assert_eq!(e.lookup(p), None);
            assert_eq!(e.address_space().query(p), None);
            assert_eq!(e.lookup(q).unwrap().size, 200);
        });
    }

    #[test]
    fn realloc_of_null_allocates() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.realloc(VirtualAddress::zero(), 64);
            assert_eq!(e.lookup(p).unwrap().size, 64);
        });
    }

    #[test]
    fn same_size_realloc_returns_a_usable_alias() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.malloc(128);
            let q = e.realloc(p, 128);
            assert_eq!(e.lookup(q).unwrap().size, 128);
            assert!(e.address_space().query(q).is_some());
            e.free(q);
        });
    }

    #[test]
    fn alloc_free_round_trip_restores_the_backing_ledger() {
        with_engine(ShimConfig::aliasing_only(), 256, 1 << 30, |_, e| {
            // Two warm-up cycles let the node pools and the PDPT settle.
            for _ in 0..2 {
                let p = e.malloc(3 * PAGE + 5);
                e.free(p);
            }
            let snapshot = e.backing().snapshot();

            let p = e.malloc(3 * PAGE + 5);
            e.free(p);
            assert_eq!(e.backing().snapshot(), snapshot);

            let p = e.posix_memalign(8192, 12345);
            e.free(p);
            assert_eq!(e.backing().snapshot(), snapshot);
        });
    }

    #[test]
    fn live_aliases_never_share_a_page() {
        with_engine(ShimConfig::aliasing_only(), 256, 1 << 30, |_, e| {
            let mut pages = HashSet::new();
            let mut ptrs = Vec::new();
            for n in 0..32u64 {
                ptrs.push(e.malloc(40 + n * 100));
            }
            for p in &ptrs {
                let rec = e.lookup(*p).unwrap();
                let first = align_down(rec.alias.as_u64(), PAGE);
                let last = align_down(rec.alias.as_u64() + rec.size - 1, PAGE);
                let mut page = first;
                while page <= last {
                    assert!(pages.insert(page), "page {page:#x} shared");
                    page += PAGE;
                }
            }
        });
    }

    #[test]
    fn init_fill_paints_published_memory() {
        let mut config = ShimConfig::aliasing_only();
        config.fill = Some(0xA5);
        with_engine(config, 64, 1 << 30, |phys, e| {
            let p = e.malloc(100);
            let origin = e.origin_of(p);
            for n in 0..100 {
                assert_eq!(phys.read_byte(origin + n), 0xA5);
            }
        });
    }

    #[test]
    fn nx_config_marks_leaves_non_executable() {
        for nx in [false, true] {
            let mut config = ShimConfig::aliasing_only();
            config.nx = nx;
            with_engine(config, 64, 1 << 30, |phys, e| {
                let p = e.malloc(40);
                let (i4, i3, i2, i1) = split_indices(p);
                let root = e.address_space().root_page();

                let pml4: &PageTable = unsafe { phys.phys_to_mut(root.base()) };
                let pdpt: &PageTable =
                    unsafe { phys.phys_to_mut(pml4.get(i4).next_table().unwrap().base()) };
                let pd: &PageTable =
                    unsafe { phys.phys_to_mut(pdpt.get(i3).next_table().unwrap().base()) };
                let pt: &PageTable =
                    unsafe { phys.phys_to_mut(pd.get(i2).next_table().unwrap().base()) };
                assert_eq!(pt.get(i1).no_execute(), nx);
            });
        }
    }

    #[test]
    fn passthrough_forwards_untouched() {
        let mut config = ShimConfig::aliasing_only();
        config.passthrough = true;
        with_engine(config, 64, 1 << 30, |_, e| {
            let baseline = e.backing().outstanding();
            let p = e.malloc(40);
            // Identity: the "alias" is the backing address itself.
            assert!(p.as_u64() < 64 * PAGE);
            assert_eq!(e.lookup(p), None);
            assert_eq!(e.backing().outstanding(), baseline + 1);
            e.free(p);
            assert_eq!(e.backing().outstanding(), baseline);
        });
    }

    #[test]
    fn tail_frontend_places_payloads_at_the_page_end() {
        let mut config = ShimConfig::aliasing_only();
        config.tail_frontend = true;
        with_engine(config, 64, 1 << 30, |_, e| {
            let p = e.malloc(40);
            assert_eq!(p.offset_in::<Size4K>(), PAGE - 40);
            assert_eq!(e.origin_of(p).offset_in::<Size4K>(), PAGE - 40);
            e.free(p);

            let p = e.posix_memalign(64, 100);
            assert_eq!(p.offset_in::<Size4K>(), PAGE - align_up(100, 64));
            e.free(p);
        });
    }

    #[test]
    fn tail_frontend_realloc_preserves_contents() {
        let mut config = ShimConfig::aliasing_only();
        config.tail_frontend = true;
        with_engine(config, 128, 1 << 30, |phys, e| {
            let p = e.malloc(300);
            let origin = e.origin_of(p);
            for n in 0..300 {
                unsafe {
                    *phys.phys_to_mut::<u8>(origin + n) = (n % 251) as u8;
                }
            }

            let q = e.realloc(p, 5000);
            let moved = e.origin_of(q);
            for n in 0..300 {
                assert_eq!(phys.read_byte(moved + n), (n % 251) as u8);
            }
        });
    }

    #[test]
    fn palloc_aliases_whole_blocks() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.palloc(2);
            assert_eq!(p.as_u64() % (4 * PAGE), 0);
            for n in 0..4 {
                assert!(e.address_space().query(p + n * PAGE).is_some());
            }

            e.pfree(p, 2);
            assert_eq!(e.lookup(p), None);
            assert_eq!(e.address_space().query(p), None);
        });
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn pfree_of_unknown_block_crashes() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            e.pfree(VirtualAddress::new(POOL + 0x1000), 0);
        });
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn calloc_count_overflow_crashes() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let _ = e.calloc(u64::MAX, 16);
        });
    }

    #[test]
    #[should_panic(expected = "unknown alias")]
    fn origin_of_unknown_alias_crashes() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let _ = e.origin_of(VirtualAddress::new(POOL));
        });
    }

    #[test]
    fn available_bytes_reports_the_backing_allocator() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let before = e.available_bytes();
            let p = e.malloc(PAGE);
            assert!(e.available_bytes() < before);
            e.free(p);
        });
    }

    #[test]
    fn random_placement_spreads_across_the_pool() {
        let mut config = ShimConfig::aliasing_only();
        config.aslr = true;
        config.aslr_seed = 1;
        with_engine(config, 16384, 4 << 30, |_, e| {
            let mut mid_bits = HashSet::new();
            for _ in 0..10_000 {
                let p = e.malloc(40);
                mid_bits.insert((p.as_u64() >> 12) & 0x3FF);
            }
            // Weak uniformity: bits [21:12] must take many distinct values.
            assert!(mid_bits.len() >= 10, "only {} distinct values", mid_bits.len());
        });
    }

    #[test]
    fn diagnostics_walk_without_panicking() {
        with_engine(ShimConfig::aliasing_only(), 64, 1 << 30, |_, e| {
            let p = e.malloc(123);
            e.dump_aliases();
            e.dump_pool();
            e.dump_page_tables(true);
            e.free(p);
        });
    }
}
