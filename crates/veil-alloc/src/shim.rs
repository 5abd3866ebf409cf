//! Process-global installation of the aliasing engine.
//!
//! The shim replaces the platform's default allocator: the embedder boots
//! its backing allocator (the binary buddy), then calls [`init`] exactly
//! once, and from there on routes the allocator operation set through the
//! free functions in this module. Every entry point takes the one global
//! spin lock for its full duration; page-table edits and their TLB
//! invalidations must never interleave, and the single coarse mutex is the
//! whole concurrency story of a single-CPU unikernel.

use crate::backing::BackingAllocator;
use crate::config::ShimConfig;
use crate::engine::Engine;
use crate::mapper::IdentityPhysMapper;
use log::{debug, info};
use veil_memory_addresses::{PhysicalAddress, VirtualAddress};
use veil_sync::{InitCell, SpinLock};

/// The engine as installed in production: identity-mapped physical access
/// over whatever backing allocator the platform registered.
pub type InstalledEngine = Engine<IdentityPhysMapper, &'static mut (dyn BackingAllocator + Send)>;

static SHIM: InitCell<SpinLock<InstalledEngine>> = InitCell::new();

/// Boot the shim and make it the process allocator.
///
/// Writes `EFER.NXE` when the configuration asks for NX, reads the live
/// CR3 root, seeds the alias pool with `[pool_base, pool_base + pool_span)`
/// and publishes the engine. Must run after the backing allocator is
/// operational and before the first allocation is served.
///
/// # Panics
/// On double initialisation, or when the backing allocator cannot supply
/// the first bookkeeping page.
///
/// # Safety
/// - CPL 0 with paging enabled; CR3 must hold the live root table.
/// - The low gigabyte of physical memory must be identity-mapped, and all
///   memory the backing allocator serves must come from it.
/// - `pool_base`/`pool_span` must describe virtual address space nothing
///   else will ever map.
pub unsafe fn init(
    config: ShimConfig,
    backing: &'static mut (dyn BackingAllocator + Send),
    pool_base: VirtualAddress,
    pool_span: u64,
) {
    assert!(SHIM.get().is_none(), "aliasing shim installed twice");

    if config.nx {
        use veil_registers::efer::Efer;
        use veil_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
        // Arm bit 63 of page-table entries before any leaf carries it.
        let efer = unsafe { Efer::load_unsafe() };
        unsafe { efer.with_nxe(true).store_unsafe() };
        info!("EFER.NXE enabled");
    }

    {
        use veil_registers::{LoadRegisterUnsafe, cr4::Cr4};
        let cr4 = unsafe { Cr4::load_unsafe() };
        debug!(
            "paging state: pae={} pge={} la57={} smep={} smap={}",
            cr4.pae(),
            cr4.pge(),
            cr4.la57(),
            cr4.smep(),
            cr4.smap()
        );
        assert!(!cr4.la57(), "five-level paging is not supported");
    }

    let root = unsafe { veil_vmem::current_root(false) };
    let engine = Engine::new(
        config,
        IdentityPhysMapper,
        backing,
        root,
        pool_base,
        pool_span,
    )
    .unwrap_or_else(|e| panic!("shim bootstrap failed: {e}"));

    SHIM.set_or_init(|| SpinLock::new(engine));
    info!("aliasing shim installed as the default allocator");
}

fn engine() -> &'static SpinLock<InstalledEngine> {
    SHIM.get().expect("aliasing shim not initialised")
}

pub fn malloc(size: u64) -> VirtualAddress {
    engine().with_lock(|e| e.malloc(size))
}

pub fn calloc(nmemb: u64, size: u64) -> VirtualAddress {
    engine().with_lock(|e| e.calloc(nmemb, size))
}

pub fn memalign(align: u64, size: u64) -> VirtualAddress {
    engine().with_lock(|e| e.memalign(align, size))
}

pub fn posix_memalign(align: u64, size: u64) -> VirtualAddress {
    engine().with_lock(|e| e.posix_memalign(align, size))
}

pub fn realloc(ptr: VirtualAddress, size: u64) -> VirtualAddress {
    engine().with_lock(|e| e.realloc(ptr, size))
}

pub fn free(ptr: VirtualAddress) {
    engine().with_lock(|e| e.free(ptr));
}

pub fn palloc(order: usize) -> VirtualAddress {
    engine().with_lock(|e| e.palloc(order))
}

pub fn pfree(ptr: VirtualAddress, order: usize) {
    engine().with_lock(|e| e.pfree(ptr, order));
}

#[must_use]
pub fn available_bytes() -> u64 {
    engine().with_lock(|e| e.available_bytes())
}

pub fn add_memory(base: PhysicalAddress, size: u64) -> bool {
    engine().with_lock(|e| e.add_memory(base, size))
}

/// Resolve a live alias to its origin without touching it.
#[must_use]
pub fn origin_of(alias: VirtualAddress) -> PhysicalAddress {
    engine().with_lock(|e| e.origin_of(alias))
}

/// Diagnostics: directory, pool and mapping tree at `debug!` level.
pub fn dump(skip_identity_gib: bool) {
    engine().with_lock(|e| {
        e.dump_aliases();
        e.dump_pool();
        e.dump_page_tables(skip_identity_gib);
    });
}
