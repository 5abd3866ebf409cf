use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use veil_memory_addresses::PhysicalAddress;

/// CR3 — page-table base register (IA-32e, PCID disabled).
///
/// Carries the physical base of the root table plus two cache-control bits
/// for walks of that table. The shim never switches address spaces; it reads
/// CR3 once at boot and caches the root (see `veil-vmem`).
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — reserved, must be zero.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: write-through caching for root-table accesses.
    pub pwt: bool,

    /// Bit 4 — PCD: cache disable for root-table accesses.
    pub pcd: bool,

    /// Bits 5–11 — reserved, must be zero when written.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51 — root table physical base, shifted right by 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–63 — reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Build a CR3 value from a 4 KiB-aligned root-table base.
    #[must_use]
    pub fn from_root_phys(root: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        debug_assert_eq!(root.as_u64() & 0xFFF, 0, "root table must be 4K-aligned");
        Self::new()
            .with_pwt(pwt)
            .with_pcd(pcd)
            .with_root_base_4k(root.as_u64() >> 12)
    }

    /// The physical address of the root table.
    #[must_use]
    pub fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
