use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR4 — paging and protection feature bits.
///
/// The shim only inspects CR4 (diagnostics at boot); it never flips bits
/// here. Fields below bit 22 are architecturally defined, the rest reserved.
#[bitfield(u64, order = Lsb)]
pub struct Cr4 {
    /// Bit 0 — VME: Virtual-8086 mode extensions.
    pub vme: bool,

    /// Bit 1 — PVI: protected-mode virtual interrupts.
    pub pvi: bool,

    /// Bit 2 — TSD: RDTSC restricted to CPL 0 when set.
    pub tsd: bool,

    /// Bit 3 — DE: debugging extensions.
    pub de: bool,

    /// Bit 4 — PSE: page size extensions (legacy 4 MiB pages).
    pub pse: bool,

    /// Bit 5 — PAE: physical address extension; required in long mode.
    pub pae: bool,

    /// Bit 6 — MCE: machine-check enable.
    pub mce: bool,

    /// Bit 7 — PGE: global-page enable.
    pub pge: bool,

    /// Bit 8 — PCE: performance-counter enable.
    pub pce: bool,

    /// Bit 9 — OSFXSR: FXSAVE/FXRSTOR supported by the OS.
    pub osfxsr: bool,

    /// Bit 10 — OSXMMEXCPT: unmasked SIMD FP exceptions supported.
    pub osxmmexcpt: bool,

    /// Bit 11 — UMIP: user-mode instruction prevention.
    pub umip: bool,

    /// Bit 12 — LA57: five-level paging.
    pub la57: bool,

    /// Bits 13–15 — VMXE/SMXE plus a reserved bit.
    #[bits(3)]
    pub vmx_smx: u8,

    /// Bit 16 — FSGSBASE.
    pub fsgsbase: bool,

    /// Bit 17 — PCIDE: process-context identifiers.
    pub pcide: bool,

    /// Bit 18 — OSXSAVE.
    pub osxsave: bool,

    /// Bit 19 — reserved.
    pub reserved0: bool,

    /// Bit 20 — SMEP: supervisor-mode execution prevention.
    pub smep: bool,

    /// Bit 21 — SMAP: supervisor-mode access prevention.
    pub smap: bool,

    /// Bit 22 — PKE: protection keys.
    pub pke: bool,

    /// Bits 23–63 — reserved.
    #[bits(41)]
    pub reserved1: u64,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}
