use crate::msr::Msr;
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// `IA32_EFER` (MSR `0xC000_0080`) — extended feature enable register.
///
/// The shim's NX configuration sets [`nxe`](Efer::nxe) once at init; with
/// NXE clear, bit 63 of a page-table entry is reserved and must stay zero.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0 — SCE: SYSCALL/SYSRET enable.
    pub sce: bool,

    /// Bits 1–7 — legacy AMD K6 bits and reserved space.
    #[bits(7)]
    pub reserved0: u8,

    /// Bit 8 — LME: long mode enable.
    pub lme: bool,

    /// Bit 9 — reserved.
    pub reserved1: bool,

    /// Bit 10 — LMA: long mode active (read-only).
    pub lma: bool,

    /// Bit 11 — NXE: no-execute enable; arms bit 63 of page-table entries.
    pub nxe: bool,

    /// Bit 12 — SVME: secure virtual machine enable (AMD).
    pub svme: bool,

    /// Bits 13–63 — further AMD extensions and reserved space.
    #[bits(51)]
    pub reserved2: u64,
}

impl Efer {
    /// MSR index of `IA32_EFER`.
    pub const MSR_EFER: Msr = Msr::new(0xC000_0080);
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        let efer = unsafe { Self::MSR_EFER.load_raw() };
        Self::from_bits(efer)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Efer {
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR_EFER.store_raw(self.into_bits()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nxe_is_bit_11() {
        let efer = Efer::new().with_nxe(true);
        assert_eq!(efer.into_bits(), 1 << 11);
    }

    #[test]
    fn lma_is_bit_10() {
        let efer = Efer::from_bits(1 << 10);
        assert!(efer.lma());
        assert!(!efer.nxe());
    }
}
