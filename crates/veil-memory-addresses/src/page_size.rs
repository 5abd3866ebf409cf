use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 page sizes.
///
/// Sealed; only [`Size4K`], [`Size2M`] and [`Size1G`] implement it.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes.
    const SIZE: u64;
    /// `log2(SIZE)`; the number of offset bits below the page base.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page, mapped by a PT entry. The granularity of every alias.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

/// 2 MiB page, a PD entry with the PageSize bit set. Recognised, never created.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;

/// 1 GiB page, a PDPT entry with the PageSize bit set. Recognised, never created.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size1G;

impl sealed::Sealed for Size4K {}
impl sealed::Sealed for Size2M {}
impl sealed::Sealed for Size1G {}

impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;

    fn as_str() -> &'static str {
        "2M"
    }
}

impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;

    fn as_str() -> &'static str {
        "1G"
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size2M {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size1G {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}
