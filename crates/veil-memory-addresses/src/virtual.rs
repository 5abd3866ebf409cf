use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// A virtual (page-table translated) address.
///
/// Aliases handed to callers live here, as do the carvings of the alias
/// pool. A `VirtualAddress` of zero is the shim's NULL.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    /// The offset of this address inside its size-`S` page.
    #[inline]
    #[must_use]
    pub const fn offset_in<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Split into the containing page and the in-page offset.
    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (VirtualPage<S>, u64) {
        (self.page::<S>(), self.offset_in::<S>())
    }
}

/// Page-aligned base of a virtual page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    /// The page containing `addr` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: addr.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    /// The page `n` pages further up.
    #[inline]
    #[must_use]
    pub const fn step(self, n: u64) -> Self {
        Self {
            base: self.base + n * S::SIZE,
            _size: PhantomData,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#014x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>({:#014x})", S::as_str(), self.base)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
