use crate::PageSize;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// A physical machine address.
///
/// In this system physical memory is identity-mapped in the low gigabyte, so
/// a `PhysicalAddress` below 1 GiB doubles as a dereferencable location once
/// run through a [`PhysMapper`](https://docs.rs/veil-vmem) implementation.
/// The newtype exists so an alias (virtual) can never silently stand in for
/// an origin (physical) or vice versa.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
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
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::containing(self)
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
    pub const fn split<S: PageSize>(self) -> (PhysicalPage<S>, u64) {
        (self.page::<S>(), self.offset_in::<S>())
    }
}

/// Page-aligned base of a physical page of size `S`.
///
/// The low `S::SHIFT` bits are zero by construction.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u64,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `addr` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: addr.as_u64() & !(S::SIZE - 1),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
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

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#014x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#014x})", S::as_str(), self.base)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
