//! Entropy seam for randomised placement, plus the shared 64-bit mixer.
//!
//! The platform's real generator stays outside this crate; the engine only
//! needs a stream of words. [`SplitMix64`] is the default: tiny, seedable,
//! and statistically fine for picking slots (this is address-space
//! diversification, not key material).

/// Source of uniformly distributed 64-bit words.
pub trait EntropySource {
    fn next_u64(&mut self) -> u64;
}

/// Two rounds of multiply-xor-shift. Bijective, so distinct inputs never
/// collide; turns the page-aligned, low-entropy alias addresses into
/// well-spread hash keys and doubles as the splitmix output function.
#[inline]
#[must_use]
pub(crate) const fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// The splitmix64 stream: a Weyl sequence run through [`mix64`].
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    #[must_use]
    pub const fn seeded(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl EntropySource for SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        mix64(self.state)
    }
}
