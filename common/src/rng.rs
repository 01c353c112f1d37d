//! Random number generation utilities.

use rand_core::{le::read_u32_into, OsRng};
pub use rand_core::{CryptoRng, RngCore, SeedableRng};

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng + ?Sized> Crng for R {}

/// The production RNG, backed by the operating system's entropy source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysRng(OsRng);

impl SysRng {
    pub fn new() -> Self {
        Self(OsRng)
    }
}

/// [`OsRng`] is a cryptographically secure PRNG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.0.try_fill_bytes(dest)
    }
}

/// A small, fast, _non-cryptographic_ rng with decent statistical properties.
/// Useful as a deterministic RNG for tests (instead of the [`SysRng`] above,
/// which uses the global OS RNG).
///
/// The implementation is xoroshiro64\*.
#[derive(Clone, Debug)]
pub struct FastRng {
    s0: u32,
    s1: u32,
}

impl FastRng {
    pub fn new() -> Self {
        Self {
            s0: 0xbad_5eed5,
            s1: 0x1057_ca5e,
        }
    }

    pub fn from_u64(s: u64) -> Self {
        Self::seed_from_u64(s)
    }
}

impl Default for FastRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Only treat [`FastRng`] as a secure RNG when testing.
#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for FastRng {}

impl RngCore for FastRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        let r = self.s0.wrapping_mul(0x9e3779bb);
        self.s1 ^= self.s0;
        self.s0 = self.s0.rotate_left(26) ^ self.s1 ^ (self.s1 << 9);
        self.s1 = self.s1.rotate_left(13);
        r
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_u32(self)
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest);
    }

    #[inline]
    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for FastRng {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        // Zero is a pathological seed for xoroshiro64*, map it to the default.
        if seed == [0u8; 8] {
            Self::new()
        } else {
            let mut parts = [0u32, 0u32];
            read_u32_into(&seed, &mut parts);
            Self {
                s0: parts[0],
                s1: parts[1],
            }
        }
    }
}

/// Fisher-Yates shuffle over a slice using the given rng.
pub fn shuffle<T>(items: &mut [T], rng: &mut impl Crng) {
    for i in (1..items.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{any, Arbitrary},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for FastRng {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            // Shrinking an RNG seed won't produce "simpler" output samples,
            // so let proptest know not to waste time trying.
            any::<[u8; 8]>()
                .no_shrink()
                .prop_map(FastRng::from_seed)
                .boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fast_rng_is_deterministic() {
        let mut rng1 = FastRng::from_u64(891237);
        let mut rng2 = FastRng::from_u64(891237);
        for _ in 0..32 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = FastRng::from_u64(20160);
        let mut items = (0u32..100).collect::<Vec<_>>();
        shuffle(&mut items, &mut rng);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0u32..100).collect::<Vec<_>>());
    }
}
