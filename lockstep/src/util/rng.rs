use std::cell::Cell;

/// A pseudo-random number generator based on Wang Yi's Wyrand.
///
/// Only used to drive randomized tests.
///
/// See: https://github.com/wangyi-fudan/wyhash
#[derive(Clone, Debug)]
pub(crate) struct Rng {
    seed: Cell<u64>,
}

impl Rng {
    /// Creates a new RNG with the provided seed.
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            seed: Cell::new(seed),
        }
    }

    /// Generates a pseudo-random number within the range `0..2⁶⁴`.
    pub(crate) fn gen(&self) -> u64 {
        let seed = self.seed.get().wrapping_add(0xA0761D6478BD642F);
        self.seed.set(seed);
        let t = seed as u128 * (seed ^ 0xE7037ED1A0B428DB) as u128;
        (t as u64) ^ (t >> 64) as u64
    }

    /// Generates a pseudo-random number within the range `0..upper_bound`.
    ///
    /// Multiply-shift is biased, but negligibly so for bounds much smaller
    /// than 2⁶⁴.
    pub(crate) fn gen_bounded(&self, upper_bound: u64) -> u64 {
        ((self.gen() as u128 * upper_bound as u128) >> 64) as u64
    }

    /// Returns `true` with a probability of `numerator / denominator`.
    pub(crate) fn gen_ratio(&self, numerator: u64, denominator: u64) -> bool {
        self.gen_bounded(denominator) < numerator
    }
}

#[cfg(all(test, not(lockstep_loom), not(miri)))]
mod tests {
    use super::*;

    #[test]
    fn rng_gen_bounded_chi2() {
        const RNG_SEED: u64 = 12345;
        const ROLLS: u64 = 1_000_000;
        const FACES: u64 = 6; // the critical values below assume 5 degrees of freedom
        const CHI2_PVAL_LOWER: f64 = 0.210; // p = 0.001
        const CHI2_PVAL_UPPER: f64 = 20.515; // p = 0.999

        let rng = Rng::new(RNG_SEED);
        let mut tally = [0u64; FACES as usize];

        for _ in 0..ROLLS {
            tally[rng.gen_bounded(FACES) as usize] += 1;
        }

        let expected = ROLLS as f64 / FACES as f64;
        let chi2: f64 = tally
            .iter()
            .map(|&actual| {
                let delta = actual as f64 - expected;
                delta * delta / expected
            })
            .sum();

        assert!(chi2 > CHI2_PVAL_LOWER, "chi2 = {chi2}");
        assert!(chi2 < CHI2_PVAL_UPPER, "chi2 = {chi2}");
    }
}
