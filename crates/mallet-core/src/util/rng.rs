use rand::{Rng as _, RngCore, SeedableRng, rngs::StdRng};

/// Seedable random number generator.
///
/// Wraps [`StdRng`] so that a pattern expansion can be reproduced from its
/// seed value; cloning restarts the stream from the seed.
#[derive(Debug, PartialEq, Eq)]
pub struct Rng {
    seed: u64,
    rng: StdRng,
}

impl Rng {
    /// Creates a new RNG from a seed value.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Splits `total` into `parts` non-negative values that sum to `total`.
    ///
    /// Used to distribute the random victim-row area of a hammer pattern
    /// over its `x` tokens.
    pub fn split_sum(&mut self, total: u64, parts: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(parts);
        if parts == 0 {
            return out;
        }
        let mut remaining = total;
        for _ in 0..parts - 1 {
            let v = self.rng.random_range(0..=remaining);
            out.push(v);
            remaining -= v;
        }
        out.push(remaining);
        out
    }
}

impl RngCore for Rng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

impl Clone for Rng {
    fn clone(&self) -> Self {
        Self::from_seed(self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::Rng;
    use rand::RngCore;

    #[test]
    fn test_rng_clone() {
        let mut rng = Rng::from_seed(0x42);
        let a = rng.next_u64();
        let b = rng.clone().next_u64();
        assert_eq!(a, b, "cloned Rng should restart from the seed");
    }

    #[test]
    fn test_split_sum() {
        let mut rng = Rng::from_seed(7);
        for parts in 1..8 {
            let vals = rng.split_sum(32, parts);
            assert_eq!(vals.len(), parts);
            assert_eq!(vals.iter().sum::<u64>(), 32);
        }
        assert!(rng.split_sum(32, 0).is_empty());
        assert_eq!(rng.split_sum(0, 3), vec![0, 0, 0]);
    }
}
