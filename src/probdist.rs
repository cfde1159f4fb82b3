//! Seeded weighted distributions for length and inter-arrival sampling.
//!
//! The *shape* of a distribution (which values exist and their weights) is
//! derived deterministically from a [`Seed`], so the server can transfer its
//! shape to a client in-band and both ends pad identically. Individual
//! samples draw from local OS randomness; only the shape is shared.

use rand::{seq::SliceRandom, Rng, SeedableRng, TryRngCore, rngs::{OsRng, StdRng}};

use crate::drbg::{HashDrbg, Seed};

/// Upper bound on the number of distinct values a distribution carries.
const MAX_VALUES: usize = 100;

/// A resettable weighted distribution over `[min, max)`.
#[derive(Debug)]
pub(crate) struct WeightedDist {
    min: usize,
    max: usize,
    biased: bool,
    values: Vec<usize>,
    cdf: Vec<f64>,
    rng: StdRng,
}

impl WeightedDist {
    /// Build a distribution over `[min, max)` shaped by `seed`.
    ///
    /// With `biased` set, the weights decay geometrically in table order
    /// (ScrambleSuit style); otherwise they are independent uniforms.
    pub(crate) fn new(seed: &Seed, min: usize, max: usize, biased: bool) -> Self {
        let mut sample_seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut sample_seed)
            .expect("system random source failure");

        let mut dist = Self {
            min,
            max,
            biased,
            values: Vec::new(),
            cdf: Vec::new(),
            rng: StdRng::from_seed(sample_seed),
        };
        dist.reset(seed);
        dist
    }

    /// Regenerate the shape from a new seed, e.g. one delivered in-band.
    pub(crate) fn reset(&mut self, seed: &Seed) {
        let mut drbg = HashDrbg::new(seed);

        let span = self.max - self.min;
        let n = drbg.random_range(1..=MAX_VALUES.min(span));

        let mut candidates: Vec<usize> = (self.min..self.max).collect();
        candidates.shuffle(&mut drbg);
        candidates.truncate(n);
        self.values = candidates;

        let mut weights = Vec::with_capacity(n);
        if self.biased {
            let mut w: f64 = 1.0;
            for _ in 0..n {
                weights.push(w);
                w *= drbg.random::<f64>();
            }
        } else {
            for _ in 0..n {
                weights.push(drbg.random::<f64>());
            }
        }

        let total: f64 = weights.iter().sum();
        let mut acc = 0.0;
        self.cdf = weights
            .iter()
            .map(|w| {
                acc += w / total;
                acc
            })
            .collect();
    }

    /// Draw one value. The draw itself uses local randomness; two peers
    /// sharing a seed agree on the distribution, not on the sequence.
    pub(crate) fn sample(&mut self) -> usize {
        let u: f64 = self.rng.random();
        let idx = self.cdf.partition_point(|&c| c < u);
        self.values[idx.min(self.values.len() - 1)]
    }

    #[cfg(test)]
    pub(crate) fn shape(&self) -> (&[usize], &[f64]) {
        (&self.values, &self.cdf)
    }
}
