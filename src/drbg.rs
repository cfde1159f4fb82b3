//! Seeded deterministic random bit generator.
//!
//! All sampling that must be reproducible between the two peers runs off a
//! hash-based DRBG: a blake3 keyed hash iterated in output-feedback mode over
//! an 8-byte block. Two generators constructed from the same [`Seed`] yield
//! identical block sequences. Advance is monotonic; there is no rewind.

use core::fmt::{Debug, Formatter};

use rand::{RngCore, TryRngCore, rngs::OsRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a distribution seed in bytes.
pub(crate) const SEED_LENGTH: usize = 24;

/// Length of one DRBG output block in bytes.
pub(crate) const BLOCK_LENGTH: usize = 8;

/// A 24-byte seed for the hash DRBG.
///
/// Seeds are produced by the session bootstrap (or carried in a `PrngSeed`
/// packet) and shared between the two peers; treat them as secrets.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    /// Generate a fresh [`Seed`] from system entropy.
    pub fn from_entropy() -> Self {
        let mut seed = [0u8; SEED_LENGTH];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self(seed)
    }

    /// Construct a seed from a slice, returning `None` unless the slice is
    /// exactly [`SEED_LENGTH`] bytes.
    pub(crate) fn from_slice(bytes: &[u8]) -> Option<Self> {
        let seed: [u8; SEED_LENGTH] = bytes.try_into().ok()?;
        Some(Self(seed))
    }

    /// Get a reference to the seed's bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }
}

impl From<[u8; SEED_LENGTH]> for Seed {
    fn from(value: [u8; SEED_LENGTH]) -> Self {
        Self(value)
    }
}

impl Debug for Seed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Seed").field(&"*****").finish()
    }
}

/// Hash DRBG over 8-byte blocks.
///
/// The generator also implements [`RngCore`], so it can drive any `rand`
/// sampling API where both peers must draw identical values.
pub(crate) struct HashDrbg {
    key: [u8; 32],
    ofb: [u8; BLOCK_LENGTH],
}

impl HashDrbg {
    pub(crate) fn new(seed: &Seed) -> Self {
        let key = blake3::derive_key("driftwire hash drbg v1", seed.as_bytes());
        let mut ofb = [0u8; BLOCK_LENGTH];
        ofb.copy_from_slice(&seed.as_bytes()[SEED_LENGTH - BLOCK_LENGTH..]);
        Self { key, ofb }
    }

    /// Advance the generator and return the next block.
    pub(crate) fn next_block(&mut self) -> [u8; BLOCK_LENGTH] {
        let digest = blake3::keyed_hash(&self.key, &self.ofb);
        self.ofb.copy_from_slice(&digest.as_bytes()[..BLOCK_LENGTH]);
        self.ofb
    }
}

impl RngCore for HashDrbg {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        u64::from_be_bytes(self.next_block())
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        for chunk in dst.chunks_mut(BLOCK_LENGTH) {
            let block = self.next_block();
            chunk.copy_from_slice(&block[..chunk.len()]);
        }
    }
}

impl Debug for HashDrbg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashDrbg").finish_non_exhaustive()
    }
}
