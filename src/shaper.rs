//! Per-session shaper setup and segment sizing.
//!
//! Everything the inner layer needs is derived from one shared seed: the
//! keystream key (which also keys the table cache), the table IV, one
//! keystream IV and one framing-DRBG seed per direction, the block-size
//! pair, the bias, and the segment sampler's parameters. Both peers walk
//! the derivation in exactly the same order; the role flag only decides
//! which direction is "write".

use rand::{
    rngs::{OsRng, StdRng},
    Rng, RngCore, SeedableRng, TryRngCore,
};
use rand_distr::{Distribution, Normal};

use crate::{
    crypto::KeyStream,
    drbg::{HashDrbg, Seed, SEED_LENGTH},
    framing::{Decoder, Encoder, StretchCodec},
    specification::{KEY_LENGTH, NONCE_PREFIX_LENGTH},
    stretch::{BlockSizes, TableCache},
};

/// The inner layer's sans-I/O state: reshaping codecs for both directions
/// plus the wire segment sampler.
#[derive(Debug)]
pub(crate) struct ShaperSession {
    pub(crate) encoder: Encoder<StretchCodec>,
    pub(crate) decoder: Decoder<StretchCodec>,
    pub(crate) segmenter: Segmenter,
}

impl ShaperSession {
    pub(crate) fn new(seed: &Seed, is_server: bool, cache: &TableCache) -> Self {
        let mut drbg = HashDrbg::new(seed);

        let mut key = [0u8; KEY_LENGTH];
        drbg.fill_bytes(&mut key);

        let input_bits = drbg.random_range(1..=2u32) * 8;
        let output_bits = if input_bits == 8 {
            drbg.random_range(3..=8u32) * 8
        } else {
            drbg.random_range(2..=4u32) * 16
        };
        let sizes = BlockSizes::new(input_bits, output_bits)
            .expect("derived block sizes are always valid");

        // Targets 4-7 bits of entropy per wire byte.
        let bias = drbg.random::<f64>() * 0.2 + 0.1;

        tracing::debug!(input_bits, output_bits, bias, "derived shaper parameters");

        let mut table_iv = [0u8; NONCE_PREFIX_LENGTH];
        drbg.fill_bytes(&mut table_iv);

        // Direction material is always drawn client-to-server first.
        let mut c2s_iv = [0u8; NONCE_PREFIX_LENGTH];
        drbg.fill_bytes(&mut c2s_iv);
        let mut s2c_iv = [0u8; NONCE_PREFIX_LENGTH];
        drbg.fill_bytes(&mut s2c_iv);

        let mut c2s_seed = [0u8; SEED_LENGTH];
        drbg.fill_bytes(&mut c2s_seed);
        let mut s2c_seed = [0u8; SEED_LENGTH];
        drbg.fill_bytes(&mut s2c_seed);

        let mss_dev = drbg.random::<f64>() * 4.0;
        let mss_max = (HashDrbg::new(seed).random::<f64>() * 800.0) as usize + 600;

        let (write_iv, read_iv) = if is_server {
            (s2c_iv, c2s_iv)
        } else {
            (c2s_iv, s2c_iv)
        };
        let (write_seed, read_seed) = if is_server {
            (Seed::from(s2c_seed), Seed::from(c2s_seed))
        } else {
            (Seed::from(c2s_seed), Seed::from(s2c_seed))
        };

        let tables = cache.get_or_generate(&key, sizes, bias, || KeyStream::new(&key, &table_iv));

        let encoder = Encoder::new(
            StretchCodec::new(sizes, tables.clone(), KeyStream::new(&key, &write_iv)),
            &write_seed,
        );
        let decoder = Decoder::new(
            StretchCodec::new(sizes, tables, KeyStream::new(&key, &read_iv)),
            &read_seed,
        );

        Self {
            encoder,
            decoder,
            segmenter: Segmenter::new(mss_max, mss_dev),
        }
    }
}

/// Samples the next wire segment length.
///
/// The reshaping preserves byte-value statistics but would leave the length
/// profile MTU-aligned; sampling `mss_max - |N(0, mss_dev)|` around a
/// per-session MSS below the true MTU masks that signature. The noise draw
/// is local randomness; the parameters are seed-derived.
#[derive(Debug)]
pub(crate) struct Segmenter {
    mss_max: usize,
    noise: Normal<f64>,
    rng: StdRng,
}

impl Segmenter {
    fn new(mss_max: usize, mss_dev: f64) -> Self {
        let mut sample_seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut sample_seed)
            .expect("system random source failure");

        tracing::debug!(mss_max, mss_dev, "derived segment sampler");
        Self {
            mss_max,
            noise: Normal::new(0.0, mss_dev).expect("mss_dev is finite and non-negative"),
            rng: StdRng::from_seed(sample_seed),
        }
    }

    /// The next segment length, in `[1, mss_max]`. Reflected at zero and
    /// resampled when the noise would swallow the whole segment.
    pub(crate) fn next_length(&mut self) -> usize {
        loop {
            let noise = self.noise.sample(&mut self.rng).abs();
            if (noise as usize) < self.mss_max {
                return self.mss_max - noise as usize;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn mss_max(&self) -> usize {
        self.mss_max
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;
    use crate::error::{Error, Retryable};

    #[test]
    fn test_cross_role_round_trip() {
        let seed = Seed::from([11u8; SEED_LENGTH]);
        let cache = TableCache::new();
        let mut client = ShaperSession::new(&seed, false, &cache);
        let mut server = ShaperSession::new(&seed, true, &cache);

        let data: Vec<u8> = (0..10_000).map(|i| (i * 7) as u8).collect();

        // Client to server.
        let mut wire = Vec::new();
        client.encoder.chop(&data, &mut wire).unwrap();
        let mut src = BytesMut::from(&wire[..]);
        let mut got = Vec::new();
        loop {
            match server.decoder.decode(&mut src) {
                Ok(body) => got.extend_from_slice(&body),
                Err(Error::Retryable(Retryable::MoreDataNeeded)) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(got, data);

        // Server to client.
        let mut wire = Vec::new();
        server.encoder.chop(&data, &mut wire).unwrap();
        let mut src = BytesMut::from(&wire[..]);
        let mut got = Vec::new();
        loop {
            match client.decoder.decode(&mut src) {
                Ok(body) => got.extend_from_slice(&body),
                Err(Error::Retryable(Retryable::MoreDataNeeded)) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(got, data);
    }

    #[test]
    fn test_sessions_share_tables_via_cache() {
        let seed = Seed::from([12u8; SEED_LENGTH]);
        let cache = TableCache::new();
        let _first = ShaperSession::new(&seed, false, &cache);
        let _second = ShaperSession::new(&seed, true, &cache);
        // Second construction must not regenerate; observable through the
        // cache test in `stretch`, exercised here for the derived key path.
    }

    #[test]
    fn test_segmenter_bounds() {
        let seed = Seed::from([13u8; SEED_LENGTH]);
        let cache = TableCache::new();
        let mut session = ShaperSession::new(&seed, false, &cache);

        let mss = session.segmenter.mss_max();
        assert!((600..1400).contains(&mss));
        for _ in 0..4096 {
            let n = session.segmenter.next_length();
            assert!(n >= 1 && n <= mss, "sample {} out of [1, {}]", n, mss);
        }
    }

    #[test]
    fn test_mismatched_seeds_fail_loudly() {
        let cache = TableCache::new();
        let mut client = ShaperSession::new(&Seed::from([1u8; SEED_LENGTH]), false, &cache);
        let mut server = ShaperSession::new(&Seed::from([2u8; SEED_LENGTH]), true, &cache);

        let mut wire = Vec::new();
        client.encoder.chop(&[0x55; 64], &mut wire).unwrap();
        let mut src = BytesMut::from(&wire[..]);

        // A mismatched seed must never decode silently; either the decode
        // errors or it produces different bytes.
        match server.decoder.decode(&mut src) {
            Ok(body) => assert_ne!(&body[..], &[0x55; 64][..]),
            Err(Error::Retryable(Retryable::MoreDataNeeded)) => {}
            Err(_) => {}
        }
    }
}
