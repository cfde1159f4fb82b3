//! Bit-level primitives for the entropy-reshaping codec.
//!
//! Everything here is driven by a [`KeyStream`] shared between the peers, so
//! that an expansion on one side and the matching compression on the other
//! consume identical draws.

use std::collections::HashSet;

use crate::{crypto::KeyStream, error::CodecViolation};

/// Swap bits `i` and `j` in `data`. Bit 0 is the least significant bit of
/// `data[0]`.
pub(crate) fn bit_swap(data: &mut [u8], i: u64, j: u64) -> Result<(), CodecViolation> {
    if i == j {
        return Ok(());
    }

    let bits = (data.len() * 8) as u64;
    if i >= bits || j >= bits {
        return Err(CodecViolation::BitIndexOutOfBounds {
            index: i.max(j),
            bits,
        });
    }

    let i_byte = (i / 8) as usize;
    let j_byte = (j / 8) as usize;
    let i_bit = i % 8;
    let j_bit = j % 8;

    // If we are swapping bits a and b, the least significant bit of c now
    // holds a XOR b; XORing it back into both positions performs the swap.
    let c = ((data[i_byte] >> i_bit) & 1) ^ ((data[j_byte] >> j_bit) & 1);
    data[i_byte] ^= c << i_bit;
    data[j_byte] ^= c << j_bit;
    Ok(())
}

/// Draw a uniform sample from the inclusive range `[a, b]`.
///
/// Rejection sampling over a 64-bit draw with bound
/// `u64::MAX - (u64::MAX % range)`, so the result carries no modulo bias.
pub(crate) fn uniform_sample(a: u64, b: u64, stream: &mut KeyStream) -> u64 {
    debug_assert!(a < b, "uniform_sample: invalid range");

    let range = b - a + 1;
    let bound = u64::MAX - (u64::MAX % range);
    loop {
        let r = stream.next_u64();
        if r < bound {
            return a + (r % range);
        }
    }
}

/// Shuffle the bits of one block in place.
///
/// The swap schedule is re-derived from the stream on every call: for
/// `i` in `[0, bits - 1)` the partner `j` is drawn uniformly from
/// `[i, bits - 1]`. The reverse shuffle replays the same swaps in reverse
/// order, so `bit_shuffle(data, s, false)` followed by
/// `bit_shuffle(data, s', true)` with `s' == s` restores `data`.
pub(crate) fn bit_shuffle(
    data: &mut [u8],
    stream: &mut KeyStream,
    reverse: bool,
) -> Result<(), CodecViolation> {
    let bits = (data.len() * 8) as u64;
    if bits < 2 {
        return Ok(());
    }

    let mut partners = vec![0u64; (bits - 1) as usize];
    for (idx, partner) in partners.iter_mut().enumerate() {
        *partner = uniform_sample(idx as u64, bits - 1, stream);
    }

    for idx in 0..bits - 1 {
        let k = if reverse { bits - 2 - idx } else { idx };
        bit_swap(data, k, partners[k as usize])?;
    }
    Ok(())
}

/// Sample one `num_bits`-bit word whose bits are independently
/// Bernoulli-distributed: each bit is zero with probability `bias`.
pub(crate) fn sample_biased_word(num_bits: u32, bias: f64, stream: &mut KeyStream) -> u64 {
    debug_assert!(num_bits <= 64, "sample_biased_word: width out of range");

    let mut word = 0u64;
    for idx in 0..num_bits {
        // Simulate a biased coin flip.
        let x = uniform_sample(0, u64::MAX - 1, stream) as f64 / (u64::MAX - 1) as f64;
        if x >= bias {
            word |= 1 << idx;
        }
    }
    word
}

/// Sample `n` distinct biased words, redrawing on collision.
///
/// Distinctness is what makes the forward table injective and its inverse a
/// total function on the image.
pub(crate) fn sample_biased_words(
    num_bits: u32,
    n: usize,
    bias: f64,
    stream: &mut KeyStream,
) -> Vec<u64> {
    let mut vals = Vec::with_capacity(n);
    let mut seen = HashSet::with_capacity(n);

    for _ in 0..n {
        let mut word = sample_biased_word(num_bits, bias, stream);
        while !seen.insert(word) {
            word = sample_biased_word(num_bits, bias, stream);
        }
        vals.push(word);
    }
    vals
}

#[cfg(test)]
mod test {
    use super::*;

    fn stream(tag: u8) -> KeyStream {
        KeyStream::new(&[tag; 32], &[tag; 16])
    }

    #[test]
    fn test_bit_swap() {
        let mut data = [0b0000_0001u8, 0b0000_0000];
        bit_swap(&mut data, 0, 8).unwrap();
        assert_eq!(data, [0b0000_0000, 0b0000_0001]);

        bit_swap(&mut data, 8, 15).unwrap();
        assert_eq!(data, [0b0000_0000, 0b1000_0000]);

        // Swapping a bit with itself is a no-op.
        bit_swap(&mut data, 15, 15).unwrap();
        assert_eq!(data, [0b0000_0000, 0b1000_0000]);
    }

    #[test]
    fn test_bit_swap_out_of_bounds() {
        let mut data = [0u8; 2];
        assert!(matches!(
            bit_swap(&mut data, 3, 16),
            Err(CodecViolation::BitIndexOutOfBounds { index: 16, bits: 16 })
        ));
    }

    #[test]
    fn test_uniform_sample_bounds() {
        let mut ks = stream(1);
        for _ in 0..4096 {
            let v = uniform_sample(10, 20, &mut ks);
            assert!((10..=20).contains(&v));
        }
    }

    #[test]
    fn test_bit_shuffle_round_trip() {
        for len in [1usize, 2, 3, 4, 5, 7, 8] {
            let mut fwd = stream(2);
            let mut rev = stream(2);

            let original: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37) ^ 0x5c).collect();
            let mut data = original.clone();

            bit_shuffle(&mut data, &mut fwd, false).unwrap();
            bit_shuffle(&mut data, &mut rev, true).unwrap();
            assert_eq!(data, original, "len {}", len);
        }
    }

    #[test]
    fn test_bit_shuffle_permutes() {
        let mut ks = stream(3);
        let original = [0x0fu8, 0xf0, 0xaa, 0x55];
        let mut data = original;
        bit_shuffle(&mut data, &mut ks, false).unwrap();

        // A permutation preserves the popcount.
        let ones_before: u32 = original.iter().map(|b| b.count_ones()).sum();
        let ones_after: u32 = data.iter().map(|b| b.count_ones()).sum();
        assert_eq!(ones_before, ones_after);
        assert_ne!(data, original);
    }

    #[test]
    fn test_sample_biased_words_distinct() {
        let mut ks = stream(4);
        let words = sample_biased_words(16, 256, 0.2, &mut ks);
        assert_eq!(words.len(), 256);
        let set: HashSet<u64> = words.iter().copied().collect();
        assert_eq!(set.len(), 256);
        for w in words {
            assert!(w < (1 << 16));
        }
    }

    #[test]
    fn test_biased_words_lean_toward_ones() {
        // With a zero-bias of 0.2, roughly 80% of bits come out set.
        let mut ks = stream(5);
        let words = sample_biased_words(32, 512, 0.2, &mut ks);
        let ones: u32 = words.iter().map(|w| w.count_ones()).sum();
        let total = 32 * 512;
        let ratio = ones as f64 / total as f64;
        assert!(ratio > 0.7 && ratio < 0.9, "ratio {}", ratio);
    }
}
