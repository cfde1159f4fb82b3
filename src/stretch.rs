//! Entropy-reshaping codec.
//!
//! A pure, keyed, bit-level transform. Each input block (one byte or one
//! 16-bit word) maps through a per-session table to a longer biased-entropy
//! word, which is then bit-shuffled under the shared keystream. The inverse
//! transform reverses the shuffle and looks the word up in the inverse
//! table. Tables are sampled collision-free, so the forward direction is
//! injective and the inverse is total on the image; a wire block outside
//! the image is evidence of tampering.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    bitops::{bit_shuffle, sample_biased_words},
    crypto::KeyStream,
    error::{BadDataReceived, CodecViolation, Error},
    specification::KEY_LENGTH,
};

/// Validated `(input_bits, output_bits)` pair, oriented the way the
/// expander sees it: input is the plain side (8 or 16 bits), output is the
/// wire side (a multiple of 8, at most 64, at least the input width).
///
/// The compressor takes the same orientation and works backwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct BlockSizes {
    input_bits: u32,
    output_bits: u32,
}

impl BlockSizes {
    pub(crate) fn new(input_bits: u32, output_bits: u32) -> Result<Self, CodecViolation> {
        let valid_input = input_bits == 8 || input_bits == 16;
        let valid_output = output_bits % 8 == 0
            && output_bits > 0
            && output_bits <= 64
            && output_bits >= input_bits;
        // 16-bit blocks must split evenly for the odd-tail recursion.
        let splittable = input_bits != 16 || output_bits % 16 == 0;

        if !(valid_input && valid_output && splittable) {
            return Err(CodecViolation::InvalidBlockSizes {
                input_bits,
                output_bits,
            });
        }
        Ok(Self {
            input_bits,
            output_bits,
        })
    }

    pub(crate) fn input_bits(&self) -> u32 {
        self.input_bits
    }

    pub(crate) fn output_bits(&self) -> u32 {
        self.output_bits
    }

    fn input_bytes(&self) -> usize {
        (self.input_bits / 8) as usize
    }

    fn output_bytes(&self) -> usize {
        (self.output_bits / 8) as usize
    }

    /// The pair used for the final single byte of an odd-length 16-bit-mode
    /// source.
    fn tail(&self) -> Self {
        Self {
            input_bits: self.input_bits / 2,
            output_bits: self.output_bits / 2,
        }
    }

    /// Width in bits of the 256-entry table under these sizes.
    pub(crate) fn width8(&self) -> u32 {
        if self.input_bits == 8 {
            self.output_bits
        } else {
            self.output_bits / 2
        }
    }

    /// Width in bits of the 65536-entry table under these sizes.
    pub(crate) fn width16(&self) -> u32 {
        self.output_bits
    }
}

/// Exact expanded length of `src_len` plain bytes, including the odd-tail
/// rule: an odd 16-bit-mode source expands its final byte at half width,
/// which keeps the total at `src_len * output_bits / input_bits` exactly.
pub(crate) fn expanded_len(src_len: usize, sizes: BlockSizes) -> usize {
    src_len * sizes.output_bits as usize / sizes.input_bits as usize
}

/// Plain length recovered from `wire_len` expanded bytes, rounded up.
/// Used when reconstructing the full pre-expansion buffer.
pub(crate) fn compressed_len(wire_len: usize, sizes: BlockSizes) -> usize {
    let bits = wire_len * sizes.input_bits as usize;
    bits.div_ceil(sizes.output_bits as usize)
}

/// Plain length recovered from `wire_len` expanded bytes, rounded down.
/// Used for wire-side capacities: the shaper cannot emit a partial
/// expanded block, so a capacity computed with the ceiling would overflow
/// the segment.
pub(crate) fn compressed_len_floor(wire_len: usize, sizes: BlockSizes) -> usize {
    wire_len * sizes.input_bits as usize / sizes.output_bits as usize
}

/// The forward and inverse reshaping tables of one session.
///
/// Shared read-only across every connection derived from the same seed.
#[derive(Debug)]
pub(crate) struct StretchTables {
    forward8: Vec<u64>,
    forward16: Vec<u64>,
    inverse8: HashMap<u64, u8>,
    inverse16: HashMap<u64, u16>,
}

impl StretchTables {
    /// Sample the tables from the shared keystream. The 256-entry table is
    /// always drawn first; both peers must preserve that order.
    ///
    /// The 65536-entry table only exists in 16-bit input mode. In 8-bit
    /// mode every block goes through the 256-entry table, and drawing
    /// 65536 distinct words would be wasted work (and, at narrow widths,
    /// would have to exhaust the whole codomain).
    pub(crate) fn generate(sizes: BlockSizes, bias: f64, stream: &mut KeyStream) -> Self {
        let width8 = sizes.width8();
        let width16 = sizes.width16();
        tracing::debug!(width8, width16, bias, "generating reshaping tables");

        let forward8 = sample_biased_words(width8, 256, bias, stream);
        let forward16 = if sizes.input_bits() == 16 {
            sample_biased_words(width16, 65536, bias, stream)
        } else {
            Vec::new()
        };

        let inverse8 = forward8
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as u8))
            .collect();
        let inverse16 = forward16
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i as u16))
            .collect();

        Self {
            forward8,
            forward16,
            inverse8,
            inverse16,
        }
    }
}

/// Process-level table cache keyed by the seed-derived keystream key.
///
/// Table construction walks 65792 biased samples and is by far the most
/// expensive part of session setup; connections sharing a seed share the
/// result. The cache is owned by the transport registry, not a global.
#[derive(Debug, Default)]
pub(crate) struct TableCache {
    inner: Mutex<HashMap<[u8; KEY_LENGTH], Arc<StretchTables>>>,
}

impl TableCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_or_generate(
        &self,
        key: &[u8; KEY_LENGTH],
        sizes: BlockSizes,
        bias: f64,
        table_stream: impl FnOnce() -> KeyStream,
    ) -> Arc<StretchTables> {
        if let Some(tables) = self.inner.lock().unwrap().get(key) {
            tracing::debug!("using cached reshaping tables");
            return tables.clone();
        }

        // Generate outside the lock; a racing duplicate insert is harmless
        // because generation is deterministic in the key.
        let mut stream = table_stream();
        let tables = Arc::new(StretchTables::generate(sizes, bias, &mut stream));

        self.inner
            .lock()
            .unwrap()
            .entry(*key)
            .or_insert(tables)
            .clone()
    }
}

/// Expand `src` into `dst`, returning the number of wire bytes written.
///
/// Each block value is looked up in the forward table, emitted as the low
/// `output_bits / 8` bytes of the table word in little-endian order, and
/// bit-shuffled under the shared stream.
pub(crate) fn expand(
    src: &[u8],
    dst: &mut [u8],
    sizes: BlockSizes,
    tables: &StretchTables,
    stream: &mut KeyStream,
) -> Result<usize, CodecViolation> {
    let needed = expanded_len(src.len(), sizes);
    if dst.len() < needed {
        return Err(CodecViolation::DestinationTooSmall {
            needed,
            capacity: dst.len(),
        });
    }
    expand_inner(src, dst, sizes, tables, stream)?;
    Ok(needed)
}

fn expand_inner(
    src: &[u8],
    dst: &mut [u8],
    sizes: BlockSizes,
    tables: &StretchTables,
    stream: &mut KeyStream,
) -> Result<(), CodecViolation> {
    if src.is_empty() {
        return Ok(());
    }

    // Odd-tail rule: the final byte of an odd-length 16-bit-mode source is
    // expanded at half width. This applies even when the source is exactly
    // one byte; it is the only split whose length relation round-trips.
    if sizes.input_bits == 16 && src.len() == 1 {
        return expand_inner(src, dst, sizes.tail(), tables, stream);
    }
    if sizes.input_bits == 16 && src.len() % 2 == 1 {
        let head = src.len() - 1;
        let head_out = expanded_len(head, sizes);
        expand_inner(&src[..head], &mut dst[..head_out], sizes, tables, stream)?;
        return expand_inner(&src[head..], &mut dst[head_out..], sizes.tail(), tables, stream);
    }

    let in_bytes = sizes.input_bytes();
    let out_bytes = sizes.output_bytes();

    let mut out_idx = 0;
    for block in src.chunks(in_bytes) {
        let value = match block.len() {
            1 => block[0] as usize,
            _ => u16::from_be_bytes([block[0], block[1]]) as usize,
        };
        let word = if sizes.input_bits == 8 {
            tables.forward8[value]
        } else {
            tables.forward16[value]
        };

        let out = &mut dst[out_idx..out_idx + out_bytes];
        out.copy_from_slice(&word.to_le_bytes()[..out_bytes]);
        bit_shuffle(out, stream, false)?;
        out_idx += out_bytes;
    }
    Ok(())
}

/// Compress `src` wire bytes back into plain bytes, returning the number
/// written into `dst`.
///
/// `sizes` is the same pair the expander used. A wire block that reverses
/// to a word outside the table image fails with
/// [`BadDataReceived::InverseLookupFailed`]; a wire length that cannot be
/// split into blocks fails with a codec violation. Both are fatal to the
/// session but never panic.
pub(crate) fn compress(
    src: &[u8],
    dst: &mut [u8],
    sizes: BlockSizes,
    tables: &StretchTables,
    stream: &mut KeyStream,
) -> Result<usize, Error> {
    let needed = compressed_len(src.len(), sizes);
    if dst.len() < needed {
        return Err(CodecViolation::DestinationTooSmall {
            needed,
            capacity: dst.len(),
        }
        .into());
    }
    compress_inner(src, dst, sizes, tables, stream)?;
    Ok(needed)
}

fn compress_inner(
    src: &[u8],
    dst: &mut [u8],
    sizes: BlockSizes,
    tables: &StretchTables,
    stream: &mut KeyStream,
) -> Result<(), Error> {
    if src.is_empty() {
        return Ok(());
    }

    let wire_bytes = sizes.output_bytes();
    let plain_bytes = sizes.input_bytes();

    let blocks = src.len() / wire_bytes;
    let half_block = src.len() % wire_bytes != 0;

    if half_block {
        // A partial block can only be the half-width odd tail. Halving the
        // sizes re-validates them; arbitrary (attacker-chosen) lengths that
        // cannot split this way surface as a structured error here.
        let tail_sizes = BlockSizes::new(sizes.input_bits / 2, sizes.output_bits / 2)
            .map_err(Error::Codec)?;
        if blocks == 0 {
            return compress_inner(src, dst, tail_sizes, tables, stream);
        }
        let wire_end = blocks * wire_bytes;
        let plain_end = blocks * plain_bytes;
        compress_inner(&src[..wire_end], &mut dst[..plain_end], sizes, tables, stream)?;
        return compress_inner(&src[wire_end..], &mut dst[plain_end..], tail_sizes, tables, stream);
    }

    let mut block_buf = [0u8; 8];
    let mut out_idx = 0;
    for block in src.chunks(wire_bytes) {
        let scratch = &mut block_buf[..wire_bytes];
        scratch.copy_from_slice(block);
        bit_shuffle(scratch, stream, true).map_err(Error::Codec)?;

        let mut padded = [0u8; 8];
        padded[..wire_bytes].copy_from_slice(scratch);
        let word = u64::from_le_bytes(padded);

        if sizes.input_bits == 8 {
            let value = tables
                .inverse8
                .get(&word)
                .ok_or(Error::BadDataReceived(BadDataReceived::InverseLookupFailed))?;
            dst[out_idx] = *value;
        } else {
            let value = tables
                .inverse16
                .get(&word)
                .ok_or(Error::BadDataReceived(BadDataReceived::InverseLookupFailed))?;
            dst[out_idx..out_idx + 2].copy_from_slice(&value.to_be_bytes());
        }
        out_idx += plain_bytes;
    }
    Ok(())
}
