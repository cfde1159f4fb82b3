//! Outer-layer polymorphism: burst padding, inter-arrival scheduling
//! decisions, dummy traffic, and the in-band distribution reseed.

use std::time::Duration;

use crate::{
    config::IatMode,
    drbg::Seed,
    error::Error,
    framing::{Encoder, SealCodec},
    probdist::WeightedDist,
    specification::{
        HEADER_LENGTH, MAX_IAT_DELAY, MAX_SEGMENT_LENGTH, PACKET_TYPE_PAYLOAD,
    },
};

/// Derive the IAT distribution's seed from the length distribution's seed,
/// so a single in-band seed transfers both shapes.
pub(crate) fn iat_seed_from(len_seed: &Seed) -> Seed {
    let digest = blake3::hash(len_seed.as_bytes());
    Seed::from_slice(&digest.as_bytes()[..crate::drbg::SEED_LENGTH])
        .expect("digest is longer than a seed")
}

/// A burst of framed wire bytes pending transmission, with a read cursor.
///
/// The write path frames everything up front, then drains this buffer in
/// sampled slices; paranoid mode appends more padding frames mid-drain.
#[derive(Debug, Default)]
pub(crate) struct PendingFrames {
    buf: Vec<u8>,
    pos: usize,
}

impl PendingFrames {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Unread bytes remaining.
    pub(crate) fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append access for the frame encoder.
    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Peek at up to `n` unread bytes.
    pub(crate) fn peek(&self, n: usize) -> &[u8] {
        let end = self.pos.saturating_add(n).min(self.buf.len());
        &self.buf[self.pos..end]
    }

    /// Mark `n` bytes as written.
    pub(crate) fn advance(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n).min(self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }
}

/// The polymorphism state of one connection: both distributions and the
/// timing mode.
#[derive(Debug)]
pub(crate) struct Polymorph {
    len_dist: WeightedDist,
    iat_dist: Option<WeightedDist>,
    iat_mode: IatMode,
}

impl Polymorph {
    pub(crate) fn new(len_seed: &Seed, iat_mode: IatMode, biased: bool) -> Self {
        let iat_dist = match iat_mode {
            IatMode::None => None,
            _ => Some(WeightedDist::new(
                &iat_seed_from(len_seed),
                0,
                MAX_IAT_DELAY,
                biased,
            )),
        };
        Self {
            len_dist: WeightedDist::new(len_seed, 0, MAX_SEGMENT_LENGTH, biased),
            iat_dist,
            iat_mode,
        }
    }

    pub(crate) fn iat_mode(&self) -> IatMode {
        self.iat_mode
    }

    /// Install a seed delivered in a `PrngSeed` packet. Reshapes both
    /// distributions; the caller applies this at the start of the next
    /// write burst.
    pub(crate) fn install_seed(&mut self, seed: &Seed) {
        tracing::debug!("installing in-band distribution seed");
        self.len_dist.reset(seed);
        if let Some(iat_dist) = &mut self.iat_dist {
            iat_dist.reset(&iat_seed_from(seed));
        }
    }

    /// Sample a padding/write-length target.
    pub(crate) fn sample_target(&mut self) -> usize {
        self.len_dist.sample()
    }

    /// Sample the delay to insert after one IAT write.
    pub(crate) fn sample_delay(&mut self) -> Duration {
        let units = self
            .iat_dist
            .as_mut()
            .map(|dist| dist.sample())
            .unwrap_or(0);
        Duration::from_micros(units as u64 * 100)
    }

    #[cfg(test)]
    pub(crate) fn shapes(&self) -> ((&[usize], &[f64]), Option<(&[usize], &[f64])>) {
        (
            self.len_dist.shape(),
            self.iat_dist.as_ref().map(|dist| dist.shape()),
        )
    }

    /// Pad the current burst so its tail segment length becomes `target`.
    ///
    /// If the needed padding does not fit one packet's header, a maximum
    /// padding packet is emitted first and the remainder tops the burst up
    /// to the target in the following segment.
    pub(crate) fn pad_burst(
        &mut self,
        encoder: &mut Encoder<SealCodec>,
        burst: &mut PendingFrames,
        target: usize,
    ) -> Result<(), Error> {
        let tail = burst.len() % MAX_SEGMENT_LENGTH;

        let pad = if target >= tail {
            target - tail
        } else {
            (MAX_SEGMENT_LENGTH - tail) + target
        };

        if pad > HEADER_LENGTH {
            encoder.make_packet(
                burst.buf_mut(),
                PACKET_TYPE_PAYLOAD,
                &[],
                (pad - HEADER_LENGTH) as u16,
            )?;
        } else if pad > 0 {
            encoder.make_packet(
                burst.buf_mut(),
                PACKET_TYPE_PAYLOAD,
                &[],
                encoder.max_packet_payload_length() as u16,
            )?;
            encoder.make_packet(burst.buf_mut(), PACKET_TYPE_PAYLOAD, &[], pad as u16)?;
        }
        Ok(())
    }
}

/// Synthesize `n` bytes of dummy traffic: well-formed zero-payload padding
/// frames from the session encoder's max-payload path.
///
/// Refused until the session is established: dummy frames require the
/// derived encoder keys, and emitting anything before then would leak the
/// bootstrap state.
pub(crate) fn dummy_traffic(
    encoder: &mut Encoder<SealCodec>,
    established: bool,
    mut n: usize,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    if !established {
        return Err(crate::error::Retryable::NotEstablished.into());
    }

    let max = encoder.max_packet_payload_length();
    while n > max {
        encoder.make_packet(out, PACKET_TYPE_PAYLOAD, &[], max as u16)?;
        n = n.saturating_sub(max + HEADER_LENGTH);
    }
    if n < HEADER_LENGTH {
        n = HEADER_LENGTH;
    }
    encoder.make_packet(out, PACKET_TYPE_PAYLOAD, &[], (n - HEADER_LENGTH) as u16)?;
    Ok(())
}
