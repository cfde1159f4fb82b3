//! Frame codec: obfuscated length prefixes, sealed or reshaped bodies, and
//! the reader state machine.
//!
//! Both layers of the stack speak the same frame grammar,
//! `length_field || body`, and differ only in how the two fields reach the
//! wire. The [`SealCodec`] writes the 2-byte obfuscated length directly and
//! seals the body with the AEAD; the [`StretchCodec`] runs both fields
//! through the entropy-reshaping expander. The [`Encoder`] and [`Decoder`]
//! hold everything the variants share: length-field masking against the
//! sender's DRBG, payload chopping, and the receive state machine with its
//! invalid-length countermeasure.

use std::sync::Arc;

use bytes::BytesMut;
use rand::{rngs::OsRng, TryRngCore};

use crate::{
    crypto::{KeyMaterial, KeyStream, NonceCounter, SealCipher},
    drbg::{HashDrbg, Seed},
    error::{BadDataReceived, Error, PeerMisbehaved, Retryable},
    specification::{
        LENGTH_LENGTH, MAX_PACKET_PAYLOAD_LENGTH, MAX_SEGMENT_LENGTH, PACKET_OVERHEAD,
        PACKET_TYPE_PAYLOAD, TAG_LENGTH, TYPE_LENGTH,
    },
    stretch::{self, BlockSizes, StretchTables},
};

/// One frame body's transformation to and from the wire.
///
/// The two implementations are the AEAD variant used by the outer layer and
/// the reshaping variant used by the inner shaper. Everything above this
/// trait is shared.
pub(crate) trait FrameCodec {
    /// Wire bytes occupied by the length field.
    fn length_length(&self) -> usize;

    /// Smallest length-field value this layer can legitimately produce.
    fn min_payload_length(&self) -> usize;

    /// Largest length-field value: one segment minus the length field.
    fn max_frame_payload_length(&self) -> usize {
        MAX_SEGMENT_LENGTH - self.length_length()
    }

    /// Largest plain payload one packet can carry.
    fn max_packet_payload_length(&self) -> usize;

    /// Packet header bytes inside a frame body; zero when frames carry raw
    /// bytes.
    fn packet_overhead(&self) -> usize;

    /// Wire overhead added to a frame body of `len` plain bytes.
    fn payload_overhead(&self, len: usize) -> usize;

    /// Append the wire form of the masked length field to `dst`.
    fn encode_length(&mut self, masked: [u8; LENGTH_LENGTH], dst: &mut Vec<u8>)
        -> Result<(), Error>;

    /// Recover the masked length field from its wire form.
    fn decode_length(&mut self, wire: &[u8]) -> Result<[u8; LENGTH_LENGTH], Error>;

    /// Append the wire form of one frame body to `dst`.
    fn encode_payload(&mut self, body: &[u8], dst: &mut Vec<u8>) -> Result<(), Error>;

    /// Recover one frame body from `wire`.
    fn decode_payload(&mut self, wire: &[u8]) -> Result<Vec<u8>, Error>;
}

/// AEAD frame bodies: XChaCha20-Poly1305 boxes under a counter nonce.
#[derive(Debug)]
pub(crate) struct SealCodec {
    cipher: SealCipher,
    nonce: NonceCounter,
}

impl SealCodec {
    pub(crate) fn new(keys: &KeyMaterial) -> Self {
        Self {
            cipher: SealCipher::new(&keys.seal_key),
            nonce: NonceCounter::new(keys.nonce_prefix),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_nonce_wrap(&mut self) {
        self.nonce.force_wrap();
    }
}

impl FrameCodec for SealCodec {
    fn length_length(&self) -> usize {
        LENGTH_LENGTH
    }

    fn min_payload_length(&self) -> usize {
        LENGTH_LENGTH + TYPE_LENGTH
    }

    fn max_packet_payload_length(&self) -> usize {
        MAX_PACKET_PAYLOAD_LENGTH
    }

    fn packet_overhead(&self) -> usize {
        PACKET_OVERHEAD
    }

    fn payload_overhead(&self, _len: usize) -> usize {
        TAG_LENGTH
    }

    fn encode_length(
        &mut self,
        masked: [u8; LENGTH_LENGTH],
        dst: &mut Vec<u8>,
    ) -> Result<(), Error> {
        dst.extend_from_slice(&masked);
        Ok(())
    }

    fn decode_length(&mut self, wire: &[u8]) -> Result<[u8; LENGTH_LENGTH], Error> {
        Ok([wire[0], wire[1]])
    }

    fn encode_payload(&mut self, body: &[u8], dst: &mut Vec<u8>) -> Result<(), Error> {
        let nonce = self.nonce.peek()?;
        let start = dst.len();
        dst.extend_from_slice(body);
        dst.resize(start + body.len() + TAG_LENGTH, 0);
        self.cipher.seal(&mut dst[start..], nonce);
        self.nonce.advance();
        Ok(())
    }

    fn decode_payload(&mut self, wire: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = self.nonce.peek()?;
        let mut buf = wire.to_vec();
        if self.cipher.open(&mut buf, nonce).is_err() {
            return Err(BadDataReceived::FrameAuthFailed.into());
        }
        self.nonce.advance();
        buf.truncate(buf.len() - TAG_LENGTH);
        Ok(buf)
    }
}

/// Reshaped frame bodies: every field expanded through the biased tables
/// under the shared keystream.
#[derive(Debug)]
pub(crate) struct StretchCodec {
    sizes: BlockSizes,
    tables: Arc<StretchTables>,
    stream: KeyStream,
}

impl StretchCodec {
    pub(crate) fn new(sizes: BlockSizes, tables: Arc<StretchTables>, stream: KeyStream) -> Self {
        Self {
            sizes,
            tables,
            stream,
        }
    }
}

impl FrameCodec for StretchCodec {
    fn length_length(&self) -> usize {
        stretch::expanded_len(LENGTH_LENGTH, self.sizes)
    }

    fn min_payload_length(&self) -> usize {
        stretch::expanded_len(1, self.sizes)
    }

    fn max_packet_payload_length(&self) -> usize {
        // Floor: the expander cannot emit a partial block, so a ceiling
        // here would overflow the segment.
        stretch::compressed_len_floor(self.max_frame_payload_length(), self.sizes)
    }

    fn packet_overhead(&self) -> usize {
        0
    }

    fn payload_overhead(&self, len: usize) -> usize {
        stretch::expanded_len(len, self.sizes) - len
    }

    fn encode_length(
        &mut self,
        masked: [u8; LENGTH_LENGTH],
        dst: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let start = dst.len();
        dst.resize(start + self.length_length(), 0);
        stretch::expand(
            &masked,
            &mut dst[start..],
            self.sizes,
            &self.tables,
            &mut self.stream,
        )?;
        Ok(())
    }

    fn decode_length(&mut self, wire: &[u8]) -> Result<[u8; LENGTH_LENGTH], Error> {
        let mut masked = [0u8; LENGTH_LENGTH];
        stretch::compress(wire, &mut masked, self.sizes, &self.tables, &mut self.stream)?;
        Ok(masked)
    }

    fn encode_payload(&mut self, body: &[u8], dst: &mut Vec<u8>) -> Result<(), Error> {
        let start = dst.len();
        dst.resize(start + stretch::expanded_len(body.len(), self.sizes), 0);
        stretch::expand(
            body,
            &mut dst[start..],
            self.sizes,
            &self.tables,
            &mut self.stream,
        )?;
        Ok(())
    }

    fn decode_payload(&mut self, wire: &[u8]) -> Result<Vec<u8>, Error> {
        let mut body = vec![0u8; stretch::compressed_len(wire.len(), self.sizes)];
        let n = stretch::compress(wire, &mut body, self.sizes, &self.tables, &mut self.stream)?;
        body.truncate(n);
        Ok(body)
    }
}

/// Frame encoder: masks length fields against the send-direction DRBG and
/// delegates the body transform to the codec.
#[derive(Debug)]
pub(crate) struct Encoder<C> {
    codec: C,
    drbg: HashDrbg,
}

impl<C: FrameCodec> Encoder<C> {
    pub(crate) fn new(codec: C, seed: &Seed) -> Self {
        Self {
            codec,
            drbg: HashDrbg::new(seed),
        }
    }

    pub(crate) fn max_packet_payload_length(&self) -> usize {
        self.codec.max_packet_payload_length()
    }

    /// Frame one packet and append its wire bytes to `frame_buf`.
    ///
    /// A partial write of the result to the underlying stream is fatal:
    /// the DRBG and nonce counter have advanced and the frame cannot be
    /// regenerated.
    pub(crate) fn make_packet(
        &mut self,
        frame_buf: &mut Vec<u8>,
        pkt_type: u8,
        data: &[u8],
        pad_len: u16,
    ) -> Result<(), Error> {
        debug_assert!(
            data.len() + pad_len as usize <= self.codec.max_packet_payload_length(),
            "packet payload overflows the frame"
        );

        let mut body = Vec::with_capacity(
            self.codec.packet_overhead() + data.len() + pad_len as usize,
        );
        if self.codec.packet_overhead() == 0 {
            debug_assert!(
                pkt_type == PACKET_TYPE_PAYLOAD && pad_len == 0,
                "raw frames carry payload only"
            );
            body.extend_from_slice(data);
        } else {
            body.push(pkt_type);
            body.extend_from_slice(&(data.len() as u16).to_be_bytes());
            body.extend_from_slice(data);
            body.resize(body.len() + pad_len as usize, 0);
        }

        let wire_len = body.len() + self.codec.payload_overhead(body.len());
        let mask = self.drbg.next_block();
        let masked = (wire_len as u16) ^ u16::from_be_bytes([mask[0], mask[1]]);

        self.codec.encode_length(masked.to_be_bytes(), frame_buf)?;
        self.codec.encode_payload(&body, frame_buf)?;
        Ok(())
    }

    /// Chop application bytes into maximum-payload packets, framing each,
    /// and return how many bytes were consumed.
    pub(crate) fn chop(&mut self, b: &[u8], frame_buf: &mut Vec<u8>) -> Result<usize, Error> {
        for chunk in b.chunks(self.codec.max_packet_payload_length()) {
            self.make_packet(frame_buf, PACKET_TYPE_PAYLOAD, chunk, 0)?;
        }
        Ok(b.len())
    }
}

/// Frame decoder state machine.
///
/// Feed it the receive buffer; it consumes exactly one frame per successful
/// call. [`Retryable::MoreDataNeeded`] is the recoverable "read more and
/// retry" condition; every other error is fatal to the session.
#[derive(Debug)]
pub(crate) struct Decoder<C> {
    codec: C,
    drbg: HashDrbg,
    next_length: usize,
    next_length_invalid: bool,
}

impl<C: FrameCodec> Decoder<C> {
    pub(crate) fn new(codec: C, seed: &Seed) -> Self {
        Self {
            codec,
            drbg: HashDrbg::new(seed),
            next_length: 0,
            next_length_invalid: false,
        }
    }

    /// Decode one frame body out of `src`.
    pub(crate) fn decode(&mut self, src: &mut BytesMut) -> Result<Vec<u8>, Error> {
        if self.next_length == 0 {
            let length_length = self.codec.length_length();
            if src.len() < length_length {
                return Err(Retryable::MoreDataNeeded.into());
            }

            let wire = src.split_to(length_length);
            let masked = self.codec.decode_length(&wire)?;
            let mask = self.drbg.next_block();
            let length = (u16::from_be_bytes(masked)
                ^ u16::from_be_bytes([mask[0], mask[1]])) as usize;

            if length > self.codec.max_frame_payload_length()
                || length < self.codec.min_payload_length()
            {
                // Length-oracle countermeasure: pretend the length was
                // plausible, consume that many bytes, then fail as a tag
                // mismatch. The substitute is drawn from the system random
                // source, never the DRBG.
                self.next_length_invalid = true;
                let min = self.codec.min_payload_length() as u64;
                let max = self.codec.max_frame_payload_length() as u64;
                let r = OsRng
                    .try_next_u64()
                    .expect("system random source failure");
                self.next_length = (min + r % (max - min)) as usize;
                tracing::debug!(substitute = self.next_length, "length prefix out of range");
            } else {
                self.next_length = length;
            }
        }

        if src.len() < self.next_length {
            return Err(Retryable::MoreDataNeeded.into());
        }

        let wire = src.split_to(self.next_length);
        let result = self.codec.decode_payload(&wire);
        if self.next_length_invalid {
            // The countermeasure's drain has completed; the decode result
            // must not be trusted either way.
            return Err(BadDataReceived::FrameAuthFailed.into());
        }

        let body = result?;
        self.next_length = 0;
        Ok(body)
    }
}

/// One parsed packet, borrowed from a decoded frame body.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Packet<'a> {
    pub(crate) pkt_type: u8,
    pub(crate) payload: &'a [u8],
}

/// Parse a decoded frame body as a packet. The zero padding after the
/// payload is dropped here.
pub(crate) fn parse_packet(body: &[u8]) -> Result<Packet<'_>, Error> {
    if body.len() < PACKET_OVERHEAD {
        return Err(PeerMisbehaved::PacketPayloadLenInvalid {
            received: body.len() as u16,
        }
        .into());
    }

    let pkt_type = body[0];
    let claimed = u16::from_be_bytes([body[1], body[2]]) as usize;
    if claimed > body.len() - PACKET_OVERHEAD {
        return Err(PeerMisbehaved::PacketPayloadLenInvalid {
            received: claimed as u16,
        }
        .into());
    }

    Ok(Packet {
        pkt_type,
        payload: &body[PACKET_OVERHEAD..PACKET_OVERHEAD + claimed],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        crypto::SessionKeys,
        drbg::SEED_LENGTH,
        specification::{KEY_LENGTH, PACKET_TYPE_PRNG_SEED},
        stretch::TableCache,
    };

    fn seal_pair() -> (Encoder<SealCodec>, Decoder<SealCodec>) {
        let keys = SessionKeys::derive(&[1u8; KEY_LENGTH].into(), &[2u8; 32]);
        let encoder = Encoder::new(SealCodec::new(&keys.client), &keys.client.drbg_seed);
        let decoder = Decoder::new(SealCodec::new(&keys.client), &keys.client.drbg_seed);
        (encoder, decoder)
    }

    fn stretch_pair(
        input_bits: u32,
        output_bits: u32,
    ) -> (Encoder<StretchCodec>, Decoder<StretchCodec>) {
        let sizes = BlockSizes::new(input_bits, output_bits).unwrap();
        let cache = TableCache::new();
        let tables = cache.get_or_generate(&[3u8; 32], sizes, 0.2, || {
            KeyStream::new(&[3u8; 32], &[0u8; 16])
        });
        let stream_seed = Seed::from([4u8; SEED_LENGTH]);

        let enc_codec = StretchCodec::new(
            sizes,
            tables.clone(),
            KeyStream::new(&[5u8; 32], &[5u8; 16]),
        );
        let dec_codec =
            StretchCodec::new(sizes, tables, KeyStream::new(&[5u8; 32], &[5u8; 16]));
        (
            Encoder::new(enc_codec, &stream_seed),
            Decoder::new(dec_codec, &stream_seed),
        )
    }

    #[test]
    fn test_seal_round_trip_in_order() {
        let (mut encoder, mut decoder) = seal_pair();
        let mut wire = Vec::new();
        let payloads: [&[u8]; 4] = [b"hello", b"", b"world", &[0xaa; 1427]];

        for payload in payloads {
            encoder
                .make_packet(&mut wire, PACKET_TYPE_PAYLOAD, payload, 0)
                .unwrap();
        }

        let mut src = BytesMut::from(&wire[..]);
        for payload in payloads {
            let body = decoder.decode(&mut src).unwrap();
            let pkt = parse_packet(&body).unwrap();
            assert_eq!(pkt.pkt_type, PACKET_TYPE_PAYLOAD);
            assert_eq!(pkt.payload, payload);
        }
        assert!(src.is_empty());
    }

    #[test]
    fn test_seal_padding_is_dropped() {
        let (mut encoder, mut decoder) = seal_pair();
        let mut wire = Vec::new();
        encoder
            .make_packet(&mut wire, PACKET_TYPE_PAYLOAD, b"data", 100)
            .unwrap();

        let mut src = BytesMut::from(&wire[..]);
        let body = decoder.decode(&mut src).unwrap();
        assert_eq!(body.len(), PACKET_OVERHEAD + 4 + 100);
        let pkt = parse_packet(&body).unwrap();
        assert_eq!(pkt.payload, b"data");
    }

    #[test]
    fn test_seal_type_preserved_and_dribble_feed() {
        let (mut encoder, mut decoder) = seal_pair();
        let mut wire = Vec::new();
        encoder
            .make_packet(&mut wire, PACKET_TYPE_PRNG_SEED, &[7u8; SEED_LENGTH], 0)
            .unwrap();

        let mut src = BytesMut::new();
        let mut decoded = None;
        for &byte in &wire {
            src.extend_from_slice(&[byte]);
            match decoder.decode(&mut src) {
                Ok(body) => {
                    decoded = Some(body);
                    break;
                }
                Err(Error::Retryable(Retryable::MoreDataNeeded)) => continue,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        let body = decoded.expect("frame must decode once complete");
        let pkt = parse_packet(&body).unwrap();
        assert_eq!(pkt.pkt_type, PACKET_TYPE_PRNG_SEED);
        assert_eq!(pkt.payload, &[7u8; SEED_LENGTH]);
    }

    #[test]
    fn test_length_obfuscation_masks_recover() {
        let (mut encoder, _) = seal_pair();
        let mut wire = Vec::new();
        encoder
            .make_packet(&mut wire, PACKET_TYPE_PAYLOAD, b"first", 0)
            .unwrap();
        let first_frame_len = wire.len();
        encoder
            .make_packet(&mut wire, PACKET_TYPE_PAYLOAD, &[0u8; 321], 0)
            .unwrap();

        // An observer holding the DRBG recovers the true lengths; the
        // prefixes alone reveal nothing.
        let keys = SessionKeys::derive(&[1u8; KEY_LENGTH].into(), &[2u8; 32]);
        let mut drbg = HashDrbg::new(&keys.client.drbg_seed);

        let mask1 = drbg.next_block();
        let len1 = u16::from_be_bytes([wire[0], wire[1]])
            ^ u16::from_be_bytes([mask1[0], mask1[1]]);
        assert_eq!(len1 as usize, PACKET_OVERHEAD + 5 + TAG_LENGTH);

        let mask2 = drbg.next_block();
        let len2 = u16::from_be_bytes([wire[first_frame_len], wire[first_frame_len + 1]])
            ^ u16::from_be_bytes([mask2[0], mask2[1]]);
        assert_eq!(len2 as usize, PACKET_OVERHEAD + 321 + TAG_LENGTH);
    }

    #[test]
    fn test_nonce_wrap_writes_nothing() {
        let keys = SessionKeys::derive(&[1u8; KEY_LENGTH].into(), &[2u8; 32]);
        let mut codec = SealCodec::new(&keys.client);
        codec.force_nonce_wrap();
        let mut encoder = Encoder::new(codec, &keys.client.drbg_seed);

        let mut wire = Vec::new();
        let err = encoder
            .make_packet(&mut wire, PACKET_TYPE_PAYLOAD, b"x", 0)
            .unwrap_err();
        assert_eq!(err, Error::NonceCounterWrapped);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_invalid_length_countermeasure() {
        let (_, mut decoder) = seal_pair();

        // Pick a prefix that unmasks to an out-of-range length.
        let keys = SessionKeys::derive(&[1u8; KEY_LENGTH].into(), &[2u8; 32]);
        let mask = HashDrbg::new(&keys.client.drbg_seed).next_block();
        let forged = 0xffffu16 ^ u16::from_be_bytes([mask[0], mask[1]]);

        let mut src = BytesMut::new();
        src.extend_from_slice(&forged.to_be_bytes());
        src.extend_from_slice(&[0u8; MAX_SEGMENT_LENGTH]);
        let total = src.len();

        let err = decoder.decode(&mut src).unwrap_err();
        assert_eq!(
            err,
            Error::BadDataReceived(BadDataReceived::FrameAuthFailed)
        );

        let consumed = total - src.len();
        let min = LENGTH_LENGTH + decoder.codec.min_payload_length();
        let max = LENGTH_LENGTH + decoder.codec.max_frame_payload_length();
        assert!((min..max).contains(&consumed), "consumed {}", consumed);
    }

    #[test]
    fn test_chop_and_reassemble() {
        let (mut encoder, mut decoder) = seal_pair();
        let data: Vec<u8> = (0..100_000).map(|i| i as u8).collect();

        let mut wire = Vec::new();
        let n = encoder.chop(&data, &mut wire).unwrap();
        assert_eq!(n, data.len());

        let mut src = BytesMut::from(&wire[..]);
        let mut reassembled = Vec::new();
        loop {
            match decoder.decode(&mut src) {
                Ok(body) => {
                    let pkt = parse_packet(&body).unwrap();
                    reassembled.extend_from_slice(pkt.payload);
                }
                Err(Error::Retryable(Retryable::MoreDataNeeded)) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_stretch_round_trip() {
        for (input_bits, output_bits) in [(8u32, 32u32), (16, 32), (8, 16), (16, 64)] {
            let (mut encoder, mut decoder) = stretch_pair(input_bits, output_bits);
            let data: Vec<u8> = (0..5000).map(|i| (i * 31) as u8).collect();

            let mut wire = Vec::new();
            encoder.chop(&data, &mut wire).unwrap();

            let mut src = BytesMut::from(&wire[..]);
            let mut reassembled = Vec::new();
            loop {
                match decoder.decode(&mut src) {
                    Ok(body) => reassembled.extend_from_slice(&body),
                    Err(Error::Retryable(Retryable::MoreDataNeeded)) => break,
                    Err(e) => panic!("unexpected error {:?}", e),
                }
            }
            assert_eq!(reassembled, data, "sizes ({}, {})", input_bits, output_bits);
        }
    }

    #[test]
    fn test_parse_packet_rejects_bad_claimed_length() {
        let mut body = vec![PACKET_TYPE_PAYLOAD];
        body.extend_from_slice(&100u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            parse_packet(&body),
            Err(Error::PeerMisbehaved(
                PeerMisbehaved::PacketPayloadLenInvalid { received: 100 }
            ))
        ));
    }

    #[test]
    fn test_parse_packet_zero_payload() {
        let mut body = vec![PACKET_TYPE_PAYLOAD];
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 64]); // padding only
        let pkt = parse_packet(&body).unwrap();
        assert!(pkt.payload.is_empty());
    }
}
