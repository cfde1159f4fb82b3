//! The informal specification of the driftwire wire format.

// Outer frame:
// ```text
// | obfs_len | tag | payload  |
// |    2B    | 16B | variable |
// |          <- seal ->       |
// |        <- frame ->        |
// ```
//
// `obfs_len` is the big-endian ciphertext length XORed with the first two
// bytes of the sender's next DRBG block. `seal` is an XChaCha20-Poly1305
// box over one packet, nonce = 16-byte prefix || u64 big-endian counter.
// The counter starts at 1 and is never reused; the session aborts if it
// would wrap.
//
// Packet (inside a frame):
// ```text
// | type | payload_len | payload  | zero padding |
// |  1B  |     2B      | variable |   variable   |
// ```
//
// Inner (reshaped) frames use the same layout with both fields run through
// the entropy-reshaping expander; their overheads are a function of the
// per-session block sizes and live in `stretch`.

/// Largest possible wire segment, including overhead. Chosen to fit a
/// 1500-byte path MTU minus TCP/IP overhead.
pub(crate) const MAX_SEGMENT_LENGTH: usize = 1500 - 52;

/// Bytes used to represent a frame length on the wire (before reshaping).
pub(crate) const LENGTH_LENGTH: usize = 2;

/// Bytes used for the packet type tag.
pub(crate) const TYPE_LENGTH: usize = 1;

/// AEAD authentication tag length.
pub(crate) const TAG_LENGTH: usize = 16;

/// Fixed part of the AEAD nonce.
pub(crate) const NONCE_PREFIX_LENGTH: usize = 16;

/// Outer frame overhead: obfuscated length prefix plus AEAD tag.
pub(crate) const FRAME_OVERHEAD: usize = LENGTH_LENGTH + TAG_LENGTH;

/// Maximum payload carried by a single outer frame.
pub(crate) const MAX_FRAME_PAYLOAD_LENGTH: usize = MAX_SEGMENT_LENGTH - FRAME_OVERHEAD;

/// Packet header: type tag plus payload length field.
pub(crate) const PACKET_OVERHEAD: usize = TYPE_LENGTH + LENGTH_LENGTH;

/// Maximum application payload carried by a single packet.
pub(crate) const MAX_PACKET_PAYLOAD_LENGTH: usize = MAX_FRAME_PAYLOAD_LENGTH - PACKET_OVERHEAD;

/// Combined per-packet wire overhead of the outer layer.
pub(crate) const HEADER_LENGTH: usize = FRAME_OVERHEAD + PACKET_OVERHEAD;

/// Packet types. Unknown types are ignored for forward compatibility.
pub(crate) const PACKET_TYPE_PAYLOAD: u8 = 0x00;
pub(crate) const PACKET_TYPE_PRNG_SEED: u8 = 0x01;

/// A `PrngSeed` packet carries exactly one distribution seed.
pub(crate) const SEED_PACKET_PAYLOAD_LENGTH: usize = crate::drbg::SEED_LENGTH;

/// Per-direction key material layout: AEAD key || nonce prefix || DRBG seed.
pub(crate) const KEY_LENGTH: usize = 32;
pub(crate) const KEY_MATERIAL_LENGTH: usize =
    KEY_LENGTH + NONCE_PREFIX_LENGTH + crate::drbg::SEED_LENGTH;

/// How much to read from the underlying stream per receive pass.
pub(crate) const CONSUME_READ_SIZE: usize = MAX_SEGMENT_LENGTH * 16;

/// Inter-arrival delay unit is 100 microseconds; samples fall in
/// `[0, MAX_IAT_DELAY)`.
pub(crate) const MAX_IAT_DELAY: usize = 100;

/// Upper bound, in seconds, of the randomized server-side drain applied
/// after a failed session bootstrap.
pub(crate) const MAX_CLOSE_DELAY_SECS: u64 = 60;

/// Session bootstrap deadlines.
pub(crate) const CLIENT_HANDSHAKE_TIMEOUT_SECS: u64 = 60;
pub(crate) const SERVER_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Lifetime of a bootstrap fingerprint in the server's replay filter.
pub(crate) const REPLAY_TTL_SECS: u64 = 3 * 60 * 60;

/// Node identifier length inside the packed `cert` argument.
pub(crate) const NODE_ID_LENGTH: usize = 20;

/// Session bootstrap wire sizes: salt plus truncated confirmation MAC.
pub(crate) const BOOTSTRAP_SALT_LENGTH: usize = 32;
pub(crate) const BOOTSTRAP_MAC_LENGTH: usize = 16;
pub(crate) const BOOTSTRAP_LENGTH: usize = BOOTSTRAP_SALT_LENGTH + BOOTSTRAP_MAC_LENGTH;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_overhead_arithmetic() {
        assert_eq!(MAX_SEGMENT_LENGTH, 1448);
        assert_eq!(FRAME_OVERHEAD, 18);
        assert_eq!(MAX_FRAME_PAYLOAD_LENGTH, 1430);
        assert_eq!(MAX_PACKET_PAYLOAD_LENGTH, 1427);
        assert_eq!(HEADER_LENGTH, 21);
        assert_eq!(KEY_MATERIAL_LENGTH, 72);
    }
}
