//! Crypto interface.
//!
//! This module provides the AEAD used by the frame codec, the per-direction
//! key schedule, the counter nonce, and the shared keystream that drives the
//! reshaping codec's bit shuffle.

use core::fmt::{Debug, Formatter};

use chacha20poly1305::{
    aead::AeadInPlace, Key, KeyInit, Tag, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, TryRngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    drbg::Seed,
    error::Error,
    specification::{
        BOOTSTRAP_MAC_LENGTH, BOOTSTRAP_SALT_LENGTH, KEY_LENGTH, KEY_MATERIAL_LENGTH,
        NONCE_PREFIX_LENGTH, TAG_LENGTH,
    },
};

const NONCE_LENGTH: usize = NONCE_PREFIX_LENGTH + 8;

/// A 256-bit key identifying one server, shared with its clients through an
/// out-of-band mechanism (packed into the `cert` transport argument).
///
/// Every per-session key is derived from this value and a per-connection
/// salt. Avoid populating it from low-entropy user passwords; use a secure
/// entropy source such as [`IdentityKey::from_entropy`].
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKey([u8; KEY_LENGTH]);

impl IdentityKey {
    /// Generate a new [`IdentityKey`] from system entropy.
    pub fn from_entropy() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng
            .try_fill_bytes(&mut key)
            .expect("system random source failure");
        Self(key)
    }

    /// Extract this key's bytes for serialization.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.0
    }

    /// Get a reference to the key's bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl AsRef<[u8]> for IdentityKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; KEY_LENGTH]> for IdentityKey {
    fn from(value: [u8; KEY_LENGTH]) -> Self {
        Self(value)
    }
}

impl Debug for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityKey").field(&"*****").finish()
    }
}

/// One direction's key material: AEAD key, nonce prefix, and the seed of
/// the DRBG that masks that direction's length fields.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyMaterial {
    pub(crate) seal_key: [u8; KEY_LENGTH],
    pub(crate) nonce_prefix: [u8; NONCE_PREFIX_LENGTH],
    pub(crate) drbg_seed: Seed,
}

impl KeyMaterial {
    pub(crate) fn from_okm(okm: &[u8; KEY_MATERIAL_LENGTH]) -> Self {
        let mut seal_key = [0u8; KEY_LENGTH];
        seal_key.copy_from_slice(&okm[..KEY_LENGTH]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LENGTH];
        nonce_prefix.copy_from_slice(&okm[KEY_LENGTH..KEY_LENGTH + NONCE_PREFIX_LENGTH]);
        let drbg_seed = Seed::from_slice(&okm[KEY_LENGTH + NONCE_PREFIX_LENGTH..])
            .expect("key material layout mismatch");
        Self {
            seal_key,
            nonce_prefix,
            drbg_seed,
        }
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeyMaterial").field(&"*****").finish()
    }
}

/// The two directions' key material for one session.
///
/// The client seals with `client` and opens with `server`; the server does
/// the inverse. Both peers derive the same pair from the identity key and
/// the bootstrap salt.
#[derive(Debug)]
pub(crate) struct SessionKeys {
    pub(crate) client: KeyMaterial,
    pub(crate) server: KeyMaterial,
}

impl SessionKeys {
    pub(crate) fn derive(identity: &IdentityKey, salt: &[u8; BOOTSTRAP_SALT_LENGTH]) -> Self {
        let key = blake3::derive_key("driftwire session keys v1", identity.as_bytes());
        let mut hasher = blake3::Hasher::new_keyed(&key);
        hasher.update(salt);

        let mut okm = [0u8; KEY_MATERIAL_LENGTH * 2];
        hasher.finalize_xof().fill(&mut okm);

        let client = KeyMaterial::from_okm(okm[..KEY_MATERIAL_LENGTH].try_into().unwrap());
        let server = KeyMaterial::from_okm(okm[KEY_MATERIAL_LENGTH..].try_into().unwrap());
        okm.zeroize();

        Self { client, server }
    }
}

/// Compute the truncated confirmation code the client appends to its
/// bootstrap salt.
pub(crate) fn bootstrap_mac(
    identity: &IdentityKey,
    salt: &[u8; BOOTSTRAP_SALT_LENGTH],
) -> [u8; BOOTSTRAP_MAC_LENGTH] {
    let key = blake3::derive_key("driftwire bootstrap confirm v1", identity.as_bytes());
    let digest = blake3::keyed_hash(&key, salt);
    let mut mac = [0u8; BOOTSTRAP_MAC_LENGTH];
    mac.copy_from_slice(&digest.as_bytes()[..BOOTSTRAP_MAC_LENGTH]);
    mac
}

/// Monotone counter nonce: 16-byte fixed prefix plus a big-endian 64-bit
/// counter starting at 1.
///
/// The nonce is never transmitted; both sides derive it independently. The
/// counter must never be reused under one key, so a would-be wrap to 0
/// aborts the session instead of producing a nonce.
#[derive(Debug)]
pub(crate) struct NonceCounter {
    prefix: [u8; NONCE_PREFIX_LENGTH],
    counter: u64,
}

impl NonceCounter {
    pub(crate) fn new(prefix: [u8; NONCE_PREFIX_LENGTH]) -> Self {
        Self { prefix, counter: 1 }
    }

    /// The nonce for the current frame. Does not advance the counter.
    pub(crate) fn peek(&self) -> Result<[u8; NONCE_LENGTH], Error> {
        if self.counter == 0 {
            return Err(Error::NonceCounterWrapped);
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce[..NONCE_PREFIX_LENGTH].copy_from_slice(&self.prefix);
        nonce[NONCE_PREFIX_LENGTH..].copy_from_slice(&self.counter.to_be_bytes());
        Ok(nonce)
    }

    /// Commit the current nonce after a successful seal or open.
    pub(crate) fn advance(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn force_wrap(&mut self) {
        self.counter = 0;
    }
}

/// XChaCha20-Poly1305 in a seal-in-place interface: the buffer holds the
/// payload followed by [`TAG_LENGTH`] bytes of tag space.
pub(crate) struct SealCipher {
    cipher: XChaCha20Poly1305,
}

impl SealCipher {
    pub(crate) fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub(crate) fn seal(&self, in_out: &mut [u8], nonce: [u8; NONCE_LENGTH]) {
        let (payload, tag_out) = in_out.split_at_mut(in_out.len() - TAG_LENGTH);
        let tag = self
            .cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), &[], payload)
            .expect("seal failed, this should never happen");
        tag_out.copy_from_slice(&tag);
    }

    pub(crate) fn open(&self, in_out: &mut [u8], nonce: [u8; NONCE_LENGTH]) -> Result<(), ()> {
        let (payload, tag) = in_out.split_at_mut(in_out.len() - TAG_LENGTH);
        let tag = Tag::clone_from_slice(tag);
        self.cipher
            .decrypt_in_place_detached(XNonce::from_slice(&nonce), &[], payload, &tag)
            .map_err(|_| ())
    }
}

impl Debug for SealCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealCipher").finish_non_exhaustive()
    }
}

/// An endless keystream shared between the two peers, used for the
/// reshaping codec's bit shuffle and table construction.
///
/// Both ends must consume it in exactly the same order; one skipped draw
/// desynchronizes every subsequent block.
pub(crate) struct KeyStream {
    reader: blake3::OutputReader,
}

impl KeyStream {
    pub(crate) fn new(key: &[u8; KEY_LENGTH], iv: &[u8; NONCE_PREFIX_LENGTH]) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(key);
        hasher.update(iv);
        Self {
            reader: hasher.finalize_xof(),
        }
    }

    pub(crate) fn fill(&mut self, dst: &mut [u8]) {
        self.reader.fill(dst);
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut block = [0u8; 8];
        self.fill(&mut block);
        u64::from_le_bytes(block)
    }
}

impl Debug for KeyStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStream").finish_non_exhaustive()
    }
}
