//! Crypto interface.
//!
//! This module provides the key material newtypes, the HMAC-SHA512
//! key derivations and the per-direction AES-128-GCM cipher used by
//! the session transport.

use core::fmt::{Debug, Formatter};

use aws_lc_rs::{
    aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM},
    hmac,
};
use rand::{rngs::OsRng, TryRngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    error::TransportError,
    spec::{AUTH_KEY_LEN, NONCE_LEN, SESSION_RANDOM_LEN, TAG_LEN, TRANSPORT_KEY_LEN},
};

/// The per-session 256-bit random value generated at
/// connect-verification time.
///
/// It is handed to the client base64-encoded, feeds the auth key
/// derivation, and stands in for the shared key when none is
/// configured.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct SessionRandom([u8; SESSION_RANDOM_LEN]);

impl SessionRandom {
    /// Generates a new `SessionRandom` from system entropy.
    pub fn from_entropy() -> Self {
        let mut key = [0u8; SESSION_RANDOM_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .expect("system random source failure");
        Self(key)
    }

    /// Get a reference to the random bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_RANDOM_LEN] {
        &self.0
    }
}

impl From<[u8; SESSION_RANDOM_LEN]> for SessionRandom {
    fn from(value: [u8; SESSION_RANDOM_LEN]) -> Self {
        Self(value)
    }
}

impl Debug for SessionRandom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionRandom").field(&"*****").finish()
    }
}

/// The 128-bit AEAD key protecting one session's transport frames.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct TransportKey([u8; TRANSPORT_KEY_LEN]);

impl TransportKey {
    /// Get a reference to the key's bytes.
    pub(crate) fn as_bytes(&self) -> &[u8; TRANSPORT_KEY_LEN] {
        &self.0
    }
}

impl From<[u8; TRANSPORT_KEY_LEN]> for TransportKey {
    fn from(value: [u8; TRANSPORT_KEY_LEN]) -> Self {
        Self(value)
    }
}

impl Debug for TransportKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TransportKey").field(&"*****").finish()
    }
}

/// Derives the 32-byte auth key the client must present:
/// `HMAC-SHA512(key = secret, msg = random)[0..32]`.
pub(crate) fn derive_auth_key(secret: &[u8], random: &[u8]) -> [u8; AUTH_KEY_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA512, secret);
    let tag = hmac::sign(&key, random);
    let mut out = [0u8; AUTH_KEY_LEN];
    out.copy_from_slice(&tag.as_ref()[..AUTH_KEY_LEN]);
    out
}

/// Derives the transport key for a wall-clock time bucket:
/// `HMAC-SHA512(key = secret, msg = ascii-decimal(bucket))[0..16]`.
pub(crate) fn derive_transport_key(secret: &[u8], bucket: u64) -> TransportKey {
    let key = hmac::Key::new(hmac::HMAC_SHA512, secret);
    let tag = hmac::sign(&key, bucket.to_string().as_bytes());
    let mut out = [0u8; TRANSPORT_KEY_LEN];
    out.copy_from_slice(&tag.as_ref()[..TRANSPORT_KEY_LEN]);
    TransportKey(out)
}

/// A 96-bit nonce counter, incremented from the last byte with carry
/// after every frame.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct CounterNonce([u8; NONCE_LEN]);

impl CounterNonce {
    /// Returns the current nonce and advances the counter.
    pub(crate) fn next(&mut self) -> [u8; NONCE_LEN] {
        let current = self.0;
        for i in (0..NONCE_LEN).rev() {
            self.0[i] = self.0[i].wrapping_add(1);
            if self.0[i] != 0 {
                break;
            }
        }
        current
    }
}

impl From<[u8; NONCE_LEN]> for CounterNonce {
    fn from(value: [u8; NONCE_LEN]) -> Self {
        Self(value)
    }
}

/// One direction of the session transport: an AES-128-GCM key bound to
/// its own nonce counter.
///
/// Read and write directions each get their own `DirectionCipher` even
/// though the key material is identical, so no AEAD state is shared
/// across tasks.
pub(crate) struct DirectionCipher {
    key: LessSafeKey,
    nonce: CounterNonce,
}

impl DirectionCipher {
    pub(crate) fn new(key: &TransportKey, initial_nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            key: LessSafeKey::new(
                UnboundKey::new(&AES_128_GCM, key.as_bytes()).expect("AES-128-GCM key length"),
            ),
            nonce: CounterNonce::from(initial_nonce),
        }
    }

    /// Seals `plaintext`, returning ciphertext with the tag appended.
    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; plaintext.len() + TAG_LEN];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        let (in_out, tag) = buf.split_at_mut(plaintext.len());
        let t = self
            .key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(self.nonce.next()),
                Aad::empty(),
                in_out,
            )
            .expect("encrypt failed, this should never happen");
        tag.copy_from_slice(t.as_ref());
        buf
    }

    /// Opens `ciphertext` (tag included), returning the plaintext.
    pub(crate) fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut buf = ciphertext.to_vec();
        let nonce = Nonce::assume_unique_for_key(self.nonce.next());
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| TransportError::OpenFailed)?
            .len();
        buf.truncate(plaintext_len);
        Ok(buf)
    }
}

impl Debug for DirectionCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionCipher")
            .field("key", &"*****")
            .field("nonce", &self.nonce)
            .finish()
    }
}
