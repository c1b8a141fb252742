//! Session establishment: shared-key verification and transport key
//! selection.
//!
//! At connect-verification time the server mints a [`SessionAuth`]
//! holding a fresh 32-byte random value. The base64 form of that value
//! goes back to the client in a response header; the client answers
//! with `HMAC-SHA512(shared_key, random)[0..32]`. Verification is
//! constant-time, and a failed attempt is throttled with a fixed delay
//! before the embedder gets the rejection.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_lc_rs::constant_time::verify_slices_are_equal;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::time::sleep;

use crate::{
    crypto::{derive_auth_key, derive_transport_key, SessionRandom, TransportKey},
    error::AuthError,
    spec::{AUTH_KEY_LEN, KEY_TIME_BUCKET_SECS},
};

/// Delay applied before reporting a failed auth attempt.
const AUTH_FAILURE_DELAY: Duration = Duration::from_millis(500);

/// Per-session auth state.
#[derive(Debug)]
pub struct SessionAuth {
    random: SessionRandom,
    shared_key: Option<String>,
    auth_key: [u8; AUTH_KEY_LEN],
}

impl SessionAuth {
    /// Creates the auth state for one session, minting a fresh random
    /// value. `shared_key` is the configured secret; when absent, the
    /// random value itself keys the derivations.
    pub fn new(shared_key: Option<String>) -> Self {
        Self::with_random(shared_key, SessionRandom::from_entropy())
    }

    /// Creates the auth state with a caller-provided random value.
    ///
    /// **Warning**: `random` must come from a cryptographically secure
    /// entropy source. For general use, prefer [`SessionAuth::new`].
    pub fn with_random(shared_key: Option<String>, random: SessionRandom) -> Self {
        let secret = match &shared_key {
            Some(k) if !k.is_empty() => k.as_bytes().to_vec(),
            _ => random.as_bytes().to_vec(),
        };
        let auth_key = derive_auth_key(&secret, random.as_bytes());
        Self {
            random,
            shared_key,
            auth_key,
        }
    }

    /// The base64 form of the session random value, for the
    /// connect-verification response header.
    pub fn random_key(&self) -> String {
        STANDARD.encode(self.random.as_bytes())
    }

    /// Verifies the auth key presented by the client.
    ///
    /// The comparison is constant-time. On mismatch (or wrong length)
    /// this sleeps 500 ms before returning, throttling brute force.
    pub async fn verify(&self, presented: &[u8]) -> Result<(), AuthError> {
        if presented.len() == AUTH_KEY_LEN
            && verify_slices_are_equal(presented, &self.auth_key).is_ok()
        {
            return Ok(());
        }
        sleep(AUTH_FAILURE_DELAY).await;
        Err(AuthError::KeyRejected)
    }

    /// The transport key for the current wall-clock time bucket.
    pub fn transport_key(&self) -> TransportKey {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        self.transport_key_at(now)
    }

    /// The transport key for the bucket containing `unix_seconds`.
    ///
    /// The bucket granularity defends against key reuse across quick
    /// reconnects.
    pub fn transport_key_at(&self, unix_seconds: u64) -> TransportKey {
        let secret: &[u8] = match &self.shared_key {
            Some(k) if !k.is_empty() => k.as_bytes(),
            _ => self.random.as_bytes(),
        };
        derive_transport_key(secret, unix_seconds / KEY_TIME_BUCKET_SECS)
    }
}
