//! Release tokens for early teardown.
//!
//! A token is the keyed BLAKE3 hash of an environment id under a server
//! secret. Only the caller that received it from a successful launch can
//! release that environment, and the service keeps no per-environment state.

use rand::RngCore;
use std::fmt;

const KEY_CONTEXT: &str = "sandbox-preview 2024 environment release token";

#[derive(Clone)]
pub struct ReleaseKey {
    key: [u8; 32],
}

impl ReleaseKey {
    /// Derive the signing key from an operator-supplied secret
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret),
        }
    }

    /// Fresh key for this process; tokens do not survive a restart
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn issue(&self, environment_id: &str) -> String {
        blake3::keyed_hash(&self.key, environment_id.as_bytes())
            .to_hex()
            .to_string()
    }

    /// Constant-time check of a presented token
    pub fn verify(&self, environment_id: &str, token: &str) -> bool {
        match blake3::Hash::from_hex(token.trim()) {
            Ok(presented) => presented == blake3::keyed_hash(&self.key, environment_id.as_bytes()),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReleaseKey(..)")
    }
}
