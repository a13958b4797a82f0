//! Signing key derivation

use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};

/// Derive a stable signing key from a configured secret
///
/// Deployments configure one secret string; every process that shares it
/// can validate the others' tokens.
#[must_use]
pub fn signing_key_from_seed(seed: &str) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(b"restage.signing-key\0");
    hasher.update(seed.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&digest)
}
