//! Signed token claims and their wire form
//!
//! Wire form: `<hex(claims json)>.<hex(ed25519 signature)>`. The signature
//! covers a domain tag followed by the exact claims bytes, so re-encoding
//! the JSON differently invalidates the token.

use crate::error::InvalidReason;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use restage_types::{AccountId, ResourceId, TokenId};
use serde::{Deserialize, Serialize};

const DOMAIN_TAG: &[u8] = b"restage.capability.v1\0";

/// What the holder may do with the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    pub can_edit: bool,
    pub can_download: bool,
    /// Whether the holder may mint further grants; off unless set deliberately
    #[serde(default)]
    pub can_reshare: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            can_edit: true,
            can_download: true,
            can_reshare: false,
        }
    }
}

impl Permissions {
    /// View and download only
    #[must_use]
    pub fn view_only() -> Self {
        Self {
            can_edit: false,
            can_download: true,
            can_reshare: false,
        }
    }

    /// Explicitly allow re-sharing
    #[must_use]
    pub fn with_reshare(mut self) -> Self {
        self.can_reshare = true;
        self
    }

    /// Every permission in `self` is also held by `other`
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        (!self.can_edit || other.can_edit)
            && (!self.can_download || other.can_download)
            && (!self.can_reshare || other.can_reshare)
    }
}

/// Signed payload of a capability token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub token_id: TokenId,
    pub resource_id: ResourceId,
    /// Account billed for edits made with this grant
    pub issuer_account: AccountId,
    /// Who minted the grant (agent email, or holder for re-shares)
    pub issuer_identity: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    pub permissions: Permissions,
    /// Grants this one was re-shared from, nearest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<TokenId>,
}

impl TokenClaims {
    /// Valid at `now` as far as time is concerned
    #[inline]
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Grant this one was re-shared from
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<TokenId> {
        self.lineage.first().copied()
    }

    fn has_required_fields(&self) -> bool {
        !self.resource_id.as_str().is_empty()
            && !self.issuer_account.as_str().is_empty()
            && !self.issuer_identity.trim().is_empty()
            && self.expires_at > self.issued_at
    }
}

/// Sign claims and produce the wire string
pub(crate) fn encode(claims: &TokenClaims, signing_key: &SigningKey) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_vec(claims)?;
    let signature: Signature = signing_key.sign(&signing_message(&payload));
    Ok(format!(
        "{}.{}",
        hex::encode(&payload),
        hex::encode(signature.to_bytes())
    ))
}

/// Decode a wire string and verify its signature
///
/// Only authentic, complete claims are returned; expiry and revocation are
/// checked by the caller.
pub(crate) fn decode(token: &str, verifying_key: &VerifyingKey) -> Result<TokenClaims, InvalidReason> {
    let (payload_hex, signature_hex) = token.trim().split_once('.').ok_or(InvalidReason::Malformed)?;

    let payload = hex::decode(payload_hex).map_err(|_| InvalidReason::Malformed)?;
    let signature_bytes = hex::decode(signature_hex).map_err(|_| InvalidReason::Malformed)?;
    let signature = Signature::from_slice(&signature_bytes).map_err(|_| InvalidReason::Malformed)?;

    verifying_key
        .verify(&signing_message(&payload), &signature)
        .map_err(|_| InvalidReason::Malformed)?;

    let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| InvalidReason::Malformed)?;
    if !claims.has_required_fields() {
        return Err(InvalidReason::Malformed);
    }
    Ok(claims)
}

fn signing_message(payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN_TAG.len() + payload.len());
    msg.extend_from_slice(DOMAIN_TAG);
    msg.extend_from_slice(payload);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::rngs::OsRng;

    fn claims() -> TokenClaims {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        TokenClaims {
            token_id: TokenId::new(),
            resource_id: ResourceId::named("img-1"),
            issuer_account: AccountId::named("acme"),
            issuer_identity: "agent@acme".into(),
            issued_at: now,
            expires_at: now + Duration::days(7),
            permissions: Permissions::default(),
            lineage: Vec::new(),
        }
    }

    #[test]
    fn default_permissions_deny_reshare() {
        let p = Permissions::default();
        assert!(p.can_edit);
        assert!(p.can_download);
        assert!(!p.can_reshare);
    }

    #[test]
    fn subset_relation() {
        let full = Permissions::default().with_reshare();
        assert!(Permissions::view_only().is_subset_of(&full));
        assert!(Permissions::default().is_subset_of(&full));
        assert!(!full.is_subset_of(&Permissions::default()));
        assert!(!Permissions::default().is_subset_of(&Permissions::view_only()));
    }

    #[test]
    fn encode_then_decode_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let original = claims();
        let token = encode(&original, &key).unwrap();
        assert_eq!(decode(&token, &key.verifying_key()), Ok(original));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let token = encode(&claims(), &key).unwrap();
        assert_eq!(
            decode(&token, &other.verifying_key()),
            Err(InvalidReason::Malformed)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut forged = claims();
        let token = encode(&forged, &key).unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        forged.permissions = forged.permissions.with_reshare();
        let payload = hex::encode(serde_json::to_vec(&forged).unwrap());
        let tampered = format!("{payload}.{signature}");

        assert_eq!(
            decode(&tampered, &key.verifying_key()),
            Err(InvalidReason::Malformed)
        );
    }

    #[test]
    fn garbage_is_malformed_not_a_panic() {
        let key = SigningKey::generate(&mut OsRng).verifying_key();
        for input in ["", ".", "abc", "zz.zz", "00.00", "deadbeef.", ".deadbeef"] {
            assert_eq!(decode(input, &key), Err(InvalidReason::Malformed), "{input:?}");
        }
    }

    #[test]
    fn missing_identity_is_malformed() {
        let key = SigningKey::generate(&mut OsRng);
        let mut c = claims();
        c.issuer_identity = "  ".into();
        let token = encode(&c, &key).unwrap();
        assert_eq!(decode(&token, &key.verifying_key()), Err(InvalidReason::Malformed));
    }
}
