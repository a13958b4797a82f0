//! Denylist and access analytics behind a storage seam

use crate::claims::TokenClaims;
use dashmap::DashMap;
use restage_types::{ResourceId, Timestamp, TokenId};
use serde::{Deserialize, Serialize};

/// Usage record of one issued grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub token_id: TokenId,
    pub resource_id: ResourceId,
    pub issuer_identity: String,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub access_count: u64,
    pub last_accessed_at: Option<Timestamp>,
    /// Revoked directly; a revoked ancestor in `lineage` also disables it
    pub revoked: bool,
    /// Grants this one was re-shared from, nearest first
    #[serde(default)]
    pub lineage: Vec<TokenId>,
}

impl AccessRecord {
    fn from_claims(claims: &TokenClaims) -> Self {
        Self {
            token_id: claims.token_id,
            resource_id: claims.resource_id.clone(),
            issuer_identity: claims.issuer_identity.clone(),
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
            access_count: 0,
            last_accessed_at: None,
            revoked: false,
            lineage: claims.lineage.clone(),
        }
    }
}

/// Side state of the token service
///
/// Reads must fail closed: a store that cannot answer `is_revoked` should
/// report `true`.
pub trait TokenStore: Send + Sync {
    /// Remember a freshly issued grant
    fn record_issue(&self, claims: &TokenClaims);

    /// Bump the access counter, creating the record if this process never
    /// saw the issue
    fn record_access(&self, claims: &TokenClaims, at: Timestamp) -> AccessRecord;

    /// Add to the denylist until `expires_at`
    fn revoke(&self, token_id: TokenId, expires_at: Timestamp);

    /// Whether `token_id` is on the denylist
    fn is_revoked(&self, token_id: &TokenId) -> bool;

    /// Drop denylist entries whose token has expired anyway; returns how many
    fn purge_revocations(&self, now: Timestamp) -> usize;

    /// Analytics of one grant, if it was seen
    fn record(&self, token_id: &TokenId) -> Option<AccessRecord>;

    /// Every record on a resource, oldest first
    fn records_for_resource(&self, resource_id: &ResourceId) -> Vec<AccessRecord>;

    /// Every record minted by an issuer, oldest first
    fn records_for_issuer(&self, issuer_identity: &str) -> Vec<AccessRecord>;
}

/// In-process token store
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    denylist: DashMap<TokenId, Timestamp>,
    records: DashMap<TokenId, AccessRecord>,
}

impl InMemoryTokenStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current denylist size
    #[must_use]
    pub fn denylist_len(&self) -> usize {
        self.denylist.len()
    }
}

impl TokenStore for InMemoryTokenStore {
    fn record_issue(&self, claims: &TokenClaims) {
        self.records
            .entry(claims.token_id)
            .or_insert_with(|| AccessRecord::from_claims(claims));
    }

    fn record_access(&self, claims: &TokenClaims, at: Timestamp) -> AccessRecord {
        let mut record = self
            .records
            .entry(claims.token_id)
            .or_insert_with(|| AccessRecord::from_claims(claims));
        record.access_count += 1;
        record.last_accessed_at = Some(at);
        record.clone()
    }

    fn revoke(&self, token_id: TokenId, expires_at: Timestamp) {
        self.denylist.insert(token_id, expires_at);
        if let Some(mut record) = self.records.get_mut(&token_id) {
            record.revoked = true;
        }
    }

    fn is_revoked(&self, token_id: &TokenId) -> bool {
        self.denylist.contains_key(token_id)
    }

    fn purge_revocations(&self, now: Timestamp) -> usize {
        let mut purged = 0;
        self.denylist.retain(|_, expires_at| {
            let keep = *expires_at > now;
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    fn record(&self, token_id: &TokenId) -> Option<AccessRecord> {
        self.records.get(token_id).map(|r| r.clone())
    }

    fn records_for_resource(&self, resource_id: &ResourceId) -> Vec<AccessRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| &r.resource_id == resource_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.issued_at);
        records
    }

    fn records_for_issuer(&self, issuer_identity: &str) -> Vec<AccessRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.issuer_identity == issuer_identity)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.issued_at);
        records
    }
}
