//! Token service
//!
//! Issues, validates and revokes share grants. Validation checks, in order:
//! 1. Decoding and signature
//! 2. Required fields
//! 3. `now < expires_at`
//! 4. Denylist
//!
//! Expiry is checked before the denylist so that the outcome for an expired
//! token does not depend on whether its denylist entry was purged.

use crate::claims::{self, Permissions, TokenClaims};
use crate::error::{InvalidReason, TokenError, Validation};
use crate::store::{AccessRecord, InMemoryTokenStore, TokenStore};
use chrono::Duration;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use restage_types::{AccountId, Clock, ResourceId, SystemClock, Timestamp, TokenId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Token service configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime used when a request names none
    pub default_ttl_secs: u64,
    /// Upper bound on any grant's lifetime
    pub max_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 7 * 24 * 3600,
            max_ttl_secs: 90 * 24 * 3600,
        }
    }
}

impl TokenConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With default lifetime
    #[inline]
    #[must_use]
    pub fn with_default_ttl_secs(mut self, secs: u64) -> Self {
        self.default_ttl_secs = secs;
        self
    }

    /// With lifetime ceiling
    #[inline]
    #[must_use]
    pub fn with_max_ttl_secs(mut self, secs: u64) -> Self {
        self.max_ttl_secs = secs;
        self
    }
}

/// Parameters of a new grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub resource_id: ResourceId,
    pub issuer_account: AccountId,
    pub issuer_identity: String,
    pub ttl: Option<Duration>,
    pub permissions: Permissions,
}

impl IssueRequest {
    /// Grant with default permissions and lifetime
    #[must_use]
    pub fn new(
        resource_id: ResourceId,
        issuer_account: AccountId,
        issuer_identity: impl Into<String>,
    ) -> Self {
        Self {
            resource_id,
            issuer_account,
            issuer_identity: issuer_identity.into(),
            ttl: None,
            permissions: Permissions::default(),
        }
    }

    /// With lifetime
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// With permissions
    #[must_use]
    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }
}

/// A freshly minted grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Wire form handed to the holder
    pub token: String,
    pub token_id: TokenId,
    pub expires_at: Timestamp,
    pub claims: TokenClaims,
}

/// Issues and checks capability tokens
pub struct TokenService {
    config: TokenConfig,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("config", &self.config)
            .field("verifying_key", &hex::encode(self.verifying_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Service with in-memory side state on the system clock
    #[must_use]
    pub fn new(signing_key: SigningKey, config: TokenConfig) -> Self {
        Self::with_parts(
            signing_key,
            config,
            Arc::new(InMemoryTokenStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Service with a fresh random key
    #[must_use]
    pub fn generate(config: TokenConfig) -> Self {
        Self::new(Self::random_key(), config)
    }

    /// Fresh signing key from the OS RNG
    #[must_use]
    pub fn random_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    /// Service over a specific store and clock
    #[must_use]
    pub fn with_parts(
        signing_key: SigningKey,
        config: TokenConfig,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            config,
            signing_key,
            verifying_key,
            store,
            clock,
        }
    }

    /// Public half of the signing key
    #[inline]
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    /// Mint a grant
    ///
    /// # Errors
    /// - `TokenError::InvalidTtl` if the lifetime is not positive or exceeds
    ///   the configured ceiling
    pub fn issue(&self, request: IssueRequest) -> Result<IssuedToken, TokenError> {
        let ttl = self.resolve_ttl(request.ttl)?;
        let issued_at = whole_seconds(self.clock.now());

        let claims = TokenClaims {
            token_id: TokenId::new(),
            resource_id: request.resource_id,
            issuer_account: request.issuer_account,
            issuer_identity: request.issuer_identity,
            issued_at,
            expires_at: issued_at + ttl,
            permissions: request.permissions,
            lineage: Vec::new(),
        };
        self.sign_and_record(claims)
    }

    /// Check a presented token
    ///
    /// Never fails: every outcome is a [`Validation`].
    #[must_use]
    pub fn validate(&self, token: &str) -> Validation {
        let claims = match claims::decode(token, &self.verifying_key) {
            Ok(claims) => claims,
            Err(reason) => return Validation::Invalid(reason),
        };

        if !claims.is_live_at(self.clock.now()) {
            return Validation::Invalid(InvalidReason::Expired);
        }
        // Revoking a grant also withdraws everything re-shared from it
        if self.store.is_revoked(&claims.token_id)
            || claims.lineage.iter().any(|id| self.store.is_revoked(id))
        {
            return Validation::Invalid(InvalidReason::Revoked);
        }
        Validation::Valid(claims)
    }

    /// Withdraw a grant before its natural expiry
    ///
    /// # Errors
    /// - `TokenError::Invalid(Malformed)` if the token is not authentic
    pub fn revoke(&self, token: &str) -> Result<TokenId, TokenError> {
        let claims = claims::decode(token, &self.verifying_key)?;
        self.store.revoke(claims.token_id, claims.expires_at);
        tracing::info!(token = %claims.token_id, resource = %claims.resource_id, "share grant revoked");
        Ok(claims.token_id)
    }

    /// Withdraw a grant known only by id
    ///
    /// # Errors
    /// - `TokenError::UnknownToken` if this service has no record of it
    pub fn revoke_by_id(&self, token_id: TokenId) -> Result<(), TokenError> {
        let record = self
            .store
            .record(&token_id)
            .ok_or(TokenError::UnknownToken(token_id))?;
        self.store.revoke(token_id, record.expires_at);
        tracing::info!(token = %token_id, resource = %record.resource_id, "share grant revoked");
        Ok(())
    }

    /// Count one use of a grant
    ///
    /// Analytics only: an expired or revoked token can still be counted and
    /// counting never changes validity.
    ///
    /// # Errors
    /// - `TokenError::Invalid(Malformed)` if the token is not authentic
    pub fn track_access(&self, token: &str) -> Result<AccessRecord, TokenError> {
        let claims = claims::decode(token, &self.verifying_key)?;
        let record = self.store.record_access(&claims, self.clock.now());
        tracing::debug!(token = %claims.token_id, count = record.access_count, "share grant accessed");
        Ok(record)
    }

    /// Analytics for every grant on a resource, oldest first
    #[must_use]
    pub fn access_records(&self, resource_id: &ResourceId) -> Vec<AccessRecord> {
        self.store.records_for_resource(resource_id)
    }

    /// Unexpired, unrevoked grants minted by an issuer
    #[must_use]
    pub fn active_grants(&self, issuer_identity: &str) -> Vec<AccessRecord> {
        let now = self.clock.now();
        self.store
            .records_for_issuer(issuer_identity)
            .into_iter()
            .filter(|r| {
                !r.revoked
                    && now < r.expires_at
                    && !r.lineage.iter().any(|id| self.store.is_revoked(id))
            })
            .collect()
    }

    /// Garbage-collect denylist entries of tokens that expired anyway
    pub fn purge_expired_revocations(&self) -> usize {
        let purged = self.store.purge_revocations(self.clock.now());
        if purged > 0 {
            tracing::debug!(purged, "expired revocations purged");
        }
        purged
    }

    /// Mint a child grant from a re-shareable parent
    ///
    /// The child targets the same resource and billing account, holds at
    /// most the parent's permissions and never outlives it.
    ///
    /// # Errors
    /// - `TokenError::Invalid` if the parent does not validate
    /// - `TokenError::ReshareForbidden` if the parent lacks `can_reshare`
    /// - `TokenError::Escalation` if `permissions` exceed the parent's
    pub fn reshare(
        &self,
        parent_token: &str,
        holder_identity: impl Into<String>,
        permissions: Permissions,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken, TokenError> {
        let parent = self.validate(parent_token).into_result()?;
        if !parent.permissions.can_reshare {
            return Err(TokenError::ReshareForbidden);
        }
        if !permissions.is_subset_of(&parent.permissions) {
            return Err(TokenError::Escalation(format!(
                "requested {permissions:?} exceeds {:?}",
                parent.permissions
            )));
        }

        let ttl = self.resolve_ttl(ttl)?;
        let issued_at = whole_seconds(self.clock.now());
        let lineage = std::iter::once(parent.token_id)
            .chain(parent.lineage)
            .collect();
        let claims = TokenClaims {
            token_id: TokenId::new(),
            resource_id: parent.resource_id,
            issuer_account: parent.issuer_account,
            issuer_identity: holder_identity.into(),
            issued_at,
            // Capped at the parent's expiry, so the parent's denylist entry
            // outlasts every child
            expires_at: (issued_at + ttl).min(parent.expires_at),
            permissions,
            lineage,
        };
        self.sign_and_record(claims)
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> Result<Duration, TokenError> {
        let ttl = ttl.unwrap_or_else(|| duration_secs(self.config.default_ttl_secs));
        if ttl < Duration::seconds(1) {
            return Err(TokenError::InvalidTtl("lifetime must be at least one second".into()));
        }
        if ttl > duration_secs(self.config.max_ttl_secs) {
            return Err(TokenError::InvalidTtl(format!(
                "lifetime exceeds {}s",
                self.config.max_ttl_secs
            )));
        }
        Ok(ttl)
    }

    fn sign_and_record(&self, claims: TokenClaims) -> Result<IssuedToken, TokenError> {
        let token = claims::encode(&claims, &self.signing_key)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        self.store.record_issue(&claims);

        tracing::info!(
            token = %claims.token_id,
            resource = %claims.resource_id,
            issuer = %claims.issuer_identity,
            expires_at = %claims.expires_at,
            "share grant issued"
        );

        Ok(IssuedToken {
            token,
            token_id: claims.token_id,
            expires_at: claims.expires_at,
            claims,
        })
    }
}

fn duration_secs(secs: u64) -> Duration {
    const CENTURY_SECS: u64 = 100 * 365 * 24 * 3600;
    Duration::seconds(i64::try_from(secs.min(CENTURY_SECS)).unwrap_or_default())
}

/// Claims carry second precision; truncate so the returned expiry matches
/// what a later decode sees
fn whole_seconds(t: Timestamp) -> Timestamp {
    t - Duration::nanoseconds(i64::from(t.timestamp_subsec_nanos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use restage_types::ManualClock;

    fn service_with_clock() -> (TokenService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let service = TokenService::with_parts(
            SigningKey::generate(&mut OsRng),
            TokenConfig::default(),
            Arc::new(InMemoryTokenStore::new()),
            clock.clone(),
        );
        (service, clock)
    }

    fn request() -> IssueRequest {
        IssueRequest::new(
            ResourceId::named("listing-1"),
            AccountId::named("acme"),
            "agent@acme",
        )
    }

    #[test]
    fn default_ttl_is_seven_days() {
        let (service, _) = service_with_clock();
        let issued = service.issue(request()).unwrap();
        assert_eq!(issued.expires_at - issued.claims.issued_at, Duration::days(7));
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        let (service, _) = service_with_clock();
        let err = service
            .issue(request().with_ttl(Duration::zero()))
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidTtl(_)));
    }

    #[test]
    fn ttl_above_ceiling_is_rejected() {
        let (service, _) = service_with_clock();
        let err = service
            .issue(request().with_ttl(Duration::days(365)))
            .unwrap_err();
        assert!(matches!(err, TokenError::InvalidTtl(_)));
    }

    #[test]
    fn revoke_requires_authentic_token() {
        let (service, _) = service_with_clock();
        assert_eq!(
            service.revoke("not-a-token"),
            Err(TokenError::Invalid(InvalidReason::Malformed))
        );
    }

    #[test]
    fn revoke_by_id_unknown() {
        let (service, _) = service_with_clock();
        let id = TokenId::new();
        assert_eq!(service.revoke_by_id(id), Err(TokenError::UnknownToken(id)));
    }

    #[test]
    fn revoke_by_id_invalidates() {
        let (service, _) = service_with_clock();
        let issued = service.issue(request()).unwrap();
        service.revoke_by_id(issued.token_id).unwrap();
        assert_eq!(
            service.validate(&issued.token).reason(),
            Some(InvalidReason::Revoked)
        );
    }

    #[test]
    fn purge_only_drops_expired_entries() {
        let (service, clock) = service_with_clock();
        let short = service.issue(request().with_ttl(Duration::hours(1))).unwrap();
        let long = service.issue(request().with_ttl(Duration::days(3))).unwrap();
        service.revoke(&short.token).unwrap();
        service.revoke(&long.token).unwrap();

        clock.advance(Duration::hours(2));
        assert_eq!(service.purge_expired_revocations(), 1);
        assert_eq!(
            service.validate(&long.token).reason(),
            Some(InvalidReason::Revoked)
        );
        assert_eq!(
            service.validate(&short.token).reason(),
            Some(InvalidReason::Expired)
        );
    }
}
