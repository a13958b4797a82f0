//! Studio: one session API over ledger, queue and share tokens

use crate::config::StudioConfig;
use crate::error::StudioError;
use chrono::Duration;
use restage_ledger::{
    BalanceView, CreditLedger, GrantRequest, InMemoryLedgerStore, Transaction, TransactionFilter,
    UsageStats,
};
use restage_queue::{
    EditEvent, EditExecutor, EditParameters, EditQueue, OperationTicket, QueueStatus,
    ResourceVersion,
};
use restage_token::{
    signing_key_from_seed, AccessRecord, InMemoryTokenStore, IssueRequest, IssuedToken,
    Permissions, TokenClaims, TokenService, Validation,
};
use restage_types::{AccountId, Clock, ResourceId, ResourceLocator, SystemClock, TokenId};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Session-level facade used by agents and share-link holders
///
/// Agents act as their account; buyers act through a share token that
/// names the image, the paying account and what they may do.
pub struct Studio {
    config: StudioConfig,
    ledger: Arc<CreditLedger>,
    tokens: TokenService,
    queue: EditQueue,
}

impl std::fmt::Debug for Studio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Studio")
            .field("ledger", &self.ledger)
            .field("tokens", &self.tokens)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Studio {
    /// Studio on the system clock
    #[must_use]
    pub fn new(config: StudioConfig, executor: Arc<dyn EditExecutor>) -> Self {
        Self::with_clock(config, executor, Arc::new(SystemClock))
    }

    /// Studio whose components all read `clock`
    #[must_use]
    pub fn with_clock(
        config: StudioConfig,
        executor: Arc<dyn EditExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger = Arc::new(CreditLedger::with_parts(
            config.ledger,
            Arc::new(InMemoryLedgerStore::new()),
            Arc::clone(&clock),
        ));

        let signing_key = match config.signing_secret.as_deref() {
            Some(secret) => signing_key_from_seed(secret),
            None => TokenService::random_key(),
        };
        let tokens = TokenService::with_parts(
            signing_key,
            config.tokens,
            Arc::new(InMemoryTokenStore::new()),
            Arc::clone(&clock),
        );

        let queue = EditQueue::with_parts(
            config.queue,
            config.costs.clone(),
            Arc::clone(&ledger),
            executor,
            clock,
        );

        Self {
            config,
            ledger,
            tokens,
            queue,
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    #[inline]
    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[inline]
    #[must_use]
    pub fn queue(&self) -> &EditQueue {
        &self.queue
    }

    /// Register an uploaded listing photo, billed to `account`
    ///
    /// # Errors
    /// `StudioError::Queue` if the image is already billed to someone else.
    pub fn open_listing_image(
        &self,
        account: &AccountId,
        image: ResourceId,
        locator: ResourceLocator,
    ) -> Result<QueueStatus, StudioError> {
        // Provision the account so its starting grant shows up right away
        self.ledger.balance(account)?;
        Ok(self.queue.open_resource(image, account.clone(), locator)?)
    }

    /// Submit an edit as the account that owns the image
    ///
    /// # Errors
    /// - `StudioError::NotOwner` if `account` is not billed for `image`
    /// - `StudioError::Queue` for unknown images or kinds
    pub fn submit_as_account(
        &self,
        account: &AccountId,
        image: &ResourceId,
        kind: &str,
        parameters: EditParameters,
        mask: Option<String>,
    ) -> Result<OperationTicket, StudioError> {
        self.ensure_owner(account, image)?;
        Ok(self.queue.submit_named(image, kind, parameters, mask)?)
    }

    /// Submit an edit through a share link
    ///
    /// The link must validate, allow editing and name `image`. The edit is
    /// billed to the account that issued the link and counted as one access.
    ///
    /// # Errors
    /// - `StudioError::Access` with the structured reason for a bad link
    /// - `StudioError::PermissionDenied` without `can_edit`
    /// - `StudioError::WrongResource` if the link is for another image
    /// - `StudioError::NotOwner` if the issuing account no longer owns it
    pub fn submit_with_token(
        &self,
        token: &str,
        image: &ResourceId,
        kind: &str,
        parameters: EditParameters,
        mask: Option<String>,
    ) -> Result<OperationTicket, StudioError> {
        let claims = self.authorize(token, image)?;
        if !claims.permissions.can_edit {
            return Err(StudioError::PermissionDenied { permission: "edit" });
        }
        self.ensure_owner(&claims.issuer_account, image)?;

        let ticket = self.queue.submit_named(image, kind, parameters, mask)?;
        self.tokens.track_access(token)?;
        tracing::info!(
            token = %claims.token_id,
            resource = %image,
            operation = %ticket.id(),
            "edit submitted through share link"
        );
        Ok(ticket)
    }

    /// Current image for a share-link holder
    ///
    /// Counts as one access.
    ///
    /// # Errors
    /// Same link checks as [`submit_with_token`](Self::submit_with_token),
    /// without requiring `can_edit`.
    pub fn view_with_token(
        &self,
        token: &str,
        image: &ResourceId,
    ) -> Result<QueueStatus, StudioError> {
        self.authorize(token, image)?;
        let status = self.queue.status(image)?;
        self.tokens.track_access(token)?;
        Ok(status)
    }

    /// Balance and advisory warning level
    ///
    /// # Errors
    /// Ledger store failures.
    pub fn balance(&self, account: &AccountId) -> Result<BalanceView, StudioError> {
        Ok(self.ledger.balance_with_warning(account)?)
    }

    /// Record a credit purchase
    ///
    /// # Errors
    /// `StudioError::Ledger` for a zero amount.
    pub fn purchase_credits(
        &self,
        account: &AccountId,
        amount: u64,
        description: impl Into<String>,
    ) -> Result<Transaction, StudioError> {
        Ok(self
            .ledger
            .grant(account, GrantRequest::purchase(amount, description))?)
    }

    /// Issue a share link for an image the account owns
    ///
    /// # Errors
    /// - `StudioError::NotOwner`
    /// - `StudioError::Token` for an unusable lifetime
    pub fn share(
        &self,
        account: &AccountId,
        issuer_identity: &str,
        image: &ResourceId,
        permissions: Permissions,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken, StudioError> {
        self.ensure_owner(account, image)?;
        let mut request = IssueRequest::new(image.clone(), account.clone(), issuer_identity)
            .with_permissions(permissions);
        if let Some(ttl) = ttl {
            request = request.with_ttl(ttl);
        }
        let issued = self.tokens.issue(request)?;
        tracing::info!(
            token = %issued.token_id,
            resource = %image,
            expires_at = %issued.expires_at,
            "share link issued"
        );
        Ok(issued)
    }

    /// Derive a narrower link from a re-shareable one
    ///
    /// # Errors
    /// `StudioError::Token` if the parent is invalid, not re-shareable or
    /// the request escalates permissions.
    pub fn reshare(
        &self,
        parent_token: &str,
        holder_identity: &str,
        permissions: Permissions,
        ttl: Option<Duration>,
    ) -> Result<IssuedToken, StudioError> {
        Ok(self
            .tokens
            .reshare(parent_token, holder_identity, permissions, ttl)?)
    }

    /// Check a share link without counting an access
    #[must_use]
    pub fn validate_share(&self, token: &str) -> Validation {
        self.tokens.validate(token)
    }

    /// Withdraw a share link
    ///
    /// # Errors
    /// `StudioError::Token` if the link is not authentic.
    pub fn revoke_share(&self, token: &str) -> Result<TokenId, StudioError> {
        Ok(self.tokens.revoke(token)?)
    }

    /// Who holds links to `image` and how often they were used
    #[must_use]
    pub fn share_analytics(&self, image: &ResourceId) -> Vec<AccessRecord> {
        self.tokens.access_records(image)
    }

    /// Links minted by `issuer_identity` that still work
    #[must_use]
    pub fn active_shares(&self, issuer_identity: &str) -> Vec<AccessRecord> {
        self.tokens.active_grants(issuer_identity)
    }

    /// Transaction history, newest first
    ///
    /// # Errors
    /// Ledger store failures.
    pub fn transactions(
        &self,
        account: &AccountId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, StudioError> {
        Ok(self.ledger.transactions(account, filter)?)
    }

    /// Usage over the trailing `window_days`
    ///
    /// # Errors
    /// Ledger store failures.
    pub fn usage_stats(&self, account: &AccountId, window_days: u32) -> Result<UsageStats, StudioError> {
        Ok(self.ledger.usage_stats(account, window_days)?)
    }

    /// Depth and in-flight edit for an image
    ///
    /// # Errors
    /// `StudioError::Queue` for an unknown image.
    pub fn queue_status(&self, image: &ResourceId) -> Result<QueueStatus, StudioError> {
        Ok(self.queue.status(image)?)
    }

    /// Version chain of an image, oldest first
    ///
    /// # Errors
    /// `StudioError::Queue` for an unknown image.
    pub fn image_versions(&self, image: &ResourceId) -> Result<Vec<ResourceVersion>, StudioError> {
        Ok(self.queue.versions(image)?)
    }

    /// Edit notifications for every image
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EditEvent> {
        self.queue.subscribe()
    }

    fn ensure_owner(&self, account: &AccountId, image: &ResourceId) -> Result<(), StudioError> {
        if &self.queue.account_of(image)? == account {
            Ok(())
        } else {
            Err(StudioError::NotOwner {
                account: account.clone(),
                resource: image.clone(),
            })
        }
    }

    fn authorize(&self, token: &str, image: &ResourceId) -> Result<TokenClaims, StudioError> {
        let claims = match self.tokens.validate(token) {
            Validation::Valid(claims) => claims,
            Validation::Invalid(reason) => {
                tracing::info!(resource = %image, %reason, "share link rejected");
                return Err(StudioError::Access(reason));
            }
        };
        if &claims.resource_id != image {
            return Err(StudioError::WrongResource {
                granted: claims.resource_id,
                requested: image.clone(),
            });
        }
        Ok(claims)
    }
}
