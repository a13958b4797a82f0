//! Credit ledger
//!
//! Every balance change goes through [`CreditLedger::deduct`] or
//! [`CreditLedger::grant`]; both build the next account row and its
//! transaction inside a single store update, so a concurrent caller always
//! sees either the whole change or none of it.

use crate::error::LedgerError;
use crate::stats::UsageStats;
use crate::store::{InMemoryLedgerStore, LedgerStore};
use crate::types::{
    Account, GrantRequest, Transaction, TransactionFilter, TransactionKind, UsageMetadata,
    WarningLevel, WarningThresholds,
};
use chrono::Duration;
use restage_types::{AccountId, Clock, SystemClock, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ledger configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Credits given to an account on first reference
    pub starting_grant: u64,
    /// Length of a billing period in days
    pub billing_period_days: u32,
    pub thresholds: WarningThresholds,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_grant: 1000,
            billing_period_days: 30,
            thresholds: WarningThresholds::default(),
        }
    }
}

impl LedgerConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With starting grant
    #[inline]
    #[must_use]
    pub fn with_starting_grant(mut self, credits: u64) -> Self {
        self.starting_grant = credits;
        self
    }

    /// With billing period length
    #[inline]
    #[must_use]
    pub fn with_billing_period_days(mut self, days: u32) -> Self {
        self.billing_period_days = days;
        self
    }

    fn billing_period(&self) -> Duration {
        Duration::days(i64::from(self.billing_period_days.max(1)))
    }
}

/// Balance plus its advisory warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub account: Account,
    pub remaining: u64,
    pub warning: WarningLevel,
}

/// Result of replaying an account's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub account_id: AccountId,
    pub entries: usize,
    /// Sum of all amounts starting from zero
    pub replayed_balance: i128,
    pub recorded_remaining: u64,
    /// Entries whose snapshot does not chain from the previous one
    pub broken_entries: Vec<TransactionId>,
}

impl AuditReport {
    /// Log replay reproduces the balance and every entry chains
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.broken_entries.is_empty()
            && self.replayed_balance == i128::from(self.recorded_remaining)
    }
}

/// The accounting engine
pub struct CreditLedger {
    config: LedgerConfig,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CreditLedger {
    /// In-memory ledger on the system clock
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Ledger over a specific store and clock
    #[must_use]
    pub fn with_parts(
        config: LedgerConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Current account state, provisioning it on first reference
    ///
    /// # Errors
    /// Store failures only.
    pub fn balance(&self, account_id: &AccountId) -> Result<Account, LedgerError> {
        self.ensure_account(account_id)
    }

    /// Balance with its warning level
    ///
    /// # Errors
    /// Store failures only.
    pub fn balance_with_warning(&self, account_id: &AccountId) -> Result<BalanceView, LedgerError> {
        let account = self.ensure_account(account_id)?;
        let remaining = account.remaining();
        Ok(BalanceView {
            warning: self.warning_level(remaining),
            remaining,
            account,
        })
    }

    /// Advisory level for a balance
    #[must_use]
    pub fn warning_level(&self, remaining: u64) -> WarningLevel {
        WarningLevel::for_remaining(remaining, &self.config.thresholds)
    }

    /// Whether `amount` could be spent right now
    ///
    /// # Errors
    /// - `LedgerError::InvalidAmount` if `amount` is zero
    pub fn has_sufficient_credits(
        &self,
        account_id: &AccountId,
        amount: u64,
    ) -> Result<bool, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("cost must be positive".into()));
        }
        Ok(self.ensure_account(account_id)?.remaining() >= amount)
    }

    /// Spend credits
    ///
    /// Checks `remaining >= cost` and applies the charge in one indivisible
    /// store update.
    ///
    /// # Errors
    /// - `LedgerError::InsufficientCredits` with the required cost and the
    ///   balance observed; nothing is recorded
    /// - `LedgerError::InvalidAmount` if `cost` is zero
    pub fn deduct(
        &self,
        account_id: &AccountId,
        cost: u64,
        metadata: UsageMetadata,
    ) -> Result<Transaction, LedgerError> {
        let amount = signed_amount(cost)?;
        self.ensure_account(account_id)?;

        let period = self.config.billing_period();
        let now = self.clock.now();

        let result = self.store.update(account_id, &mut |account, _log| {
            let remaining = account.remaining();
            if remaining < cost {
                return Err(LedgerError::InsufficientCredits {
                    required: cost,
                    remaining,
                });
            }

            let mut next = account.clone();
            next.roll_period(now, period);
            next.consumed_credits += cost;
            next.consumed_this_period += cost;
            next.last_mutated = now;

            let description = metadata.description.clone().unwrap_or_else(|| {
                format!(
                    "{} edit",
                    metadata.operation.as_deref().unwrap_or("unspecified")
                )
            });

            let txn = Transaction {
                id: TransactionId::new(),
                account_id: account.id.clone(),
                amount: -amount,
                kind: TransactionKind::Usage,
                operation: metadata.operation.clone(),
                resource_id: metadata.resource_id.clone(),
                reverses: None,
                description,
                created_at: now,
                balance_before: remaining,
                balance_after: next.remaining(),
            };
            Ok((next, txn))
        });

        match &result {
            Ok(txn) => tracing::debug!(
                account = %account_id,
                cost,
                balance = txn.balance_after,
                "credits deducted"
            ),
            Err(LedgerError::InsufficientCredits { remaining, .. }) => tracing::info!(
                account = %account_id,
                cost,
                remaining,
                "deduct refused: insufficient credits"
            ),
            Err(e) => tracing::warn!(account = %account_id, "deduct failed: {e}"),
        }
        result
    }

    /// Add credits: purchase, adjustment or refund
    ///
    /// Purchases and adjustments raise the account total. Refunds roll back
    /// consumption and may name the usage entry they reverse.
    ///
    /// # Errors
    /// - `LedgerError::InvalidAmount` if the amount is zero or overflows
    /// - `LedgerError::UnsupportedGrantKind` for `Usage`
    /// - `LedgerError::RefundExceedsConsumed` if the refund is larger than
    ///   what was consumed
    /// - `LedgerError::InvalidReversal` for a bad back-reference
    pub fn grant(
        &self,
        account_id: &AccountId,
        request: GrantRequest,
    ) -> Result<Transaction, LedgerError> {
        let amount = signed_amount(request.amount)?;
        if request.kind == TransactionKind::Usage {
            return Err(LedgerError::UnsupportedGrantKind(request.kind));
        }
        if request.reverses.is_some() && request.kind != TransactionKind::Refund {
            return Err(LedgerError::InvalidReversal(
                "only refunds may reverse a usage entry".into(),
            ));
        }
        self.ensure_account(account_id)?;

        let period = self.config.billing_period();
        let now = self.clock.now();

        let txn = self.store.update(account_id, &mut |account, log| {
            let mut next = account.clone();
            next.roll_period(now, period);

            match request.kind {
                TransactionKind::Refund => {
                    if request.amount > account.consumed_credits {
                        return Err(LedgerError::RefundExceedsConsumed {
                            amount: request.amount,
                            consumed: account.consumed_credits,
                        });
                    }
                    if let Some(usage_id) = request.reverses {
                        check_reversal(log, usage_id, request.amount)?;
                    }
                    next.consumed_credits -= request.amount;
                    next.consumed_this_period =
                        next.consumed_this_period.saturating_sub(request.amount);
                }
                TransactionKind::Purchase | TransactionKind::Adjustment => {
                    next.total_credits = next
                        .total_credits
                        .checked_add(request.amount)
                        .ok_or_else(|| LedgerError::InvalidAmount("total overflow".into()))?;
                }
                TransactionKind::Usage => {
                    return Err(LedgerError::UnsupportedGrantKind(request.kind));
                }
            }
            next.last_mutated = now;

            let txn = Transaction {
                id: TransactionId::new(),
                account_id: account.id.clone(),
                amount,
                kind: request.kind,
                operation: None,
                resource_id: request.resource_id.clone(),
                reverses: request.reverses,
                description: request.description.clone(),
                created_at: now,
                balance_before: account.remaining(),
                balance_after: next.remaining(),
            };
            Ok((next, txn))
        })?;

        tracing::info!(
            account = %account_id,
            kind = ?txn.kind,
            amount = txn.amount,
            balance = txn.balance_after,
            "credits granted"
        );
        Ok(txn)
    }

    /// History, newest first
    ///
    /// # Errors
    /// Store failures only.
    pub fn transactions(
        &self,
        account_id: &AccountId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let log = self.store.transactions(account_id)?;
        Ok(log
            .into_iter()
            .rev()
            .filter(|t| filter.matches(t))
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    /// Aggregates over the trailing `window_days`
    ///
    /// # Errors
    /// Store failures only.
    pub fn usage_stats(
        &self,
        account_id: &AccountId,
        window_days: u32,
    ) -> Result<UsageStats, LedgerError> {
        let since = self.window_start(window_days);
        let log = self.store.transactions(account_id)?;
        Ok(UsageStats::aggregate(window_days, since, &log))
    }

    /// Replay the log and check it against the stored balance
    ///
    /// # Errors
    /// Store failures only.
    pub fn audit(&self, account_id: &AccountId) -> Result<AuditReport, LedgerError> {
        let account = self.ensure_account(account_id)?;
        let log = self.store.transactions(account_id)?;

        let mut replayed: i128 = 0;
        let mut broken_entries = Vec::new();
        for txn in &log {
            if !txn.is_balanced() || i128::from(txn.balance_before) != replayed {
                broken_entries.push(txn.id);
            }
            replayed += i128::from(txn.amount);
        }

        Ok(AuditReport {
            account_id: account_id.clone(),
            entries: log.len(),
            replayed_balance: replayed,
            recorded_remaining: account.remaining(),
            broken_entries,
        })
    }

    fn window_start(&self, window_days: u32) -> Timestamp {
        self.clock.now() - Duration::days(i64::from(window_days))
    }

    fn ensure_account(&self, account_id: &AccountId) -> Result<Account, LedgerError> {
        if let Some(account) = self.store.get(account_id)? {
            return Ok(account);
        }

        let now = self.clock.now();
        let mut account = Account::open(account_id.clone(), now);
        account.total_credits = self.config.starting_grant;

        let opening = (self.config.starting_grant > 0)
            .then(|| -> Result<Transaction, LedgerError> {
                Ok(Transaction {
                    id: TransactionId::new(),
                    account_id: account_id.clone(),
                    amount: signed_amount(self.config.starting_grant)?,
                    kind: TransactionKind::Adjustment,
                    operation: None,
                    resource_id: None,
                    reverses: None,
                    description: "starting credit grant".to_string(),
                    created_at: now,
                    balance_before: 0,
                    balance_after: self.config.starting_grant,
                })
            })
            .transpose()?;

        let stored = self.store.insert_if_absent(account, opening)?;
        tracing::debug!(account = %account_id, credits = stored.total_credits, "account provisioned");
        Ok(stored)
    }
}

fn signed_amount(amount: u64) -> Result<i64, LedgerError> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount("amount must be positive".into()));
    }
    i64::try_from(amount).map_err(|_| LedgerError::InvalidAmount(format!("{amount} is too large")))
}

fn check_reversal(log: &[Transaction], usage_id: TransactionId, amount: u64) -> Result<(), LedgerError> {
    let usage = log
        .iter()
        .find(|t| t.id == usage_id)
        .ok_or_else(|| LedgerError::InvalidReversal(format!("{usage_id} not in this account's log")))?;

    if usage.kind != TransactionKind::Usage {
        return Err(LedgerError::InvalidReversal(format!("{usage_id} is not a usage entry")));
    }
    if usage.magnitude() != amount {
        return Err(LedgerError::InvalidReversal(format!(
            "refund of {amount} does not match charge of {}",
            usage.magnitude()
        )));
    }
    if log.iter().any(|t| t.reverses == Some(usage_id)) {
        return Err(LedgerError::InvalidReversal(format!("{usage_id} already refunded")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use restage_types::ManualClock;

    fn ledger() -> CreditLedger {
        CreditLedger::new(LedgerConfig::default())
    }

    fn acme() -> AccountId {
        AccountId::named("acme")
    }

    #[test]
    fn first_reference_provisions_starting_grant() {
        let ledger = ledger();
        let account = ledger.balance(&acme()).unwrap();

        assert_eq!(account.remaining(), 1000);
        assert_eq!(account.total_credits, 1000);

        let log = ledger.transactions(&acme(), &TransactionFilter::new()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, TransactionKind::Adjustment);
        assert_eq!(log[0].balance_before, 0);
    }

    #[test]
    fn balance_has_no_side_effects_after_provisioning() {
        let ledger = ledger();
        ledger.balance(&acme()).unwrap();
        ledger.balance(&acme()).unwrap();
        let log = ledger.transactions(&acme(), &TransactionFilter::new()).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn zero_starting_grant_records_nothing() {
        let ledger = CreditLedger::new(LedgerConfig::new().with_starting_grant(0));
        assert_eq!(ledger.balance(&acme()).unwrap().remaining(), 0);
        assert!(ledger
            .transactions(&acme(), &TransactionFilter::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn has_sufficient_credits_rejects_zero() {
        let ledger = ledger();
        assert!(ledger.has_sufficient_credits(&acme(), 1000).unwrap());
        assert!(!ledger.has_sufficient_credits(&acme(), 1001).unwrap());
        assert!(matches!(
            ledger.has_sufficient_credits(&acme(), 0),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn deduct_updates_all_counters() {
        let ledger = ledger();
        let txn = ledger
            .deduct(&acme(), 2, UsageMetadata::new("remove"))
            .unwrap();

        assert_eq!(txn.amount, -2);
        assert_eq!(txn.balance_before, 1000);
        assert_eq!(txn.balance_after, 998);
        assert_eq!(txn.description, "remove edit");

        let account = ledger.balance(&acme()).unwrap();
        assert_eq!(account.consumed_credits, 2);
        assert_eq!(account.consumed_this_period, 2);
        assert_eq!(account.remaining(), 998);
    }

    #[test]
    fn deduct_refusal_reports_shortfall_and_records_nothing() {
        let ledger = CreditLedger::new(LedgerConfig::new().with_starting_grant(1));
        ledger.deduct(&acme(), 1, UsageMetadata::new("furniture")).unwrap();

        let err = ledger
            .deduct(&acme(), 1, UsageMetadata::new("furniture"))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCredits {
                required: 1,
                remaining: 0
            }
        );
        let log = ledger.transactions(&acme(), &TransactionFilter::new()).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn refund_rolls_back_consumption() {
        let ledger = ledger();
        let usage = ledger.deduct(&acme(), 2, UsageMetadata::new("remove")).unwrap();
        let refund = ledger
            .grant(&acme(), GrantRequest::refund(2, "edit failed").reversing(usage.id))
            .unwrap();

        assert_eq!(refund.amount, 2);
        assert_eq!(refund.reverses, Some(usage.id));
        let account = ledger.balance(&acme()).unwrap();
        assert_eq!(account.remaining(), 1000);
        assert_eq!(account.consumed_credits, 0);
        assert_eq!(account.total_credits, 1000);
    }

    #[test]
    fn refund_cannot_exceed_consumed() {
        let ledger = ledger();
        ledger.deduct(&acme(), 1, UsageMetadata::default()).unwrap();
        let err = ledger.grant(&acme(), GrantRequest::refund(5, "too much")).unwrap_err();
        assert_eq!(
            err,
            LedgerError::RefundExceedsConsumed {
                amount: 5,
                consumed: 1
            }
        );
    }

    #[test]
    fn reversal_must_match_magnitude_and_happen_once() {
        let ledger = ledger();
        let usage = ledger.deduct(&acme(), 2, UsageMetadata::new("exterior")).unwrap();

        let wrong = ledger.grant(&acme(), GrantRequest::refund(1, "partial").reversing(usage.id));
        assert!(matches!(wrong, Err(LedgerError::InvalidReversal(_))));

        ledger
            .grant(&acme(), GrantRequest::refund(2, "failed").reversing(usage.id))
            .unwrap();
        ledger.deduct(&acme(), 2, UsageMetadata::new("exterior")).unwrap();
        let twice = ledger.grant(&acme(), GrantRequest::refund(2, "again").reversing(usage.id));
        assert!(matches!(twice, Err(LedgerError::InvalidReversal(_))));
    }

    #[test]
    fn purchase_raises_total() {
        let ledger = ledger();
        let txn = ledger.grant(&acme(), GrantRequest::purchase(500, "pack")).unwrap();
        assert_eq!(txn.balance_after, 1500);
        assert_eq!(ledger.balance(&acme()).unwrap().total_credits, 1500);
    }

    #[test]
    fn usage_is_not_a_grant_kind() {
        let ledger = ledger();
        let mut request = GrantRequest::purchase(1, "x");
        request.kind = TransactionKind::Usage;
        assert_eq!(
            ledger.grant(&acme(), request),
            Err(LedgerError::UnsupportedGrantKind(TransactionKind::Usage))
        );
    }

    #[test]
    fn transactions_are_newest_first_and_paginated() {
        let ledger = ledger();
        for _ in 0..5 {
            ledger.deduct(&acme(), 1, UsageMetadata::new("walls")).unwrap();
        }

        let page = ledger
            .transactions(
                &acme(),
                &TransactionFilter::new()
                    .of_kind(TransactionKind::Usage)
                    .page(2, 1),
            )
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].balance_after, 996);
        assert_eq!(page[1].balance_after, 997);
    }

    #[test]
    fn billing_period_resets_with_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let ledger = CreditLedger::with_parts(
            LedgerConfig::default(),
            Arc::new(InMemoryLedgerStore::new()),
            clock.clone(),
        );
        ledger.deduct(&acme(), 3, UsageMetadata::default()).unwrap();
        clock.advance(Duration::days(31));
        ledger.deduct(&acme(), 2, UsageMetadata::default()).unwrap();

        let account = ledger.balance(&acme()).unwrap();
        assert_eq!(account.consumed_this_period, 2);
        assert_eq!(account.consumed_credits, 5);
    }

    #[test]
    fn usage_stats_group_by_operation() {
        let ledger = ledger();
        let usage = ledger.deduct(&acme(), 2, UsageMetadata::new("remove")).unwrap();
        ledger.deduct(&acme(), 1, UsageMetadata::new("walls")).unwrap();
        ledger.deduct(&acme(), 1, UsageMetadata::new("walls")).unwrap();
        ledger
            .grant(&acme(), GrantRequest::refund(2, "failed").reversing(usage.id))
            .unwrap();

        let stats = ledger.usage_stats(&acme(), 7).unwrap();
        assert_eq!(stats.total_used, 4);
        assert_eq!(stats.total_refunded, 2);
        assert_eq!(stats.net_used, 2);
        assert_eq!(stats.usage_count, 3);
        assert_eq!(stats.by_operation["walls"], 2);
        assert_eq!(stats.by_operation["remove"], 2);
        assert_eq!(stats.daily.len(), 1);
    }

    #[test]
    fn audit_of_fresh_activity_is_consistent() {
        let ledger = ledger();
        ledger.deduct(&acme(), 7, UsageMetadata::default()).unwrap();
        ledger.grant(&acme(), GrantRequest::purchase(20, "pack")).unwrap();

        let report = ledger.audit(&acme()).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.entries, 3);
        assert_eq!(report.replayed_balance, 1013);
    }

    #[test]
    fn balance_view_carries_warning() {
        let ledger = CreditLedger::new(LedgerConfig::new().with_starting_grant(12));
        ledger.deduct(&acme(), 5, UsageMetadata::default()).unwrap();
        let view = ledger.balance_with_warning(&acme()).unwrap();
        assert_eq!(view.remaining, 7);
        assert_eq!(view.warning, WarningLevel::Critical);
    }
}
