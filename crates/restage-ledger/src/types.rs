//! Ledger data model

use chrono::Duration;
use restage_types::{AccountId, ResourceId, Timestamp, TransactionId};
use serde::{Deserialize, Serialize};

/// A paying entity's credit position
///
/// `remaining = total_credits - consumed_credits`; admission control keeps
/// `consumed_credits <= total_credits`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Paying entity
    pub id: AccountId,
    /// Credits ever granted (starting grant, purchases, adjustments)
    pub total_credits: u64,
    /// Credits spent net of refunds
    pub consumed_credits: u64,
    /// Credits spent in the current billing period
    pub consumed_this_period: u64,
    /// Start of the current billing period
    pub period_started_at: Timestamp,
    /// When the account was provisioned
    pub created_at: Timestamp,
    /// Time of the latest balance change
    pub last_mutated: Timestamp,
}

impl Account {
    /// Empty account opened at `now`
    #[must_use]
    pub fn open(id: AccountId, now: Timestamp) -> Self {
        Self {
            id,
            total_credits: 0,
            consumed_credits: 0,
            consumed_this_period: 0,
            period_started_at: now,
            created_at: now,
            last_mutated: now,
        }
    }

    /// Spendable balance
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.total_credits.saturating_sub(self.consumed_credits)
    }

    /// Start a new billing period if the current one has elapsed
    pub(crate) fn roll_period(&mut self, now: Timestamp, period: Duration) {
        if now >= self.period_started_at + period {
            self.consumed_this_period = 0;
            self.period_started_at = now;
        }
    }
}

/// Category of a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits spent on an edit (negative amount)
    Usage,
    /// Credits bought
    Purchase,
    /// Reversal of a usage charge
    Refund,
    /// Administrative grant, including the starting grant
    Adjustment,
}

/// Immutable record of one balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    /// Negative for usage, positive otherwise
    pub amount: i64,
    pub kind: TransactionKind,
    /// Operation tag (e.g. the edit kind)
    pub operation: Option<String>,
    pub resource_id: Option<ResourceId>,
    /// Usage entry this refund reverses
    pub reverses: Option<TransactionId>,
    pub description: String,
    pub created_at: Timestamp,
    pub balance_before: u64,
    pub balance_after: u64,
}

impl Transaction {
    /// `balance_after == balance_before + amount`
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        i128::from(self.balance_before) + i128::from(self.amount)
            == i128::from(self.balance_after)
    }

    /// Credits moved, regardless of direction
    #[inline]
    #[must_use]
    pub fn magnitude(&self) -> u64 {
        self.amount.unsigned_abs()
    }
}

/// Context attached to a usage charge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageMetadata {
    pub operation: Option<String>,
    pub resource_id: Option<ResourceId>,
    pub description: Option<String>,
}

impl UsageMetadata {
    /// Metadata tagged with an operation name
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    /// With resource reference
    #[must_use]
    pub fn with_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// With description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A credit-increasing ledger request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub amount: u64,
    pub kind: TransactionKind,
    pub description: String,
    pub reverses: Option<TransactionId>,
    pub resource_id: Option<ResourceId>,
}

impl GrantRequest {
    /// Credits bought by the account
    #[must_use]
    pub fn purchase(amount: u64, description: impl Into<String>) -> Self {
        Self::new(amount, TransactionKind::Purchase, description)
    }

    /// Administrative grant
    #[must_use]
    pub fn adjustment(amount: u64, description: impl Into<String>) -> Self {
        Self::new(amount, TransactionKind::Adjustment, description)
    }

    /// Reversal of a prior usage charge
    #[must_use]
    pub fn refund(amount: u64, description: impl Into<String>) -> Self {
        Self::new(amount, TransactionKind::Refund, description)
    }

    fn new(amount: u64, kind: TransactionKind, description: impl Into<String>) -> Self {
        Self {
            amount,
            kind,
            description: description.into(),
            reverses: None,
            resource_id: None,
        }
    }

    /// Link the refund to the usage entry it reverses
    #[must_use]
    pub fn reversing(mut self, usage: TransactionId) -> Self {
        self.reverses = Some(usage);
        self
    }

    /// With resource reference
    #[must_use]
    pub fn with_resource(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }
}

/// History query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFilter {
    pub limit: usize,
    pub offset: usize,
    pub kind: Option<TransactionKind>,
    /// Inclusive lower bound
    pub from: Option<Timestamp>,
    /// Inclusive upper bound
    pub to: Option<Timestamp>,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            kind: None,
            from: None,
            to: None,
        }
    }
}

impl TransactionFilter {
    /// Default page
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Page size and offset
    #[must_use]
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Only entries of one kind
    #[must_use]
    pub fn of_kind(mut self, kind: TransactionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Only entries stamped within `[from, to]`
    #[must_use]
    pub fn between(mut self, from: Timestamp, to: Timestamp) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub(crate) fn matches(&self, txn: &Transaction) -> bool {
        self.kind.map_or(true, |k| txn.kind == k)
            && self.from.map_or(true, |from| txn.created_at >= from)
            && self.to.map_or(true, |to| txn.created_at <= to)
    }
}

/// Advisory low-balance level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    None,
    Info,
    Warning,
    Critical,
}

impl WarningLevel {
    /// Classify a balance against thresholds
    #[must_use]
    pub fn for_remaining(remaining: u64, thresholds: &WarningThresholds) -> Self {
        if remaining < thresholds.critical_below {
            Self::Critical
        } else if remaining < thresholds.warning_below {
            Self::Warning
        } else if remaining < thresholds.info_below {
            Self::Info
        } else {
            Self::None
        }
    }
}

/// Balance thresholds for [`WarningLevel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningThresholds {
    pub critical_below: u64,
    pub warning_below: u64,
    pub info_below: u64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            critical_below: 10,
            warning_below: 50,
            info_below: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn warning_levels_follow_thresholds() {
        let t = WarningThresholds::default();
        assert_eq!(WarningLevel::for_remaining(0, &t), WarningLevel::Critical);
        assert_eq!(WarningLevel::for_remaining(9, &t), WarningLevel::Critical);
        assert_eq!(WarningLevel::for_remaining(10, &t), WarningLevel::Warning);
        assert_eq!(WarningLevel::for_remaining(49, &t), WarningLevel::Warning);
        assert_eq!(WarningLevel::for_remaining(50, &t), WarningLevel::Info);
        assert_eq!(WarningLevel::for_remaining(99, &t), WarningLevel::Info);
        assert_eq!(WarningLevel::for_remaining(100, &t), WarningLevel::None);
    }

    #[test]
    fn period_rolls_over_after_elapsed() {
        let start = Utc::now();
        let mut account = Account::open(AccountId::named("a"), start);
        account.consumed_this_period = 7;

        account.roll_period(start + Duration::days(29), Duration::days(30));
        assert_eq!(account.consumed_this_period, 7);

        let later = start + Duration::days(30);
        account.roll_period(later, Duration::days(30));
        assert_eq!(account.consumed_this_period, 0);
        assert_eq!(account.period_started_at, later);
    }

    #[test]
    fn filter_matches_kind_and_range() {
        let now = Utc::now();
        let txn = Transaction {
            id: TransactionId::new(),
            account_id: AccountId::named("a"),
            amount: -1,
            kind: TransactionKind::Usage,
            operation: None,
            resource_id: None,
            reverses: None,
            description: String::new(),
            created_at: now,
            balance_before: 5,
            balance_after: 4,
        };
        assert!(txn.is_balanced());
        assert!(TransactionFilter::new().matches(&txn));
        assert!(TransactionFilter::new()
            .of_kind(TransactionKind::Usage)
            .matches(&txn));
        assert!(!TransactionFilter::new()
            .of_kind(TransactionKind::Refund)
            .matches(&txn));
        assert!(!TransactionFilter::new()
            .between(now + Duration::seconds(1), now + Duration::seconds(2))
            .matches(&txn));
    }
}
