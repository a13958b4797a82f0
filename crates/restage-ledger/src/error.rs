//! Ledger errors

use crate::types::TransactionKind;
use restage_types::AccountId;

/// Errors returned by ledger operations
///
/// A failed operation never leaves a partial mutation behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Admission denied: the account cannot cover the cost
    #[error("insufficient credits: {required} required, {remaining} remaining")]
    InsufficientCredits {
        /// Cost that was requested
        required: u64,
        /// Balance at the time of the attempt
        remaining: u64,
    },

    /// Amount was zero or out of range
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// `Usage` entries are only produced by `deduct`
    #[error("{0:?} cannot be granted")]
    UnsupportedGrantKind(TransactionKind),

    /// Refund larger than what the account has consumed
    #[error("refund of {amount} exceeds consumed credits ({consumed})")]
    RefundExceedsConsumed {
        /// Requested refund
        amount: u64,
        /// Credits consumed so far
        consumed: u64,
    },

    /// Back-reference on a refund does not name a reversible usage entry
    #[error("invalid reversal: {0}")]
    InvalidReversal(String),

    /// Store has no row for the account
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Credits missing to admit the attempted spend
    #[inline]
    #[must_use]
    pub fn shortfall(&self) -> Option<u64> {
        match self {
            Self::InsufficientCredits {
                required,
                remaining,
            } => Some(required.saturating_sub(*remaining)),
            _ => None,
        }
    }

    /// Whether this is the admission-control denial
    #[inline]
    #[must_use]
    pub fn is_insufficient_credits(&self) -> bool {
        matches!(self, Self::InsufficientCredits { .. })
    }
}
