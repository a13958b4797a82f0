//! Restage Credit Ledger
//!
//! Owns every account balance and its append-only transaction log:
//! - Lazy provisioning with a fixed starting grant
//! - Atomic deduct with admission control (`remaining` never goes negative)
//! - Purchase, adjustment and refund grants
//! - Read-only history, usage aggregates and low-balance warnings
//!
//! All mutation funnels through [`LedgerStore::update`], which applies one
//! read-modify-write per account indivisibly.
//!
//! # Example
//!
//! ```rust
//! use restage_ledger::{CreditLedger, LedgerConfig, UsageMetadata};
//! use restage_types::AccountId;
//!
//! let ledger = CreditLedger::new(LedgerConfig::default());
//! let account = AccountId::named("acme-realty");
//!
//! let txn = ledger.deduct(&account, 2, UsageMetadata::new("remove")).unwrap();
//! assert_eq!(txn.amount, -2);
//! assert_eq!(ledger.balance(&account).unwrap().remaining(), 998);
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod ledger;
pub mod stats;
pub mod store;
pub mod types;

pub use error::LedgerError;
pub use ledger::{AuditReport, BalanceView, CreditLedger, LedgerConfig};
pub use stats::{DailyUsage, UsageStats};
pub use store::{AccountMutation, InMemoryLedgerStore, LedgerStore};
pub use types::{
    Account, GrantRequest, Transaction, TransactionFilter, TransactionKind, UsageMetadata,
    WarningLevel, WarningThresholds,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
