//! Restage shared types
//!
//! Identifiers, timestamps and the clock collaborator used by the ledger,
//! the token service and the edit queue.

#![warn(unreachable_pub)]

mod clock;
mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{
    AccountId, OperationId, ResourceId, ResourceLocator, TokenId, TransactionId,
};

/// Wall-clock instant used for expiry checks and transaction stamps
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
