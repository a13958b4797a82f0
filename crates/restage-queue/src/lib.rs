//! Restage Edit Queue
//!
//! Serialises metered image edits per resource:
//! - One worker per image, spawned on demand, FIFO within the image
//! - Deduct before dispatch, refund on executor failure or timeout
//! - Version chain per image; failed edits leave it untouched
//! - Broadcast events and per-submission tickets for completion
//!
//! # Example
//!
//! ```rust,no_run
//! use restage_ledger::{CreditLedger, LedgerConfig};
//! use restage_queue::{CostTable, EditExecutor, EditQueue, OperationKind, QueueConfig};
//! use restage_types::{AccountId, ResourceId, ResourceLocator};
//! use std::sync::Arc;
//!
//! # async fn run(executor: Arc<dyn EditExecutor>) -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(CreditLedger::new(LedgerConfig::default()));
//! let queue = EditQueue::new(QueueConfig::default(), CostTable::default(), ledger, executor);
//!
//! let image = ResourceId::named("listing-7/living-room");
//! queue.open_resource(image.clone(), AccountId::named("acme"), ResourceLocator::named("s3://raw.jpg"))?;
//!
//! let ticket = queue.submit(&image, OperationKind::Flooring, Default::default(), None)?;
//! let outcome = ticket.outcome().await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod executor;
pub mod kind;
pub mod operation;
pub mod queue;

pub use error::{ExecutorError, QueueError};
pub use executor::{EditExecutor, EditRequest};
pub use kind::{CostTable, OperationKind};
pub use operation::{
    allowed_transitions, validate_transition, EditEvent, EditOperation, EditOutcome,
    EditParameters, EditStatus, FailureReason, ResourceVersion,
};
pub use queue::{EditQueue, OperationTicket, QueueConfig, QueueStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
