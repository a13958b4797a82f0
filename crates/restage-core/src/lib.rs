//! Restage Studio
//!
//! Session-level API over the three Restage components:
//! - [`CreditLedger`](restage_ledger::CreditLedger) for balances and history
//! - [`EditQueue`](restage_queue::EditQueue) for serialised, metered edits
//! - [`TokenService`](restage_token::TokenService) for share links
//!
//! # Example
//!
//! ```rust,no_run
//! use restage_core::{SimulatedExecutor, Studio, StudioConfig};
//! use restage_types::{AccountId, ResourceId, ResourceLocator};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), restage_core::StudioError> {
//! let studio = Studio::new(StudioConfig::default(), Arc::new(SimulatedExecutor::new(7)));
//! let agent = AccountId::named("acme-realty");
//! let kitchen = ResourceId::named("listing-12/kitchen");
//!
//! studio.open_listing_image(&agent, kitchen.clone(), ResourceLocator::named("uploads/kitchen.jpg"))?;
//! let ticket = studio.submit_as_account(&agent, &kitchen, "flooring", Default::default(), None)?;
//! let outcome = ticket.outcome().await?;
//! assert!(outcome.is_completed());
//! assert_eq!(studio.balance(&agent)?.remaining, 999);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod simulate;
pub mod simulated;
pub mod studio;

pub use config::StudioConfig;
pub use error::StudioError;
pub use simulate::{run_simulation, SimulationConfig, SimulationReport};
pub use simulated::SimulatedExecutor;
pub use studio::Studio;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
