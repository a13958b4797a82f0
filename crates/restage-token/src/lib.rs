//! Restage capability tokens
//!
//! A share grant lets an unauthenticated party (a buyer) keep editing one
//! image with a restricted permission set:
//! - Tokens are self-certifying: validity is a pure function of the signed
//!   claims and the current time
//! - Early invalidation goes through a side denylist ([`TokenStore`])
//! - Access analytics never influence validity
//!
//! # Example
//!
//! ```rust
//! use chrono::Duration;
//! use restage_token::{IssueRequest, TokenConfig, TokenService};
//! use restage_types::{AccountId, ResourceId};
//!
//! let service = TokenService::generate(TokenConfig::default());
//! let issued = service
//!     .issue(
//!         IssueRequest::new(ResourceId::named("listing-7"), AccountId::named("acme"), "agent@acme")
//!             .with_ttl(Duration::days(7)),
//!     )
//!     .unwrap();
//!
//! let claims = service.validate(&issued.token).into_result().unwrap();
//! assert!(claims.permissions.can_edit);
//! assert!(!claims.permissions.can_reshare);
//! ```

#![warn(unreachable_pub)]

pub mod claims;
pub mod error;
pub mod keys;
pub mod service;
pub mod store;

pub use claims::{Permissions, TokenClaims};
pub use error::{InvalidReason, TokenError, Validation};
pub use keys::signing_key_from_seed;
pub use service::{IssueRequest, IssuedToken, TokenConfig, TokenService};
pub use store::{AccessRecord, InMemoryTokenStore, TokenStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
