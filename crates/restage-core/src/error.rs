//! Error types for the studio session API

use restage_ledger::LedgerError;
use restage_queue::QueueError;
use restage_token::{InvalidReason, TokenError};
use restage_types::{AccountId, ResourceId};

/// Errors surfaced to studio callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StudioError {
    /// Ledger refused the request
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Queue refused the submission
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Token could not be issued or re-shared
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Presented share link does not validate
    #[error("share link rejected: {0}")]
    Access(InvalidReason),

    /// Share link is valid but lacks a permission
    #[error("share link does not allow {permission}")]
    PermissionDenied {
        /// Missing permission
        permission: &'static str,
    },

    /// Share link is for another image
    #[error("share link is for {granted}, not {requested}")]
    WrongResource {
        /// Image named in the token
        granted: ResourceId,
        /// Image the caller asked for
        requested: ResourceId,
    },

    /// Account does not own the image
    #[error("{account} does not own {resource}")]
    NotOwner {
        /// Caller
        account: AccountId,
        /// Image
        resource: ResourceId,
    },

    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    Config(String),
}

impl StudioError {
    /// Credits short of what the request needed, if that was the problem
    #[must_use]
    pub fn shortfall(&self) -> Option<u64> {
        match self {
            Self::Ledger(e) => e.shortfall(),
            _ => None,
        }
    }

    /// Structured reason for a rejected share link
    #[must_use]
    pub fn access_reason(&self) -> Option<InvalidReason> {
        match self {
            Self::Access(reason) | Self::Token(TokenError::Invalid(reason)) => Some(*reason),
            _ => None,
        }
    }
}
