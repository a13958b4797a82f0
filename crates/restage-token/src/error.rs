//! Token errors and validation outcomes

use crate::claims::TokenClaims;
use restage_types::TokenId;
use serde::{Deserialize, Serialize};

/// Why a token failed validation
///
/// Messages are safe to show to the token holder; they carry no key
/// material or decoding detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// Past its expiry; the holder needs a new link
    #[error("this share link has expired")]
    Expired,
    /// Undecodable, tampered with, or missing required fields
    #[error("this share link is malformed")]
    Malformed,
    /// Explicitly withdrawn by the issuer
    #[error("this share link has been revoked")]
    Revoked,
}

/// Outcome of [`TokenService::validate`](crate::TokenService::validate)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(TokenClaims),
    Invalid(InvalidReason),
}

impl Validation {
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Claims of a valid token
    #[must_use]
    pub fn claims(&self) -> Option<&TokenClaims> {
        match self {
            Self::Valid(claims) => Some(claims),
            Self::Invalid(_) => None,
        }
    }

    /// Reason of an invalid token
    #[must_use]
    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            Self::Valid(_) => None,
            Self::Invalid(reason) => Some(*reason),
        }
    }

    /// Convert into a `Result`
    ///
    /// # Errors
    /// The invalid reason.
    pub fn into_result(self) -> Result<TokenClaims, InvalidReason> {
        match self {
            Self::Valid(claims) => Ok(claims),
            Self::Invalid(reason) => Err(reason),
        }
    }
}

/// Token service errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Presented token is not valid
    #[error("invalid token: {0}")]
    Invalid(#[from] InvalidReason),

    /// Lifetime must be positive
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    /// Parent grant does not allow re-sharing
    #[error("token does not permit re-sharing")]
    ReshareForbidden,

    /// Child grant would exceed its parent
    #[error("permission escalation: {0}")]
    Escalation(String),

    /// No record of the token id
    #[error("unknown token: {0}")]
    UnknownToken(TokenId),

    /// Claims could not be encoded
    #[error("encoding failed: {0}")]
    Encoding(String),
}
