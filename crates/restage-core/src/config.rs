//! Studio configuration
//!
//! Every section is optional; a missing section takes its defaults.
//!
//! ```toml
//! signing_secret = "change-me"
//!
//! [ledger]
//! starting_grant = 1000
//! billing_period_days = 30
//!
//! [queue]
//! executor_timeout_ms = 60000
//!
//! [costs.costs]
//! remove = 3
//!
//! [tokens]
//! default_ttl_secs = 604800
//! ```

use crate::error::StudioError;
use restage_ledger::LedgerConfig;
use restage_queue::{CostTable, QueueConfig};
use restage_token::TokenConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for a [`Studio`](crate::Studio)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub ledger: LedgerConfig,
    pub queue: QueueConfig,
    pub costs: CostTable,
    pub tokens: TokenConfig,
    /// Secret the token signing key is derived from
    ///
    /// Processes sharing the secret accept each other's share links. When
    /// unset, each studio signs with a fresh random key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

impl StudioConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With ledger section
    #[inline]
    #[must_use]
    pub fn with_ledger(mut self, ledger: LedgerConfig) -> Self {
        self.ledger = ledger;
        self
    }

    /// With queue section
    #[inline]
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// With cost table
    #[inline]
    #[must_use]
    pub fn with_costs(mut self, costs: CostTable) -> Self {
        self.costs = costs;
        self
    }

    /// With token section
    #[inline]
    #[must_use]
    pub fn with_tokens(mut self, tokens: TokenConfig) -> Self {
        self.tokens = tokens;
        self
    }

    /// With signing secret
    #[inline]
    #[must_use]
    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    /// Parse TOML
    ///
    /// # Errors
    /// `StudioError::Config` on invalid TOML or unexpected value types.
    pub fn from_toml_str(input: &str) -> Result<Self, StudioError> {
        let config: Self = toml::from_str(input).map_err(|e| StudioError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// `StudioError::Config` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StudioError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| StudioError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&input)
    }

    /// Reject settings no component can work with
    ///
    /// # Errors
    /// `StudioError::Config` naming the offending setting.
    pub fn validate(&self) -> Result<(), StudioError> {
        if self.queue.executor_timeout_ms == 0 {
            return Err(StudioError::Config("queue.executor_timeout_ms must be positive".into()));
        }
        if self.tokens.default_ttl_secs == 0 || self.tokens.default_ttl_secs > self.tokens.max_ttl_secs {
            return Err(StudioError::Config(
                "tokens.default_ttl_secs must be positive and within max_ttl_secs".into(),
            ));
        }
        if self
            .signing_secret
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            return Err(StudioError::Config("signing_secret must not be blank".into()));
        }
        Ok(())
    }
}
