//! Edit operation records, lifecycle and notifications

use crate::error::QueueError;
use crate::kind::OperationKind;
use restage_types::{OperationId, ResourceId, ResourceLocator, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Free-form edit parameters as submitted
pub type EditParameters = serde_json::Map<String, serde_json::Value>;

/// Lifecycle of one edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EditStatus {
    /// No transition leaves this status
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Statuses reachable from `from` in one step
///
/// `Pending -> Failed` is cancellation of an edit that never started.
#[must_use]
pub fn allowed_transitions(from: EditStatus) -> &'static [EditStatus] {
    use EditStatus::{Completed, Failed, Pending, Processing};
    match from {
        Pending => &[Processing, Failed],
        Processing => &[Completed, Failed],
        Completed | Failed => &[],
    }
}

/// Check a status change against the lifecycle
///
/// # Errors
/// `QueueError::IllegalTransition` if `to` is not reachable from `from`.
pub fn validate_transition(from: EditStatus, to: EditStatus) -> Result<(), QueueError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(QueueError::IllegalTransition { from, to })
    }
}

/// Why an edit ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Admission refused by the ledger; nothing was charged
    InsufficientCredits { required: u64, remaining: u64 },
    /// Executor reported a failure
    Executor { message: String },
    /// Executor did not answer in time
    Timeout { after_ms: u64 },
    /// Removed from the queue before it started
    Cancelled,
    /// Ledger refused the charge for another reason
    Ledger { message: String },
}

impl FailureReason {
    /// The ledger charged for this edit before it failed
    #[must_use]
    pub fn was_charged(&self) -> bool {
        matches!(self, Self::Executor { .. } | Self::Timeout { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientCredits { required, remaining } => write!(
                f,
                "insufficient credits: {required} required, {remaining} remaining"
            ),
            Self::Executor { message } => write!(f, "edit failed: {message}"),
            Self::Timeout { after_ms } => write!(f, "edit timed out after {after_ms}ms"),
            Self::Cancelled => f.write_str("cancelled before it started"),
            Self::Ledger { message } => write!(f, "ledger error: {message}"),
        }
    }
}

/// One submitted edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    pub id: OperationId,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub parameters: EditParameters,
    /// Opaque mask payload, base64 or a locator
    pub mask: Option<String>,
    pub status: EditStatus,
    pub result_locator: Option<ResourceLocator>,
    pub failure: Option<FailureReason>,
    /// Credits currently held for this edit (zero after refund)
    pub credits_charged: u64,
    pub submitted_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl EditOperation {
    pub(crate) fn pending(
        resource_id: ResourceId,
        kind: OperationKind,
        parameters: EditParameters,
        mask: Option<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: OperationId::new(),
            resource_id,
            kind,
            parameters,
            mask,
            status: EditStatus::Pending,
            result_locator: None,
            failure: None,
            credits_charged: 0,
            submitted_at: now,
            finished_at: None,
        }
    }

    pub(crate) fn transition(&mut self, to: EditStatus) -> Result<(), QueueError> {
        validate_transition(self.status, to)?;
        self.status = to;
        Ok(())
    }
}

/// Terminal result delivered to the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EditOutcome {
    Completed {
        operation_id: OperationId,
        result_locator: ResourceLocator,
        credits_charged: u64,
        /// Resource version this edit produced
        version: u64,
    },
    Failed {
        operation_id: OperationId,
        reason: FailureReason,
        /// Credits returned by the compensating refund
        refunded: u64,
        /// Credits charged whose refund could not be recorded
        #[serde(default)]
        refund_owed: u64,
    },
}

impl EditOutcome {
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        match self {
            Self::Completed { operation_id, .. } | Self::Failed { operation_id, .. } => {
                *operation_id
            }
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Failure reason, if the edit failed
    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed { reason, .. } => Some(reason),
            Self::Completed { .. } => None,
        }
    }

    /// Charged credits the ledger has not given back yet
    #[must_use]
    pub fn refund_owed(&self) -> u64 {
        match self {
            Self::Failed { refund_owed, .. } => *refund_owed,
            Self::Completed { .. } => 0,
        }
    }
}

/// Broadcast notification, in submission order per resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EditEvent {
    Started {
        operation_id: OperationId,
        resource_id: ResourceId,
        kind: OperationKind,
    },
    Completed {
        operation_id: OperationId,
        resource_id: ResourceId,
        result_locator: ResourceLocator,
        credits_charged: u64,
        version: u64,
    },
    Failed {
        operation_id: OperationId,
        resource_id: ResourceId,
        reason: FailureReason,
        refunded: u64,
        #[serde(default)]
        refund_owed: u64,
    },
}

impl EditEvent {
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        match self {
            Self::Started { operation_id, .. }
            | Self::Completed { operation_id, .. }
            | Self::Failed { operation_id, .. } => *operation_id,
        }
    }

    #[must_use]
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Self::Started { resource_id, .. }
            | Self::Completed { resource_id, .. }
            | Self::Failed { resource_id, .. } => resource_id,
        }
    }

    /// Completed or failed
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started { .. })
    }

    pub(crate) fn terminal(resource_id: ResourceId, outcome: &EditOutcome) -> Self {
        match outcome.clone() {
            EditOutcome::Completed {
                operation_id,
                result_locator,
                credits_charged,
                version,
            } => Self::Completed {
                operation_id,
                resource_id,
                result_locator,
                credits_charged,
                version,
            },
            EditOutcome::Failed {
                operation_id,
                reason,
                refunded,
                refund_owed,
            } => Self::Failed {
                operation_id,
                resource_id,
                reason,
                refunded,
                refund_owed,
            },
        }
    }
}

/// One link of a resource's version chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion {
    /// 0 for the originally uploaded image
    pub version: u64,
    pub locator: ResourceLocator,
    /// Edit that produced this version; `None` for version 0
    pub produced_by: Option<OperationId>,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use EditStatus::*;
        assert!(validate_transition(Pending, Processing).is_ok());
        assert!(validate_transition(Pending, Failed).is_ok());
        assert!(validate_transition(Processing, Completed).is_ok());
        assert!(validate_transition(Processing, Failed).is_ok());

        assert_eq!(
            validate_transition(Pending, Completed),
            Err(QueueError::IllegalTransition {
                from: Pending,
                to: Completed
            })
        );
        assert!(validate_transition(Processing, Pending).is_err());
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        for terminal in [EditStatus::Completed, EditStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(allowed_transitions(terminal).is_empty());
        }
        assert!(!EditStatus::Pending.is_terminal());
        assert!(!EditStatus::Processing.is_terminal());
    }

    #[test]
    fn only_dispatched_failures_were_charged() {
        assert!(FailureReason::Timeout { after_ms: 10 }.was_charged());
        assert!(FailureReason::Executor { message: "x".into() }.was_charged());
        assert!(!FailureReason::Cancelled.was_charged());
        assert!(!FailureReason::InsufficientCredits {
            required: 1,
            remaining: 0
        }
        .was_charged());
    }

    #[test]
    fn failure_reason_serializes_tagged() {
        let json = serde_json::to_value(FailureReason::InsufficientCredits {
            required: 1,
            remaining: 0,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"reason": "insufficient_credits", "required": 1, "remaining": 0})
        );
    }
}
