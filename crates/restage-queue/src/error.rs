//! Error types for the edit queue
//!
//! Only submission-time problems surface as [`QueueError`]. Everything that
//! goes wrong once an operation is admitted ends the operation in `failed`
//! with a [`FailureReason`](crate::operation::FailureReason) instead.

use crate::operation::EditStatus;
use restage_types::{AccountId, OperationId, ResourceId};

/// Errors returned by queue calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Operation kind is not in the catalogue; never enqueued
    #[error("unknown operation kind: {0}")]
    UnknownOperationKind(String),

    /// Kind needs a mask payload and none was given
    #[error("{0} edits require a mask")]
    MaskRequired(crate::kind::OperationKind),

    /// Resource was never opened on this queue
    #[error("resource not open: {0}")]
    UnknownResource(ResourceId),

    /// Resource is already billed to a different account
    #[error("resource {resource} is billed to {existing}, not {requested}")]
    AccountMismatch {
        /// Resource being re-opened
        resource: ResourceId,
        /// Account it was opened with
        existing: AccountId,
        /// Account given on the second open
        requested: AccountId,
    },

    /// Operation is not waiting on this resource (already started or gone)
    #[error("operation {0} is not pending")]
    NotPending(OperationId),

    /// Status change outside the lifecycle
    #[error("illegal status transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current status
        from: EditStatus,
        /// Requested status
        to: EditStatus,
    },

    /// Worker stopped before delivering the outcome (runtime shut down)
    #[error("worker stopped before operation {0} finished")]
    WorkerStopped(OperationId),

    /// Called outside a tokio runtime, so no worker can be spawned
    #[error("no async runtime available for the resource worker")]
    NoRuntime,
}

/// Failure reported by an [`EditExecutor`](crate::executor::EditExecutor)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Provider processed the request and failed
    #[error("provider failure: {0}")]
    Provider(String),

    /// Provider rejected the request as invalid
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider could not be reached
    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

impl ExecutorError {
    /// Worth retrying later
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
