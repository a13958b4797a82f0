//! Edit executor seam
//!
//! The queue never touches pixels. It hands each admitted edit to an
//! [`EditExecutor`] together with the locator of the version the edit must
//! apply to, and records whatever locator comes back.

use crate::error::ExecutorError;
use crate::kind::OperationKind;
use crate::operation::EditParameters;
use restage_types::{OperationId, ResourceId, ResourceLocator};

/// Everything an executor needs for one edit
#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub operation_id: OperationId,
    pub resource_id: ResourceId,
    pub kind: OperationKind,
    pub parameters: EditParameters,
    pub mask: Option<String>,
    /// Current version of the image; the edit applies on top of it
    pub input_locator: ResourceLocator,
    /// Version number of `input_locator`
    pub input_version: u64,
}

/// External image editing provider
///
/// Calls are bounded by the queue's timeout. An executor that is still
/// running when the timeout fires is dropped and its result ignored.
#[async_trait::async_trait]
pub trait EditExecutor: Send + Sync {
    /// Apply one edit and return the locator of the produced image
    async fn execute(&self, request: &EditRequest) -> Result<ResourceLocator, ExecutorError>;
}
