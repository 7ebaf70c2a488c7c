//! Persistence boundary for review checkpoints.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use deadstock_core::SiteId;
use deadstock_review::DeadstockItem;

/// Checkpoint persistence error.
///
/// Infrastructure failures only; domain rejections never reach the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The collaborator could not be reached.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the payload.
    #[error("checkpoint rejected: {0}")]
    Rejected(String),
}

/// External persistence collaborator for review checkpoints.
///
/// The engine persists the full item collection as a checkpoint; wire and
/// storage formats are the collaborator's concern. No retries, timeouts or
/// cancellation are modeled here — a failed call is surfaced to the caller,
/// which may retry.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(
        &self,
        site_id: SiteId,
        items: &[DeadstockItem],
    ) -> Result<(), CheckpointError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn save_checkpoint(
        &self,
        site_id: SiteId,
        items: &[DeadstockItem],
    ) -> Result<(), CheckpointError> {
        (**self).save_checkpoint(site_id, items).await
    }
}
