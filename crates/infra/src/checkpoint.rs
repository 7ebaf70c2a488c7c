//! In-memory checkpoint persistence for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use deadstock_core::SiteId;
use deadstock_review::DeadstockItem;
use deadstock_session::{CheckpointError, CheckpointStore};

/// In-memory checkpoint store.
///
/// Holds the latest confirmed collection per site. `fail_next` arms a
/// one-shot failure so callers can exercise the persistence-failure path.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<SiteId, Vec<DeadstockItem>>>,
    fail_next: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure for the next `save_checkpoint` call.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The latest confirmed collection for a site, if any.
    pub fn checkpoint(&self, site_id: SiteId) -> Option<Vec<DeadstockItem>> {
        self.checkpoints.read().ok()?.get(&site_id).cloned()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save_checkpoint(
        &self,
        site_id: SiteId,
        items: &[DeadstockItem],
    ) -> Result<(), CheckpointError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable(
                "checkpoint store offline".to_string(),
            ));
        }

        let mut map = self
            .checkpoints
            .write()
            .map_err(|_| CheckpointError::Rejected("store poisoned".to_string()))?;
        map.insert(site_id, items.to_vec());
        tracing::debug!(site_id = %site_id, items = items.len(), "checkpoint stored");
        Ok(())
    }
}
