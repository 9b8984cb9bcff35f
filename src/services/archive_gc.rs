//! Archive garbage collection.
//!
//! Studies evaluated by a job flagged `delete_from_archive` are purged from
//! the archive once nothing is still running against them. The store keeps
//! the study row, soft-deleted, so it is never rediscovered.

use std::sync::Arc;

use crate::domain::errors::DomainResult;
use crate::domain::models::StudyId;
use crate::domain::ports::{ArchiveClient, Store};

/// Counts from one [`ArchiveGarbageCollector::collect`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    /// Studies deleted from the archive and soft-deleted in the store.
    pub purged: u64,
    /// Staged payloads removed from the images directory.
    pub local_removed: usize,
}

/// Purges evaluated studies of jobs flagged for archive deletion.
pub struct ArchiveGarbageCollector {
    store: Store,
    archive: Arc<dyn ArchiveClient>,
}

impl ArchiveGarbageCollector {
    /// Collector over the given store and archive.
    pub fn new(store: Store, archive: Arc<dyn ArchiveClient>) -> Self {
        Self { store, archive }
    }

    /// Delete purgeable studies remotely, soft-delete them in the store,
    /// then drop their staged payloads. Local cleanup failures are only logged.
    pub async fn collect(&self) -> DomainResult<GcReport> {
        let studies = self.store.studies.list_purgeable().await?;
        if studies.is_empty() {
            return Ok(GcReport::default());
        }

        let refs: Vec<String> = studies.iter().map(|s| s.archive_id.clone()).collect();
        let ids: Vec<StudyId> = studies.iter().map(|s| s.id).collect();

        self.archive.delete_remote(&refs).await?;
        let purged = self.store.studies.mark_deleted_from_archive(&ids).await?;

        let mut local_removed = 0;
        for archive_id in &refs {
            match self.archive.delete_local(archive_id).await {
                Ok(()) => local_removed += 1,
                Err(e) => tracing::warn!(study = %archive_id, error = %e, "failed to remove staged payload"),
            }
        }

        tracing::info!(purged, "purged evaluated studies from archive");
        Ok(GcReport {
            purged,
            local_removed,
        })
    }
}
