//! Discovery and classification of new archive studies.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{NewStudy, NotificationKind, Study, Topic};
use crate::domain::ports::{ArchiveClient, BatchRequest, Store, WorkerDispatcher};
use crate::services::notifier::Notifier;

/// Modality whose studies are typed directly, never sent to a classifier.
pub const CT_MODALITY: &str = "CT";

/// Type given to studies whose archive metadata carries no modality.
pub const UNKNOWN_MODALITY: &str = "UNKNOWN";

/// Counts from one classification sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassificationReport {
    /// Studies seen for the first time this sweep.
    pub discovered: usize,
    /// Studies typed from their modality alone.
    pub typed_directly: usize,
    /// Studies handed to a classifier model; typed when its results arrive.
    pub sent_to_classifier: usize,
    /// Studies removed after a classification failure.
    pub removed: usize,
}

/// Assigns a type to newly seen studies.
pub struct ClassificationCoordinator {
    store: Store,
    archive: Arc<dyn ArchiveClient>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    notifier: Notifier,
}

impl ClassificationCoordinator {
    /// Coordinator over the given store and archive.
    pub fn new(
        store: Store,
        archive: Arc<dyn ArchiveClient>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            archive,
            dispatcher,
            notifier,
        }
    }

    /// Record up to `limit` archive studies the store has never seen.
    ///
    /// Studies whose metadata cannot be read are left for the next sweep.
    pub async fn discover_new_studies(&self, limit: usize) -> DomainResult<Vec<Study>> {
        let known: HashSet<String> = self.store.studies.list_archive_ids().await?;
        let mut candidates: Vec<String> = self
            .archive
            .list_studies()
            .await?
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut discovered = Vec::with_capacity(candidates.len());
        for archive_id in candidates {
            let metadata = match self.archive.get_metadata(&archive_id).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(study = %archive_id, error = %e, "failed to read study metadata");
                    continue;
                }
            };
            if let Some(study) = self
                .store
                .studies
                .insert_new(&NewStudy::new(&archive_id).with_metadata(metadata))
                .await?
            {
                discovered.push(study);
            }
        }
        Ok(discovered)
    }

    /// Type studies by modality.
    ///
    /// CT studies and modalities without a registered classifier take the
    /// modality as their type. The rest go to the modality's classifier in
    /// one batch, whose results arrive on the classification topic keyed by
    /// archive id. A failing group is removed from the store.
    pub async fn classify(&self, studies: &[Study]) -> DomainResult<ClassificationReport> {
        let mut by_modality: BTreeMap<String, Vec<&Study>> = BTreeMap::new();
        for study in studies {
            let modality = study
                .modality
                .clone()
                .unwrap_or_else(|| UNKNOWN_MODALITY.to_string());
            by_modality.entry(modality).or_default().push(study);
        }

        let mut report = ClassificationReport::default();
        for (modality, group) in by_modality {
            let refs: Vec<String> = group.iter().map(|s| s.archive_id.clone()).collect();
            match self.classify_group(&modality, &refs).await {
                Ok(true) => report.sent_to_classifier += refs.len(),
                Ok(false) => report.typed_directly += refs.len(),
                Err(e) => {
                    report.removed += self.fail_classification(&refs, &e).await?;
                }
            }
        }
        Ok(report)
    }

    /// Returns whether the group was sent to a classifier.
    async fn classify_group(&self, modality: &str, refs: &[String]) -> DomainResult<bool> {
        let classifier = if modality == CT_MODALITY {
            None
        } else {
            self.store.models.get_classifier(modality).await?
        };

        let Some(classifier) = classifier else {
            for archive_id in refs {
                if self.store.studies.set_type(archive_id, modality).await?.is_some() {
                    self.notifier
                        .broadcast(NotificationKind::StudyReady, format!("Study {archive_id} ready"));
                }
            }
            return Ok(false);
        };

        for archive_id in refs {
            self.archive.download(archive_id).await?;
        }
        let correlation_id = Uuid::new_v4();
        self.dispatcher
            .start_batch(BatchRequest {
                image: classifier.image.clone(),
                study_refs: refs.to_vec(),
                correlation_id,
                evaluation_ids: Vec::new(),
                cpu: false,
                result_queue: Topic::ClassificationResults.name(),
            })
            .await?;
        tracing::info!(
            modality,
            classifier = %classifier.id,
            correlation_id = %correlation_id,
            studies = refs.len(),
            "sent studies to classifier"
        );
        Ok(true)
    }

    /// Remove studies whose classification failed so the next sweep
    /// rediscovers them. One notification covers the whole group.
    pub async fn fail_classification(&self, refs: &[String], error: &DomainError) -> DomainResult<usize> {
        tracing::error!(studies = ?refs, error = %error, "classification failed");
        self.notifier.broadcast(
            NotificationKind::ClassificationFailed,
            format!("Classification of studies {} failed: {error}", refs.join(", ")),
        );
        let mut removed = 0;
        for archive_id in refs {
            if self.store.studies.remove(archive_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Discover then classify.
    #[instrument(skip(self))]
    pub async fn sweep(&self, batch_size: usize) -> DomainResult<ClassificationReport> {
        let discovered = self.discover_new_studies(batch_size).await?;
        if discovered.is_empty() {
            return Ok(ClassificationReport::default());
        }
        let mut report = self.classify(&discovered).await?;
        report.discovered = discovered.len();
        Ok(report)
    }

    /// Remove studies still untyped after `tolerance`, typically ones whose
    /// classifier result never arrived.
    pub async fn remove_unclassified(&self, tolerance: Duration) -> DomainResult<u64> {
        let tolerance = chrono::Duration::from_std(tolerance)
            .map_err(|e| DomainError::ValidationFailed(format!("tolerance out of range: {e}")))?;
        let removed = self
            .store
            .studies
            .delete_unclassified_before(Utc::now() - tolerance)
            .await?;
        if removed > 0 {
            tracing::info!(removed, "removed unclassified studies");
        }
        Ok(removed)
    }
}
