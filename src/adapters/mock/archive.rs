//! In-memory archive for tests.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::StudyMetadata;
use crate::domain::ports::ArchiveClient;

#[derive(Debug, Default)]
struct State {
    studies: BTreeMap<String, StudyMetadata>,
    failing: HashSet<String>,
    fail_all: bool,
    list_calls: usize,
    downloads: Vec<String>,
    deleted_local: Vec<String>,
    deleted_remote: Vec<String>,
}

/// Archive fake recording every call.
#[derive(Debug, Clone, Default)]
pub struct MockArchive {
    state: Arc<RwLock<State>>,
}

impl MockArchive {
    /// Empty, available archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a study listable with the given modality.
    pub async fn add_study(&self, study_ref: &str, modality: &str) {
        let mut state = self.state.write().await;
        state.studies.insert(
            study_ref.to_string(),
            StudyMetadata {
                modality: Some(modality.to_string()),
                ..StudyMetadata::default()
            },
        );
    }

    /// Make every call fail as if the archive were unreachable.
    pub async fn set_unavailable(&self, fail: bool) {
        self.state.write().await.fail_all = fail;
    }

    /// Make downloads of one study fail.
    pub async fn fail_download_of(&self, study_ref: &str) {
        self.state.write().await.failing.insert(study_ref.to_string());
    }

    /// Number of `list_studies` calls, failed ones included.
    pub async fn list_calls(&self) -> usize {
        self.state.read().await.list_calls
    }

    /// Refs downloaded so far, in order.
    pub async fn downloads(&self) -> Vec<String> {
        self.state.read().await.downloads.clone()
    }

    /// Refs whose local payloads were deleted.
    pub async fn deleted_local(&self) -> Vec<String> {
        self.state.read().await.deleted_local.clone()
    }

    /// Refs deleted from the archive.
    pub async fn deleted_remote(&self) -> Vec<String> {
        self.state.read().await.deleted_remote.clone()
    }

    async fn check_available(&self) -> DomainResult<()> {
        if self.state.read().await.fail_all {
            return Err(DomainError::ArchiveUnavailable("mock archive offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveClient for MockArchive {
    async fn list_studies(&self) -> DomainResult<Vec<String>> {
        self.state.write().await.list_calls += 1;
        self.check_available().await?;
        Ok(self.state.read().await.studies.keys().cloned().collect())
    }

    async fn get_modality(&self, study_ref: &str) -> DomainResult<Option<String>> {
        Ok(self.get_metadata(study_ref).await?.modality)
    }

    async fn get_metadata(&self, study_ref: &str) -> DomainResult<StudyMetadata> {
        self.check_available().await?;
        self.state
            .read()
            .await
            .studies
            .get(study_ref)
            .cloned()
            .ok_or_else(|| DomainError::StudyNotFound(study_ref.to_string()))
    }

    async fn download(&self, study_ref: &str) -> DomainResult<PathBuf> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        if state.failing.contains(study_ref) {
            return Err(DomainError::ArchiveUnavailable(format!("download of {study_ref} failed")));
        }
        state.downloads.push(study_ref.to_string());
        Ok(PathBuf::from(format!("/tmp/medai/{study_ref}.zip")))
    }

    async fn delete_local(&self, study_ref: &str) -> DomainResult<()> {
        self.state.write().await.deleted_local.push(study_ref.to_string());
        Ok(())
    }

    async fn delete_remote(&self, study_refs: &[String]) -> DomainResult<()> {
        self.check_available().await?;
        let mut state = self.state.write().await;
        for study_ref in study_refs {
            state.studies.remove(study_ref);
            state.deleted_remote.push(study_ref.clone());
        }
        Ok(())
    }
}
