//! Imaging archive port.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::StudyMetadata;

/// Client for the external imaging archive.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Identifiers of every study the archive holds.
    async fn list_studies(&self) -> DomainResult<Vec<String>>;

    /// Modality of a study, `None` when the archive does not know it.
    async fn get_modality(&self, study_ref: &str) -> DomainResult<Option<String>>;

    /// Modality plus patient and study tags.
    async fn get_metadata(&self, study_ref: &str) -> DomainResult<StudyMetadata>;

    /// Stage a study's payload locally; returns the written path.
    async fn download(&self, study_ref: &str) -> DomainResult<PathBuf>;

    /// Remove a staged payload. Missing files are not an error.
    async fn delete_local(&self, study_ref: &str) -> DomainResult<()>;

    /// Delete studies from the archive itself.
    async fn delete_remote(&self, study_refs: &[String]) -> DomainResult<()>;
}
