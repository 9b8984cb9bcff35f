//! Study repository port.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{ModelId, NewStudy, Study, StudyId};

/// Repository interface for Study persistence.
#[async_trait]
pub trait StudyRepository: Send + Sync {
    /// Insert a study on first sighting. Returns `None` when the archive id
    /// is already known.
    async fn insert_new(&self, study: &NewStudy) -> DomainResult<Option<Study>>;

    /// Study by store id.
    async fn get(&self, id: StudyId) -> DomainResult<Option<Study>>;

    /// Study by archive id.
    async fn get_by_archive_id(&self, archive_id: &str) -> DomainResult<Option<Study>>;

    /// Archive ids of every study in the store, including failed and purged ones.
    async fn list_archive_ids(&self) -> DomainResult<HashSet<String>>;

    /// Assign the classified type. Returns the updated study, or `None` if
    /// the archive id is unknown.
    async fn set_type(&self, archive_id: &str, study_type: &str) -> DomainResult<Option<Study>>;

    /// Hard delete so the next classification sweep rediscovers the study.
    /// Only an untyped study with no evaluations and no experiment
    /// membership is removed; returns whether a row was deleted.
    async fn remove(&self, archive_id: &str) -> DomainResult<bool>;

    /// Studies of `input_type` with no evaluation row for `model_id`,
    /// oldest first.
    async fn list_eligible(
        &self,
        model_id: ModelId,
        input_type: &str,
        limit: usize,
    ) -> DomainResult<Vec<Study>>;

    /// Remove untyped studies that arrived before `cutoff`, under the same
    /// conditions as [`remove`](Self::remove).
    async fn delete_unclassified_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;

    /// Studies still in the archive whose evaluation by a job flagged for
    /// archive deletion has finished.
    async fn list_purgeable(&self) -> DomainResult<Vec<Study>>;

    /// Soft-delete after an archive purge.
    async fn mark_deleted_from_archive(&self, ids: &[StudyId]) -> DomainResult<u64>;

    /// Study counts keyed by type; `None` collects unclassified studies.
    async fn count_by_type(&self) -> DomainResult<Vec<(Option<String>, u64)>>;
}
