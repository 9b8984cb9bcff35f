//! SQLite implementation of the StudyRepository.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{format_datetime, parse_datetime, placeholders};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ModelId, NewStudy, Study, StudyId};
use crate::domain::ports::StudyRepository;

/// Untyped and untouched: no evaluation row and no experiment membership.
/// Only such studies may be hard deleted, so finished results never cascade
/// away with their study.
const REMOVABLE: &str = "studies.study_type IS NULL \
    AND NOT EXISTS (SELECT 1 FROM study_evaluations e WHERE e.study_id = studies.id) \
    AND NOT EXISTS (SELECT 1 FROM experiment_studies x WHERE x.study_id = studies.id)";

pub(super) const STUDY_COLUMNS: &str = "s.id, s.archive_id, s.study_type, s.modality, s.patient_id, \
    s.study_uid, s.failed, s.deleted_from_archive, s.date_added";

/// SQLite [`StudyRepository`].
#[derive(Clone)]
pub struct SqliteStudyRepository {
    pool: SqlitePool,
}

impl SqliteStudyRepository {
    /// Repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StudyRepository for SqliteStudyRepository {
    async fn insert_new(&self, study: &NewStudy) -> DomainResult<Option<Study>> {
        let result = sqlx::query(
            r#"INSERT INTO studies (archive_id, modality, patient_id, study_uid, date_added)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(archive_id) DO NOTHING"#,
        )
        .bind(&study.archive_id)
        .bind(&study.metadata.modality)
        .bind(&study.metadata.patient_id)
        .bind(&study.metadata.study_uid)
        .bind(format_datetime(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get(StudyId(result.last_insert_rowid())).await
    }

    async fn get(&self, id: StudyId) -> DomainResult<Option<Study>> {
        let row: Option<StudyRow> =
            sqlx::query_as(&format!("SELECT {STUDY_COLUMNS} FROM studies s WHERE s.id = ?"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_archive_id(&self, archive_id: &str) -> DomainResult<Option<Study>> {
        let row: Option<StudyRow> =
            sqlx::query_as(&format!("SELECT {STUDY_COLUMNS} FROM studies s WHERE s.archive_id = ?"))
                .bind(archive_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_archive_ids(&self) -> DomainResult<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT archive_id FROM studies")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_type(&self, archive_id: &str, study_type: &str) -> DomainResult<Option<Study>> {
        let result = sqlx::query("UPDATE studies SET study_type = ? WHERE archive_id = ?")
            .bind(study_type)
            .bind(archive_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_by_archive_id(archive_id).await
    }

    async fn remove(&self, archive_id: &str) -> DomainResult<bool> {
        let result = sqlx::query(&format!("DELETE FROM studies WHERE archive_id = ? AND {REMOVABLE}"))
            .bind(archive_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_eligible(
        &self,
        model_id: ModelId,
        input_type: &str,
        limit: usize,
    ) -> DomainResult<Vec<Study>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<StudyRow> = sqlx::query_as(&format!(
            r#"SELECT {STUDY_COLUMNS} FROM studies s
               WHERE s.study_type = ? AND s.failed = 0 AND s.deleted_from_archive = 0
                 AND NOT EXISTS (
                     SELECT 1 FROM study_evaluations e
                     WHERE e.study_id = s.id AND e.model_id = ?
                 )
               ORDER BY s.date_added ASC, s.id ASC
               LIMIT ?"#
        ))
        .bind(input_type)
        .bind(model_id.get())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_unclassified_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM studies WHERE date_added < ? AND {REMOVABLE}"))
            .bind(format_datetime(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_purgeable(&self) -> DomainResult<Vec<Study>> {
        let rows: Vec<StudyRow> = sqlx::query_as(&format!(
            r#"SELECT DISTINCT {STUDY_COLUMNS} FROM studies s
               JOIN study_evaluations e ON e.study_id = s.id
               JOIN eval_jobs j ON j.model_id = e.model_id
               WHERE j.delete_from_archive = 1
                 AND e.status = 'COMPLETED'
                 AND s.deleted_from_archive = 0
                 AND NOT EXISTS (
                     SELECT 1 FROM study_evaluations a
                     WHERE a.study_id = s.id AND a.status IN ('QUEUED', 'RUNNING')
                 )
               ORDER BY s.id"#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_deleted_from_archive(&self, ids: &[StudyId]) -> DomainResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE studies SET deleted_from_archive = 1 WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.get());
        }

        Ok(q.execute(&self.pool).await?.rows_affected())
    }

    async fn count_by_type(&self) -> DomainResult<Vec<(Option<String>, u64)>> {
        let rows: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT study_type, COUNT(*) FROM studies GROUP BY study_type ORDER BY study_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(t, n)| (t, u64::try_from(n).unwrap_or_default()))
            .collect())
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct StudyRow {
    id: i64,
    archive_id: String,
    study_type: Option<String>,
    modality: Option<String>,
    patient_id: Option<String>,
    study_uid: Option<String>,
    failed: bool,
    deleted_from_archive: bool,
    date_added: String,
}

impl TryFrom<StudyRow> for Study {
    type Error = DomainError;

    fn try_from(row: StudyRow) -> Result<Self, Self::Error> {
        Ok(Study {
            id: StudyId(row.id),
            archive_id: row.archive_id,
            study_type: row.study_type,
            modality: row.modality,
            patient_id: row.patient_id,
            study_uid: row.study_uid,
            failed: row.failed,
            deleted_from_archive: row.deleted_from_archive,
            date_added: parse_datetime(&row.date_added)?,
        })
    }
}
