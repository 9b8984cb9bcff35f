//! SQLite implementation of the ExperimentRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::study_repository::{StudyRow, STUDY_COLUMNS};
use super::{format_datetime, parse_datetime, placeholders};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Experiment, ExperimentCounts, ExperimentId, ExperimentStatus, ModelId, Study, StudyId,
    TransitionOutcome,
};
use crate::domain::ports::ExperimentRepository;

const EXPERIMENT_COLUMNS: &str = "id, name, model_id, status, user_id, created_at, updated_at";

/// SQLite [`ExperimentRepository`].
#[derive(Clone)]
pub struct SqliteExperimentRepository {
    pool: SqlitePool,
}

impl SqliteExperimentRepository {
    /// Repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExperimentRepository for SqliteExperimentRepository {
    async fn create(
        &self,
        name: &str,
        model_id: ModelId,
        user_id: Option<i64>,
        study_ids: &[StudyId],
    ) -> DomainResult<Experiment> {
        let now = format_datetime(Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"INSERT INTO experiments (name, model_id, status, user_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(name)
        .bind(model_id.get())
        .bind(ExperimentStatus::New.as_str())
        .bind(user_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let id = ExperimentId(result.last_insert_rowid());

        for study_id in study_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO experiment_studies (experiment_id, study_id) VALUES (?, ?)",
            )
            .bind(id.get())
            .bind(study_id.get())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.get(id).await?.ok_or(DomainError::ExperimentNotFound(id))
    }

    async fn get(&self, id: ExperimentId) -> DomainResult<Option<Experiment>> {
        let row: Option<ExperimentRow> =
            sqlx::query_as(&format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE id = ?"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<Experiment>> {
        let rows: Vec<ExperimentRow> =
            sqlx::query_as(&format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_status(&self, status: ExperimentStatus) -> DomainResult<Vec<Experiment>> {
        let rows: Vec<ExperimentRow> = sqlx::query_as(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE status = ? ORDER BY id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn transition(
        &self,
        id: ExperimentId,
        to: ExperimentStatus,
    ) -> DomainResult<TransitionOutcome> {
        let sources: Vec<ExperimentStatus> = [
            ExperimentStatus::New,
            ExperimentStatus::Running,
            ExperimentStatus::Completed,
            ExperimentStatus::Stopped,
        ]
        .into_iter()
        .filter(|s| s.can_transition_to(to))
        .collect();

        if !sources.is_empty() {
            let sql = format!(
                "UPDATE experiments SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
                placeholders(sources.len())
            );
            let mut q = sqlx::query(&sql)
                .bind(to.as_str())
                .bind(format_datetime(Utc::now()))
                .bind(id.get());
            for source in &sources {
                q = q.bind(source.as_str());
            }
            if q.execute(&self.pool).await?.rows_affected() == 1 {
                return Ok(TransitionOutcome::Applied);
            }
        }

        let current = self.get(id).await?.ok_or(DomainError::ExperimentNotFound(id))?;
        if current.status == to {
            Ok(TransitionOutcome::Unchanged)
        } else {
            Err(DomainError::InvalidStateTransition {
                from: current.status.to_string(),
                to: to.to_string(),
                reason: format!("experiment {id} is {}", current.status),
            })
        }
    }

    async fn counts(&self, experiment: &Experiment) -> DomainResult<ExperimentCounts> {
        let (unevaluated, in_flight, completed, failed): (i64, i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                   COALESCE(SUM(CASE WHEN e.id IS NULL THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN e.status IN ('QUEUED', 'RUNNING') THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN e.status = 'COMPLETED' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN e.status = 'FAILED' THEN 1 ELSE 0 END), 0)
               FROM experiment_studies x
               LEFT JOIN study_evaluations e
                   ON e.study_id = x.study_id AND e.model_id = ?
               WHERE x.experiment_id = ?"#,
        )
        .bind(experiment.model_id.get())
        .bind(experiment.id.get())
        .fetch_one(&self.pool)
        .await?;

        let to_u64 = |n: i64| u64::try_from(n).unwrap_or_default();
        Ok(ExperimentCounts {
            unevaluated: to_u64(unevaluated),
            in_flight: to_u64(in_flight),
            completed: to_u64(completed),
            failed: to_u64(failed),
        })
    }

    async fn list_unevaluated_members(
        &self,
        experiment: &Experiment,
        limit: usize,
    ) -> DomainResult<Vec<Study>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<StudyRow> = sqlx::query_as(&format!(
            r#"SELECT {STUDY_COLUMNS} FROM experiment_studies x
               JOIN studies s ON s.id = x.study_id
               WHERE x.experiment_id = ?
                 AND NOT EXISTS (
                     SELECT 1 FROM study_evaluations e
                     WHERE e.study_id = s.id AND e.model_id = ?
                 )
               ORDER BY s.date_added ASC, s.id ASC
               LIMIT ?"#
        ))
        .bind(experiment.id.get())
        .bind(experiment.model_id.get())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ExperimentRow {
    id: i64,
    name: String,
    model_id: i64,
    status: String,
    user_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ExperimentRow> for Experiment {
    type Error = DomainError;

    fn try_from(row: ExperimentRow) -> Result<Self, Self::Error> {
        let status = ExperimentStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        Ok(Experiment {
            id: ExperimentId(row.id),
            name: row.name,
            model_id: ModelId(row.model_id),
            status,
            user_id: row.user_id,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}
