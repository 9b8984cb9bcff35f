//! SQLite implementation of the EvaluationRepository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{format_datetime, parse_datetime, parse_json_or_default, parse_optional_datetime, placeholders};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    DispatchItem, EvaluationId, EvaluationStatus, ExperimentId, ModelId, StudyEvaluation, StudyId,
    TransitionOutcome,
};
use crate::domain::ports::EvaluationRepository;

const EVAL_COLUMNS: &str = "id, study_id, model_id, status, model_output, img_output_path, stdout, \
    start_time, finish_time, created_at, updated_at";

/// SQLite [`EvaluationRepository`].
#[derive(Clone)]
pub struct SqliteEvaluationRepository {
    pool: SqlitePool,
}

impl SqliteEvaluationRepository {
    /// Repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Work out why a conditional update touched no row.
    async fn resolve_unapplied(
        &self,
        id: EvaluationId,
        to: EvaluationStatus,
    ) -> DomainResult<TransitionOutcome> {
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM study_evaluations WHERE id = ?")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        let Some((status,)) = current else {
            return Err(DomainError::EvaluationNotFound(id));
        };
        let from = parse_status(&status)?;

        if from == to {
            Ok(TransitionOutcome::Unchanged)
        } else {
            Err(DomainError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
                reason: format!("evaluation {id} is already {from}"),
            })
        }
    }

    /// Flip the given FAILED rows back to RUNNING inside `tx`.
    async fn restart(
        tx: &mut Transaction<'_, Sqlite>,
        ids: &[EvaluationId],
    ) -> DomainResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let now = format_datetime(Utc::now());
        let sql = format!(
            "UPDATE study_evaluations
             SET status = 'RUNNING', model_output = NULL, img_output_path = NULL,
                 start_time = ?, finish_time = NULL, updated_at = ?
             WHERE status = 'FAILED' AND id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql).bind(&now).bind(&now);
        for id in ids {
            q = q.bind(id.get());
        }
        q.execute(&mut **tx).await?;
        Ok(())
    }
}

#[async_trait]
impl EvaluationRepository for SqliteEvaluationRepository {
    async fn create_running(
        &self,
        model_id: ModelId,
        study_ids: &[StudyId],
    ) -> DomainResult<Vec<EvaluationId>> {
        if study_ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = format_datetime(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(study_ids.len());

        for study_id in study_ids {
            let result = sqlx::query(
                r#"INSERT INTO study_evaluations (study_id, model_id, status, start_time, created_at, updated_at)
                   VALUES (?, ?, 'RUNNING', ?, ?, ?)"#,
            )
            .bind(study_id.get())
            .bind(model_id.get())
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) => ids.push(EvaluationId(done.last_insert_rowid())),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tx.rollback().await?;
                    return Err(DomainError::DuplicateEvaluation {
                        model_id,
                        study_id: *study_id,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn get(&self, id: EvaluationId) -> DomainResult<Option<StudyEvaluation>> {
        let row: Option<EvaluationRow> =
            sqlx::query_as(&format!("SELECT {EVAL_COLUMNS} FROM study_evaluations WHERE id = ?"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find(
        &self,
        model_id: ModelId,
        study_id: StudyId,
    ) -> DomainResult<Option<StudyEvaluation>> {
        let row: Option<EvaluationRow> = sqlx::query_as(&format!(
            "SELECT {EVAL_COLUMNS} FROM study_evaluations WHERE model_id = ? AND study_id = ?"
        ))
        .bind(model_id.get())
        .bind(study_id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn transition(
        &self,
        id: EvaluationId,
        to: EvaluationStatus,
    ) -> DomainResult<TransitionOutcome> {
        let sources = EvaluationStatus::sources_of(to);
        if sources.is_empty() {
            return self.resolve_unapplied(id, to).await;
        }

        let now = format_datetime(Utc::now());
        let timing = match to {
            EvaluationStatus::Running => {
                ", start_time = ?, finish_time = NULL, model_output = NULL, img_output_path = NULL"
            }
            EvaluationStatus::Completed | EvaluationStatus::Failed => ", finish_time = ?",
            EvaluationStatus::Queued => "",
        };
        let sql = format!(
            "UPDATE study_evaluations SET status = ?, updated_at = ?{timing} \
             WHERE id = ? AND status IN ({})",
            placeholders(sources.len())
        );

        let mut q = sqlx::query(&sql).bind(to.as_str()).bind(&now);
        if !timing.is_empty() {
            q = q.bind(&now);
        }
        q = q.bind(id.get());
        for source in &sources {
            q = q.bind(source.as_str());
        }

        if q.execute(&self.pool).await?.rows_affected() == 1 {
            Ok(TransitionOutcome::Applied)
        } else {
            self.resolve_unapplied(id, to).await
        }
    }

    async fn complete(
        &self,
        id: EvaluationId,
        output: &Value,
        img_output_path: Option<&str>,
    ) -> DomainResult<TransitionOutcome> {
        let now = format_datetime(Utc::now());
        let result = sqlx::query(
            r#"UPDATE study_evaluations
               SET status = 'COMPLETED', model_output = ?, img_output_path = ?,
                   finish_time = ?, updated_at = ?
               WHERE id = ? AND status = 'RUNNING'"#,
        )
        .bind(serde_json::to_string(output)?)
        .bind(img_output_path)
        .bind(&now)
        .bind(&now)
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(TransitionOutcome::Applied)
        } else {
            self.resolve_unapplied(id, EvaluationStatus::Completed).await
        }
    }

    async fn fail(
        &self,
        id: EvaluationId,
        output: Option<&Value>,
    ) -> DomainResult<TransitionOutcome> {
        let output = output.map(serde_json::to_string).transpose()?;
        let now = format_datetime(Utc::now());
        let result = sqlx::query(
            r#"UPDATE study_evaluations
               SET status = 'FAILED', model_output = COALESCE(?, model_output),
                   finish_time = ?, updated_at = ?
               WHERE id = ? AND status IN ('QUEUED', 'RUNNING')"#,
        )
        .bind(output)
        .bind(&now)
        .bind(&now)
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(TransitionOutcome::Applied)
        } else {
            self.resolve_unapplied(id, EvaluationStatus::Failed).await
        }
    }

    async fn fail_many(&self, ids: &[EvaluationId]) -> DomainResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = format_datetime(Utc::now());
        let sql = format!(
            "UPDATE study_evaluations SET status = 'FAILED', finish_time = ?, updated_at = ? \
             WHERE status IN ('QUEUED', 'RUNNING') AND id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql).bind(&now).bind(&now);
        for id in ids {
            q = q.bind(id.get());
        }

        Ok(q.execute(&self.pool).await?.rows_affected())
    }

    async fn retry_failed(
        &self,
        model_id: ModelId,
        limit: Option<usize>,
    ) -> DomainResult<Vec<EvaluationId>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT id FROM study_evaluations
               WHERE model_id = ? AND status = 'FAILED'
               ORDER BY updated_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(model_id.get())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<EvaluationId> = rows.into_iter().map(|(id,)| EvaluationId(id)).collect();
        Self::restart(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn retry_failed_in_experiment(
        &self,
        experiment_id: ExperimentId,
        model_id: ModelId,
    ) -> DomainResult<Vec<EvaluationId>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT e.id FROM study_evaluations e
               JOIN experiment_studies x ON x.study_id = e.study_id
               WHERE x.experiment_id = ? AND e.model_id = ? AND e.status = 'FAILED'
               ORDER BY e.updated_at ASC, e.id ASC"#,
        )
        .bind(experiment_id.get())
        .bind(model_id.get())
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<EvaluationId> = rows.into_iter().map(|(id,)| EvaluationId(id)).collect();
        Self::restart(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn append_stdout(&self, id: EvaluationId, line: &str) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"UPDATE study_evaluations
               SET stdout = json_insert(stdout, '$[#]', ?), updated_at = ?
               WHERE id = ? AND status IN ('QUEUED', 'RUNNING')"#,
        )
        .bind(line)
        .bind(format_datetime(Utc::now()))
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn dispatch_items(&self, ids: &[EvaluationId]) -> DomainResult<Vec<DispatchItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT e.id, s.archive_id FROM study_evaluations e \
             JOIN studies s ON s.id = e.study_id \
             WHERE e.id IN ({}) ORDER BY e.id",
            placeholders(ids.len())
        );
        let mut q = sqlx::query_as::<_, (i64, String)>(&sql);
        for id in ids {
            q = q.bind(id.get());
        }

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, archive_id)| DispatchItem::new(EvaluationId(id), archive_id))
            .collect())
    }

    async fn count_by_status(
        &self,
        model_id: Option<ModelId>,
    ) -> DomainResult<HashMap<EvaluationStatus, u64>> {
        let rows: Vec<(String, i64)> = match model_id {
            Some(model_id) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM study_evaluations WHERE model_id = ? GROUP BY status",
                )
                .bind(model_id.get())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM study_evaluations GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(parse_status(&status)?, u64::try_from(count).unwrap_or_default());
        }
        Ok(counts)
    }

    async fn delete_orphans(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM study_evaluations
               WHERE status IN ('QUEUED', 'RUNNING') AND model_output IS NULL AND updated_at < ?"#,
        )
        .bind(format_datetime(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn parse_status(s: &str) -> DomainResult<EvaluationStatus> {
    EvaluationStatus::from_str(s)
        .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {s}")))
}

#[derive(sqlx::FromRow)]
struct EvaluationRow {
    id: i64,
    study_id: i64,
    model_id: i64,
    status: String,
    model_output: Option<String>,
    img_output_path: Option<String>,
    stdout: Option<String>,
    start_time: Option<String>,
    finish_time: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<EvaluationRow> for StudyEvaluation {
    type Error = DomainError;

    fn try_from(row: EvaluationRow) -> Result<Self, Self::Error> {
        let model_output = row
            .model_output
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(StudyEvaluation {
            id: EvaluationId(row.id),
            study_id: StudyId(row.study_id),
            model_id: ModelId(row.model_id),
            status: parse_status(&row.status)?,
            model_output,
            img_output_path: row.img_output_path,
            stdout: parse_json_or_default(row.stdout)?,
            start_time: parse_optional_datetime(row.start_time)?,
            finish_time: parse_optional_datetime(row.finish_time)?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteModelRepository, SqliteStudyRepository,
    };
    use crate::domain::models::{Model, NewStudy};
    use crate::domain::ports::{ModelRepository, StudyRepository};
    use serde_json::json;

    struct Fixture {
        repo: SqliteEvaluationRepository,
        model_id: ModelId,
        studies: Vec<StudyId>,
    }

    async fn setup(study_count: usize) -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let models = SqliteModelRepository::new(pool.clone());
        let studies = SqliteStudyRepository::new(pool.clone());

        let model = models
            .create_model(&Model {
                id: ModelId(0),
                image: "cxr:1".to_string(),
                display_name: "cxr".to_string(),
                input_type: "CXR".to_string(),
                modality: "CR".to_string(),
                has_image_output: false,
                concurrency: 1,
            })
            .await
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..study_count {
            let study = studies
                .insert_new(&NewStudy::new(format!("series-{i}")))
                .await
                .unwrap()
                .unwrap();
            ids.push(study.id);
        }

        Fixture {
            repo: SqliteEvaluationRepository::new(pool),
            model_id: model.id,
            studies: ids,
        }
    }

    #[tokio::test]
    async fn test_create_running_rejects_duplicate_batch_atomically() {
        let f = setup(3).await;
        let first = f.repo.create_running(f.model_id, &f.studies[..1]).await.unwrap();
        assert_eq!(first.len(), 1);

        let err = f.repo.create_running(f.model_id, &f.studies).await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateEvaluation { study_id, .. } if study_id == f.studies[0]));

        // The rest of the rejected batch was rolled back.
        assert!(f.repo.find(f.model_id, f.studies[1]).await.unwrap().is_none());
        assert!(f.repo.find(f.model_id, f.studies[2]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let f = setup(1).await;
        let id = f.repo.create_running(f.model_id, &f.studies).await.unwrap()[0];
        let output = json!({"display": "normal", "image": "/opt/images/a.png"});

        let outcome = f.repo.complete(id, &output, Some("/opt/images/a.png")).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        let first = f.repo.get(id).await.unwrap().unwrap();

        let outcome = f.repo.complete(id, &output, Some("/opt/images/a.png")).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged);
        let second = f.repo.get(id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.status, EvaluationStatus::Completed);
        assert_eq!(second.model_output, Some(output));
        assert!(second.finish_time.is_some());
    }

    #[tokio::test]
    async fn test_completed_cannot_fail() {
        let f = setup(1).await;
        let id = f.repo.create_running(f.model_id, &f.studies).await.unwrap()[0];
        f.repo.complete(id, &json!({}), None).await.unwrap();

        let err = f.repo.fail(id, None).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        let err = f.repo.transition(id, EvaluationStatus::Running).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_evaluation() {
        let f = setup(0).await;
        let err = f.repo.complete(EvaluationId(42), &json!({}), None).await.unwrap_err();
        assert!(matches!(err, DomainError::EvaluationNotFound(EvaluationId(42))));
    }

    #[tokio::test]
    async fn test_retry_failed_reuses_rows() {
        let f = setup(3).await;
        let ids = f.repo.create_running(f.model_id, &f.studies).await.unwrap();
        assert_eq!(f.repo.fail_many(&ids).await.unwrap(), 3);

        let limited = f.repo.retry_failed(f.model_id, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);

        let rest = f.repo.retry_failed(f.model_id, None).await.unwrap();
        assert_eq!(rest.len(), 1);

        let mut all: Vec<_> = limited.into_iter().chain(rest).collect();
        all.sort();
        assert_eq!(all, ids);

        let counts = f.repo.count_by_status(Some(f.model_id)).await.unwrap();
        assert_eq!(counts.get(&EvaluationStatus::Running), Some(&3));
        assert_eq!(counts.get(&EvaluationStatus::Failed), None);
        assert!(f.repo.retry_failed(f.model_id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_stdout_only_while_active() {
        let f = setup(1).await;
        let id = f.repo.create_running(f.model_id, &f.studies).await.unwrap()[0];

        assert!(f.repo.append_stdout(id, "loading weights").await.unwrap());
        assert!(f.repo.append_stdout(id, "done").await.unwrap());
        f.repo.complete(id, &json!({}), None).await.unwrap();
        assert!(!f.repo.append_stdout(id, "late").await.unwrap());

        let eval = f.repo.get(id).await.unwrap().unwrap();
        assert_eq!(eval.stdout, vec!["loading weights".to_string(), "done".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_items_pair_ids_with_archive_refs() {
        let f = setup(2).await;
        let ids = f.repo.create_running(f.model_id, &f.studies).await.unwrap();

        let items = f.repo.dispatch_items(&ids).await.unwrap();
        assert_eq!(
            items,
            vec![
                DispatchItem::new(ids[0], "series-0"),
                DispatchItem::new(ids[1], "series-1"),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_orphans_respects_cutoff() {
        let f = setup(2).await;
        let ids = f.repo.create_running(f.model_id, &f.studies).await.unwrap();
        f.repo.complete(ids[1], &json!({}), None).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(f.repo.delete_orphans(past).await.unwrap(), 0);

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(f.repo.delete_orphans(future).await.unwrap(), 1);
        assert!(f.repo.get(ids[0]).await.unwrap().is_none());
        assert!(f.repo.get(ids[1]).await.unwrap().is_some());
    }
}
