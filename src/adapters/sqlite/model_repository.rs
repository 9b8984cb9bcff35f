//! SQLite implementation of the ModelRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{format_datetime, parse_optional_datetime, to_u32};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{EvalJob, EvalJobId, Model, ModelId};
use crate::domain::ports::ModelRepository;

const MODEL_COLUMNS: &str =
    "m.id, m.image, m.display_name, m.input_type, m.modality, m.has_image_output, m.concurrency";

const JOB_COLUMNS: &str =
    "id, model_id, batch_size, running, cpu, replicas, delete_from_archive, last_run";

/// SQLite [`ModelRepository`].
#[derive(Clone)]
pub struct SqliteModelRepository {
    pool: SqlitePool,
}

impl SqliteModelRepository {
    /// Repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModelRepository for SqliteModelRepository {
    async fn create_model(&self, model: &Model) -> DomainResult<Model> {
        let result = sqlx::query(
            r#"INSERT INTO models (image, display_name, input_type, modality, has_image_output, concurrency)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&model.image)
        .bind(&model.display_name)
        .bind(&model.input_type)
        .bind(&model.modality)
        .bind(model.has_image_output)
        .bind(i64::from(model.concurrency))
        .execute(&self.pool)
        .await?;

        Ok(Model {
            id: ModelId(result.last_insert_rowid()),
            ..model.clone()
        })
    }

    async fn get_model(&self, id: ModelId) -> DomainResult<Option<Model>> {
        let row: Option<ModelRow> =
            sqlx::query_as(&format!("SELECT {MODEL_COLUMNS} FROM models m WHERE m.id = ?"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_models(&self) -> DomainResult<Vec<Model>> {
        let rows: Vec<ModelRow> =
            sqlx::query_as(&format!("SELECT {MODEL_COLUMNS} FROM models m ORDER BY m.id"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn upsert_job(&self, job: &EvalJob) -> DomainResult<EvalJob> {
        sqlx::query(
            r#"INSERT INTO eval_jobs (model_id, batch_size, running, cpu, replicas, delete_from_archive, last_run)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(model_id) DO UPDATE SET
                   batch_size = excluded.batch_size,
                   running = excluded.running,
                   cpu = excluded.cpu,
                   replicas = excluded.replicas,
                   delete_from_archive = excluded.delete_from_archive"#,
        )
        .bind(job.model_id.get())
        .bind(i64::from(job.batch_size))
        .bind(job.running)
        .bind(job.cpu)
        .bind(i64::from(job.replicas))
        .bind(job.delete_from_archive)
        .bind(job.last_run.map(format_datetime))
        .execute(&self.pool)
        .await?;

        self.get_job(job.model_id)
            .await?
            .ok_or(DomainError::EvalJobNotFound(job.model_id))
    }

    async fn get_job(&self, model_id: ModelId) -> DomainResult<Option<EvalJob>> {
        let row: Option<EvalJobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM eval_jobs WHERE model_id = ?"))
                .bind(model_id.get())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_jobs(&self) -> DomainResult<Vec<EvalJob>> {
        let rows: Vec<EvalJobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM eval_jobs ORDER BY model_id"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_running_jobs(&self) -> DomainResult<Vec<EvalJob>> {
        // Never-run jobs sort first.
        let rows: Vec<EvalJobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM eval_jobs WHERE running = 1 \
             ORDER BY last_run IS NOT NULL, last_run ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn touch_last_run(&self, model_id: ModelId, at: DateTime<Utc>) -> DomainResult<()> {
        let result = sqlx::query("UPDATE eval_jobs SET last_run = ? WHERE model_id = ?")
            .bind(format_datetime(at))
            .bind(model_id.get())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EvalJobNotFound(model_id));
        }

        Ok(())
    }

    async fn get_classifier(&self, modality: &str) -> DomainResult<Option<Model>> {
        let row: Option<ModelRow> = sqlx::query_as(&format!(
            "SELECT {MODEL_COLUMNS} FROM classifiers c JOIN models m ON c.model_id = m.id \
             WHERE c.modality = ?"
        ))
        .bind(modality)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn set_classifier(&self, modality: &str, model_id: ModelId) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO classifiers (modality, model_id) VALUES (?, ?)
               ON CONFLICT(modality) DO UPDATE SET model_id = excluded.model_id"#,
        )
        .bind(modality)
        .bind(model_id.get())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ModelRow {
    id: i64,
    image: String,
    display_name: String,
    input_type: String,
    modality: String,
    has_image_output: bool,
    concurrency: i64,
}

impl TryFrom<ModelRow> for Model {
    type Error = DomainError;

    fn try_from(row: ModelRow) -> Result<Self, Self::Error> {
        Ok(Model {
            id: ModelId(row.id),
            image: row.image,
            display_name: row.display_name,
            input_type: row.input_type,
            modality: row.modality,
            has_image_output: row.has_image_output,
            concurrency: to_u32(row.concurrency, "concurrency")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EvalJobRow {
    id: i64,
    model_id: i64,
    batch_size: i64,
    running: bool,
    cpu: bool,
    replicas: i64,
    delete_from_archive: bool,
    last_run: Option<String>,
}

impl TryFrom<EvalJobRow> for EvalJob {
    type Error = DomainError;

    fn try_from(row: EvalJobRow) -> Result<Self, Self::Error> {
        Ok(EvalJob {
            id: EvalJobId(row.id),
            model_id: ModelId(row.model_id),
            batch_size: to_u32(row.batch_size, "batch_size")?,
            running: row.running,
            cpu: row.cpu,
            replicas: to_u32(row.replicas, "replicas")?,
            delete_from_archive: row.delete_from_archive,
            last_run: parse_optional_datetime(row.last_run)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup_test_repo() -> SqliteModelRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteModelRepository::new(pool)
    }

    fn model(name: &str) -> Model {
        Model {
            id: ModelId(0),
            image: format!("{name}:latest"),
            display_name: name.to_string(),
            input_type: "CXR".to_string(),
            modality: "CR".to_string(),
            has_image_output: false,
            concurrency: 1,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_model() {
        let repo = setup_test_repo().await;
        let created = repo.create_model(&model("pneumonia")).await.unwrap();
        assert!(created.id.get() > 0);

        let fetched = repo.get_model(created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(repo.get_model(ModelId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_job_replaces_settings() {
        let repo = setup_test_repo().await;
        let m = repo.create_model(&model("m")).await.unwrap();

        let job = repo.upsert_job(&EvalJob::new(m.id).with_batch_size(4)).await.unwrap();
        assert_eq!(job.batch_size, 4);

        let job = repo.upsert_job(&EvalJob::new(m.id).with_replicas(2)).await.unwrap();
        assert_eq!(job.batch_size, 1);
        assert_eq!(job.replicas, 2);
        assert_eq!(repo.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_running_jobs_ordered_by_last_run() {
        let repo = setup_test_repo().await;
        let a = repo.create_model(&model("a")).await.unwrap();
        let b = repo.create_model(&model("b")).await.unwrap();
        let c = repo.create_model(&model("c")).await.unwrap();
        repo.upsert_job(&EvalJob::new(a.id)).await.unwrap();
        repo.upsert_job(&EvalJob::new(b.id)).await.unwrap();
        let mut stopped = EvalJob::new(c.id);
        stopped.running = false;
        repo.upsert_job(&stopped).await.unwrap();

        repo.touch_last_run(a.id, Utc::now()).await.unwrap();

        let order: Vec<_> = repo
            .list_running_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.model_id)
            .collect();
        assert_eq!(order, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_touch_last_run_without_job() {
        let repo = setup_test_repo().await;
        let err = repo.touch_last_run(ModelId(7), Utc::now()).await.unwrap_err();
        assert!(matches!(err, DomainError::EvalJobNotFound(ModelId(7))));
    }

    #[tokio::test]
    async fn test_classifier_lookup() {
        let repo = setup_test_repo().await;
        let classifier = repo.create_model(&model("view-classifier")).await.unwrap();

        assert!(repo.get_classifier("CR").await.unwrap().is_none());
        repo.set_classifier("CR", classifier.id).await.unwrap();
        assert_eq!(
            repo.get_classifier("CR").await.unwrap().map(|m| m.id),
            Some(classifier.id)
        );
    }
}
