//! Model, eval job and classifier repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{EvalJob, Model, ModelId};

/// Repository interface for models and their standing jobs.
///
/// Models are registered by the surrounding platform; the runner only reads
/// them, apart from bookkeeping on eval jobs.
#[async_trait]
pub trait ModelRepository: Send + Sync {
    /// Register a model. The `id` field is ignored and assigned by the store.
    async fn create_model(&self, model: &Model) -> DomainResult<Model>;

    /// Model by id.
    async fn get_model(&self, id: ModelId) -> DomainResult<Option<Model>>;

    /// All models.
    async fn list_models(&self) -> DomainResult<Vec<Model>>;

    /// Create or replace the job bound to `job.model_id`.
    async fn upsert_job(&self, job: &EvalJob) -> DomainResult<EvalJob>;

    /// Eval job of a model.
    async fn get_job(&self, model_id: ModelId) -> DomainResult<Option<EvalJob>>;

    /// All eval jobs, least recently run first.
    async fn list_jobs(&self) -> DomainResult<Vec<EvalJob>>;

    /// Jobs flagged running, least recently run first.
    async fn list_running_jobs(&self) -> DomainResult<Vec<EvalJob>>;

    /// Record that a cycle ran at `at`.
    async fn touch_last_run(&self, model_id: ModelId, at: DateTime<Utc>) -> DomainResult<()>;

    /// Classifier model registered for a modality.
    async fn get_classifier(&self, modality: &str) -> DomainResult<Option<Model>>;

    /// Register the classifier model of a modality, replacing any other.
    async fn set_classifier(&self, modality: &str, model_id: ModelId) -> DomainResult<()>;
}
