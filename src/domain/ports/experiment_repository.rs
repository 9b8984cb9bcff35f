//! Experiment repository port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Experiment, ExperimentCounts, ExperimentId, ExperimentStatus, ModelId, Study, StudyId,
    TransitionOutcome,
};

/// Repository interface for experiments and their member studies.
#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    /// Create an experiment in NEW with a fixed member set.
    async fn create(
        &self,
        name: &str,
        model_id: ModelId,
        user_id: Option<i64>,
        study_ids: &[StudyId],
    ) -> DomainResult<Experiment>;

    /// Experiment by id.
    async fn get(&self, id: ExperimentId) -> DomainResult<Option<Experiment>>;

    /// All experiments, newest first.
    async fn list(&self) -> DomainResult<Vec<Experiment>>;

    /// Experiments in `status`.
    async fn list_by_status(&self, status: ExperimentStatus) -> DomainResult<Vec<Experiment>>;

    /// Move to `status` if the transition table allows it.
    async fn transition(
        &self,
        id: ExperimentId,
        to: ExperimentStatus,
    ) -> DomainResult<TransitionOutcome>;

    /// Member tallies against the experiment's model.
    async fn counts(&self, experiment: &Experiment) -> DomainResult<ExperimentCounts>;

    /// Members with no evaluation row for the experiment's model, oldest first.
    async fn list_unevaluated_members(
        &self,
        experiment: &Experiment,
        limit: usize,
    ) -> DomainResult<Vec<Study>>;
}
