//! Study evaluation repository port.
//!
//! Every status write goes through a conditional update keyed on the
//! transition table, so the store is the single place illegal transitions
//! are rejected.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    DispatchItem, EvaluationId, EvaluationStatus, ExperimentId, ModelId, StudyEvaluation, StudyId,
    TransitionOutcome,
};

/// Repository interface for StudyEvaluation persistence.
#[async_trait]
pub trait EvaluationRepository: Send + Sync {
    /// Insert one RUNNING evaluation per study in a single transaction.
    ///
    /// Fails with `DuplicateEvaluation` and writes nothing if any
    /// (model, study) pair already has a row.
    async fn create_running(
        &self,
        model_id: ModelId,
        study_ids: &[StudyId],
    ) -> DomainResult<Vec<EvaluationId>>;

    /// Evaluation by id.
    async fn get(&self, id: EvaluationId) -> DomainResult<Option<StudyEvaluation>>;

    /// Evaluation of a (model, study) pair, if any.
    async fn find(
        &self,
        model_id: ModelId,
        study_id: StudyId,
    ) -> DomainResult<Option<StudyEvaluation>>;

    /// Move an evaluation to `to`.
    ///
    /// Returns `Unchanged` when it is already there and
    /// `InvalidStateTransition` when the table forbids the move.
    async fn transition(
        &self,
        id: EvaluationId,
        to: EvaluationStatus,
    ) -> DomainResult<TransitionOutcome>;

    /// RUNNING to COMPLETED, recording the output and artifact path.
    async fn complete(
        &self,
        id: EvaluationId,
        output: &Value,
        img_output_path: Option<&str>,
    ) -> DomainResult<TransitionOutcome>;

    /// Non-terminal to FAILED, recording any error output.
    async fn fail(&self, id: EvaluationId, output: Option<&Value>)
        -> DomainResult<TransitionOutcome>;

    /// Fail every non-terminal evaluation among `ids` in one statement.
    async fn fail_many(&self, ids: &[EvaluationId]) -> DomainResult<u64>;

    /// Flip FAILED evaluations of a model back to RUNNING, oldest first.
    async fn retry_failed(
        &self,
        model_id: ModelId,
        limit: Option<usize>,
    ) -> DomainResult<Vec<EvaluationId>>;

    /// Flip FAILED evaluations of an experiment's members back to RUNNING.
    async fn retry_failed_in_experiment(
        &self,
        experiment_id: ExperimentId,
        model_id: ModelId,
    ) -> DomainResult<Vec<EvaluationId>>;

    /// Append a captured log line. Returns `false` when the evaluation is
    /// terminal or unknown.
    async fn append_stdout(&self, id: EvaluationId, line: &str) -> DomainResult<bool>;

    /// Pair each id with its study's archive reference, in id order.
    async fn dispatch_items(&self, ids: &[EvaluationId]) -> DomainResult<Vec<DispatchItem>>;

    /// Evaluation counts per status, optionally for one model.
    async fn count_by_status(
        &self,
        model_id: Option<ModelId>,
    ) -> DomainResult<HashMap<EvaluationStatus, u64>>;

    /// Delete non-terminal evaluations with no output last touched before
    /// `cutoff`.
    async fn delete_orphans(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;
}
