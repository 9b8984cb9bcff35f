//! Domain errors for the evaluation orchestrator.

use thiserror::Error;

use super::models::{EvaluationId, ExperimentId, ModelId, StudyId};

/// Whether a failure is worth retrying on the next scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The backend was unreachable or busy; the same work may succeed later.
    Transient,
    /// The request itself is wrong; retrying it unchanged cannot succeed.
    Terminal,
}

/// Domain-level errors that can occur in the orchestrator.
#[derive(Debug, Error)]
pub enum DomainError {
    /// No study with this archive id.
    #[error("Study not found: {0}")]
    StudyNotFound(String),

    /// No study with this store id.
    #[error("Study {0} not found in store")]
    StudyIdNotFound(StudyId),

    /// No model with this id.
    #[error("Model not found: {0}")]
    ModelNotFound(ModelId),

    /// The model has no eval job.
    #[error("No eval job configured for model {0}")]
    EvalJobNotFound(ModelId),

    /// No evaluation with this id.
    #[error("Evaluation not found: {0}")]
    EvaluationNotFound(EvaluationId),

    /// No experiment with this id.
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),

    /// The transition table forbids the move.
    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
        /// Why the move was refused.
        reason: String,
    },

    /// A (model, study) pair already has an evaluation.
    #[error("Evaluation already exists for model {model_id} and study {study_id}")]
    DuplicateEvaluation {
        /// Evaluating model.
        model_id: ModelId,
        /// Already evaluated study.
        study_id: StudyId,
    },

    /// A worker message could not be parsed.
    #[error("Malformed result message: {0}")]
    MalformedResult(String),

    /// Input rejected before reaching the store.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The archive could not be reached or answered with an error.
    #[error("Archive unavailable: {0}")]
    ArchiveUnavailable(String),

    /// No worker could be started or reached.
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    /// The notification bus refused a message.
    #[error("Notification bus error: {0}")]
    BusError(String),

    /// The store failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DomainError {
    /// Classify this error for the retry policy.
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::ArchiveUnavailable(_)
            | Self::DispatchFailed(_)
            | Self::BusError(_)
            | Self::DatabaseError(_) => FailureClass::Transient,
            _ => FailureClass::Terminal,
        }
    }

    /// Whether retrying later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), FailureClass::Transient)
    }
}

/// Result alias used across the domain.
pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
