//! Study evaluation domain model.
//!
//! A study evaluation is one (study, model) unit of work. Its status follows a
//! small closed state machine; the store refuses any transition not listed in
//! [`EvaluationStatus::valid_transitions`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EvaluationId, ModelId, StudyId};

/// Status of a study evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    /// Selected but dispatch not confirmed (batch staging only)
    Queued,
    /// Dispatched, awaiting a result
    Running,
    /// Finished successfully; immutable
    Completed,
    /// Finished with an error; may be retried
    Failed,
}

impl EvaluationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Queued, Self::Running, Self::Completed, Self::Failed];

    /// Statuses counted as in flight.
    pub const ACTIVE: [Self; 2] = [Self::Queued, Self::Running];

    /// Column value.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a column value.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" | "COMPLETE" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// COMPLETED or FAILED.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// QUEUED or RUNNING.
    pub const fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Queued => vec![Self::Running, Self::Failed],
            Self::Running => vec![Self::Completed, Self::Failed],
            Self::Failed => vec![Self::Running], // retry reuses the row
            Self::Completed => vec![],
        }
    }

    /// Whether the lifecycle allows moving to `new_status`.
    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }

    /// Statuses from which `target` may be reached.
    pub fn sources_of(target: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (study, model) evaluation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyEvaluation {
    /// Store id.
    pub id: EvaluationId,
    /// Evaluated study.
    pub study_id: StudyId,
    /// Evaluating model.
    pub model_id: ModelId,
    /// Lifecycle status.
    pub status: EvaluationStatus,
    /// Model output; `None` until a result arrives.
    pub model_output: Option<Value>,
    /// Auxiliary image written by the model, if any.
    pub img_output_path: Option<String>,
    /// Captured worker log lines.
    pub stdout: Vec<String>,
    /// Set when the evaluation is dispatched.
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the evaluation completes.
    pub finish_time: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
}

impl StudyEvaluation {
    /// Whether the evaluation is finished.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Non-terminal, without output and untouched since `cutoff`.
    pub fn is_orphan(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_active() && self.model_output.is_none() && self.updated_at < cutoff
    }
}

/// Result of applying a transition at the store boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record moved to the requested status.
    Applied,
    /// The record was already in the requested status; nothing was written.
    Unchanged,
}

/// A unit handed to a worker: which evaluation, which archive study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchItem {
    /// Evaluation the input belongs to.
    pub evaluation_id: EvaluationId,
    /// Archive identifier of the study payload.
    pub study_ref: String,
}

impl DispatchItem {
    /// Dispatch item for one evaluation.
    pub fn new(evaluation_id: EvaluationId, study_ref: impl Into<String>) -> Self {
        Self {
            evaluation_id,
            study_ref: study_ref.into(),
        }
    }
}
