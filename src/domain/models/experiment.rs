//! Experiment domain model.
//!
//! An experiment is a bounded re-evaluation campaign of a fixed study set
//! against one model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExperimentId, ModelId};

/// Status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Created, not yet started.
    New,
    /// Being advanced by the sweep.
    Running,
    /// Every member reached a terminal evaluation.
    Completed,
    /// Stopped by an external failure signal.
    Stopped,
}

impl ExperimentStatus {
    /// Column value.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
        }
    }

    /// Parse a column value.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// COMPLETED or STOPPED.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }

    /// Statuses reachable in one step.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::New => vec![Self::Running, Self::Stopped],
            Self::Running => vec![Self::Completed, Self::Stopped],
            Self::Completed | Self::Stopped => vec![],
        }
    }

    /// Whether `new_status` is reachable in one step.
    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded re-evaluation campaign of one model over fixed studies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    /// Store id.
    pub id: ExperimentId,
    /// Display name.
    pub name: String,
    /// Model under test.
    pub model_id: ModelId,
    /// Lifecycle status.
    pub status: ExperimentStatus,
    /// Owning user; notifications are addressed to them.
    pub user_id: Option<i64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change.
    pub updated_at: DateTime<Utc>,
}

/// Membership tallies used to decide whether an experiment is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentCounts {
    /// Member studies with no evaluation row for the experiment model.
    pub unevaluated: u64,
    /// Member evaluations currently queued or running.
    pub in_flight: u64,
    /// Members with a completed evaluation.
    pub completed: u64,
    /// Members with a failed evaluation.
    pub failed: u64,
}

impl ExperimentCounts {
    /// No member lacks a terminal evaluation and nothing is in flight.
    pub const fn is_finished(&self) -> bool {
        self.unevaluated == 0 && self.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExperimentStatus::Completed.is_terminal());
        assert!(ExperimentStatus::Stopped.is_terminal());
        assert!(!ExperimentStatus::Running.is_terminal());
        assert!(!ExperimentStatus::Completed.can_transition_to(ExperimentStatus::Running));
    }

    #[test]
    fn test_counts_finished() {
        let counts = ExperimentCounts {
            unevaluated: 0,
            in_flight: 0,
            completed: 3,
            failed: 1,
        };
        assert!(counts.is_finished());
        assert!(!ExperimentCounts { in_flight: 1, ..counts }.is_finished());
        assert!(!ExperimentCounts { unevaluated: 1, ..counts }.is_finished());
    }
}
