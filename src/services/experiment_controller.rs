//! Experiment campaigns.
//!
//! An experiment re-evaluates a fixed set of studies with one model in small
//! batches, never letting more than [`EXPERIMENT_IN_FLIGHT_CEILING`] member
//! evaluations run at once, and completes once every member has a terminal
//! evaluation.

use std::sync::Arc;

use futures::future::join_all;
use tracing::instrument;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    EvaluationId, Experiment, ExperimentId, ExperimentStatus, NotificationKind, TransitionOutcome,
};
use crate::domain::ports::Store;
use crate::services::evaluation_orchestrator::EvaluationOrchestrator;
use crate::services::notifier::Notifier;

/// No new member evaluations are created while this many are in flight.
pub const EXPERIMENT_IN_FLIGHT_CEILING: u64 = 5;

/// Result of one [`ExperimentController::advance_experiment`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentProgress {
    /// Every member has a terminal evaluation; the experiment is COMPLETED.
    Completed,
    /// Work was retried, created or held back.
    Advanced {
        /// FAILED member evaluations sent again.
        retried: Vec<EvaluationId>,
        /// Member evaluations created this round.
        created: Vec<EvaluationId>,
        /// New work was held back by the in-flight ceiling.
        throttled: bool,
    },
}

/// Drives experiments through the orchestrator in capped batches.
pub struct ExperimentController {
    store: Store,
    orchestrator: Arc<EvaluationOrchestrator>,
    notifier: Notifier,
}

impl ExperimentController {
    /// Controller dispatching through `orchestrator`.
    pub fn new(store: Store, orchestrator: Arc<EvaluationOrchestrator>, notifier: Notifier) -> Self {
        Self {
            store,
            orchestrator,
            notifier,
        }
    }

    /// Experiments in RUNNING.
    pub async fn get_runnable_experiments(&self) -> DomainResult<Vec<Experiment>> {
        self.store.experiments.list_by_status(ExperimentStatus::Running).await
    }

    async fn load(&self, id: ExperimentId) -> DomainResult<Experiment> {
        self.store
            .experiments
            .get(id)
            .await?
            .ok_or(DomainError::ExperimentNotFound(id))
    }

    /// NEW to RUNNING so the sweep picks the experiment up.
    pub async fn start_experiment(&self, id: ExperimentId) -> DomainResult<TransitionOutcome> {
        let outcome = self.store.experiments.transition(id, ExperimentStatus::Running).await?;
        tracing::info!(experiment_id = %id, ?outcome, "experiment started");
        Ok(outcome)
    }

    /// Complete a finished experiment, otherwise retry its failures and
    /// create up to `batch_size` member evaluations below the in-flight ceiling.
    #[instrument(skip(self, experiment), fields(experiment_id = %experiment.id, model_id = %experiment.model_id))]
    pub async fn advance_experiment(
        &self,
        experiment: &Experiment,
        batch_size: usize,
    ) -> DomainResult<ExperimentProgress> {
        let counts = self.store.experiments.counts(experiment).await?;

        if counts.is_finished() {
            let outcome = self
                .store
                .experiments
                .transition(experiment.id, ExperimentStatus::Completed)
                .await?;
            if outcome == TransitionOutcome::Applied {
                tracing::info!(
                    completed = counts.completed,
                    failed = counts.failed,
                    "experiment finished"
                );
                self.notifier.to_user(
                    experiment.user_id,
                    NotificationKind::ExperimentFinished,
                    format!("Experiment {} finished", experiment.name),
                );
            }
            return Ok(ExperimentProgress::Completed);
        }

        let model = self
            .store
            .models
            .get_model(experiment.model_id)
            .await?
            .ok_or(DomainError::ModelNotFound(experiment.model_id))?;
        let cpu = self
            .store
            .models
            .get_job(model.id)
            .await?
            .is_some_and(|job| job.cpu);

        let retried = self
            .store
            .evaluations
            .retry_failed_in_experiment(experiment.id, model.id)
            .await?;
        if !retried.is_empty() {
            tracing::info!(count = retried.len(), "retrying failed experiment evaluations");
            self.orchestrator.dispatch_evaluations(&model, &retried, cpu).await?;
        }

        let in_flight = counts.in_flight + retried.len() as u64;
        if in_flight >= EXPERIMENT_IN_FLIGHT_CEILING {
            tracing::debug!(in_flight, "experiment throttled");
            return Ok(ExperimentProgress::Advanced {
                retried,
                created: Vec::new(),
                throttled: true,
            });
        }

        let members = self
            .store
            .experiments
            .list_unevaluated_members(experiment, batch_size)
            .await?;
        let created = match self.orchestrator.create_evaluations(&model, &members).await {
            Ok(ids) => ids,
            Err(DomainError::DuplicateEvaluation { study_id, .. }) => {
                tracing::warn!(study_id = %study_id, "experiment members already claimed, skipping");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        self.orchestrator.dispatch_evaluations(&model, &created, cpu).await?;

        Ok(ExperimentProgress::Advanced {
            retried,
            created,
            throttled: false,
        })
    }

    /// Advance every running experiment concurrently. One experiment's
    /// failure does not affect the others.
    pub async fn advance_all(&self, batch_size: usize) -> DomainResult<Vec<(ExperimentId, ExperimentProgress)>> {
        let experiments = self.get_runnable_experiments().await?;
        let results = join_all(
            experiments
                .iter()
                .map(|experiment| self.advance_experiment(experiment, batch_size)),
        )
        .await;

        let mut progress = Vec::with_capacity(results.len());
        for (experiment, result) in experiments.iter().zip(results) {
            match result {
                Ok(p) => progress.push((experiment.id, p)),
                Err(e) => {
                    tracing::error!(experiment_id = %experiment.id, error = %e, "failed to advance experiment");
                }
            }
        }
        Ok(progress)
    }

    /// Stop an experiment on an external failure signal.
    pub async fn stop_experiment(&self, id: ExperimentId, reason: &str) -> DomainResult<TransitionOutcome> {
        let experiment = self.load(id).await?;
        if experiment.status == ExperimentStatus::Stopped {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !experiment.status.can_transition_to(ExperimentStatus::Stopped) {
            return Err(DomainError::InvalidStateTransition {
                from: experiment.status.to_string(),
                to: ExperimentStatus::Stopped.to_string(),
                reason: format!("experiment {id} already finished"),
            });
        }

        self.notifier.to_user(
            experiment.user_id,
            NotificationKind::ExperimentFailed,
            format!("Experiment {} stopped: {reason}", experiment.name),
        );
        let outcome = self
            .store
            .experiments
            .transition(id, ExperimentStatus::Stopped)
            .await?;
        tracing::warn!(experiment_id = %id, reason, "experiment stopped");
        Ok(outcome)
    }
}
