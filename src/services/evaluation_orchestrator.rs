//! Evaluation orchestration.
//!
//! One cycle per model: retry what failed, top up with fresh eligible studies,
//! create their evaluation rows and hand the whole set to a worker in a single
//! dispatch. Every decision is re-derived from the store, so cycles are
//! re-entrant and an overlapping cycle is absorbed by the (model, study)
//! uniqueness constraint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    DispatchItem, DispatchMode, EvaluationId, Model, ModelId, NotificationKind, OrchestratorConfig,
    Study, Topic, WarmStartRequest,
};
use crate::domain::ports::{ArchiveClient, BatchRequest, Store, WorkerDispatcher};
use crate::services::notifier::Notifier;

/// What happened to a batch handed to [`EvaluationOrchestrator::dispatch`].
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Nothing to dispatch.
    Empty,
    /// Handed to a worker; results arrive on the bus.
    Dispatched {
        /// How the batch was handed off.
        mode: DispatchMode,
        /// Ids in the batch.
        evaluation_ids: Vec<EvaluationId>,
        /// Set for on-demand batches.
        correlation_id: Option<Uuid>,
    },
    /// The batch could not be handed off; every id in it is now FAILED.
    Failed {
        /// Ids in the batch.
        evaluation_ids: Vec<EvaluationId>,
        /// Why the hand-off failed.
        error: DomainError,
    },
}

impl DispatchOutcome {
    /// Whether the batch could not be dispatched.
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Ids in the batch, whatever the outcome.
    pub fn evaluation_ids(&self) -> &[EvaluationId] {
        match self {
            Self::Empty => &[],
            Self::Dispatched { evaluation_ids, .. } | Self::Failed { evaluation_ids, .. } => {
                evaluation_ids
            }
        }
    }
}

/// Summary of one [`EvaluationOrchestrator::run_cycle`].
#[derive(Debug)]
pub struct CycleReport {
    /// Model the cycle ran for.
    pub model_id: ModelId,
    /// FAILED evaluations flipped back to RUNNING.
    pub retried: Vec<EvaluationId>,
    /// Evaluations created for fresh studies.
    pub created: Vec<EvaluationId>,
    /// Fresh studies were skipped because another cycle claimed them first.
    pub duplicate_skipped: bool,
    /// What happened to retried plus created ids.
    pub dispatch: DispatchOutcome,
}

impl CycleReport {
    fn idle(model_id: ModelId) -> Self {
        Self {
            model_id,
            retried: Vec::new(),
            created: Vec::new(),
            duplicate_skipped: false,
            dispatch: DispatchOutcome::Empty,
        }
    }

    /// Nothing was retried or created.
    pub fn is_idle(&self) -> bool {
        self.retried.is_empty() && self.created.is_empty()
    }
}

/// Owns the evaluation state machine for every model.
pub struct EvaluationOrchestrator {
    store: Store,
    archive: Arc<dyn ArchiveClient>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    notifier: Notifier,
    config: OrchestratorConfig,
}

impl EvaluationOrchestrator {
    /// Orchestrator over the given store and dispatcher.
    pub fn new(
        store: Store,
        archive: Arc<dyn ArchiveClient>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        notifier: Notifier,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            archive,
            dispatcher,
            notifier,
            config,
        }
    }

    /// Active orchestrator settings.
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Studies of the model's input type that it has never evaluated,
    /// oldest first.
    pub async fn select_eligible_studies(&self, model: &Model, limit: usize) -> DomainResult<Vec<Study>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store
            .studies
            .list_eligible(model.id, &model.input_type, limit)
            .await
    }

    /// Create one RUNNING evaluation per study, all or nothing.
    pub async fn create_evaluations(&self, model: &Model, studies: &[Study]) -> DomainResult<Vec<EvaluationId>> {
        if studies.is_empty() {
            return Ok(Vec::new());
        }

        let study_ids: Vec<_> = studies.iter().map(|s| s.id).collect();
        let ids = self.store.evaluations.create_running(model.id, &study_ids).await?;

        for (study, id) in studies.iter().zip(&ids) {
            tracing::info!(
                evaluation_id = %id,
                model_id = %model.id,
                study = %study.archive_id,
                "evaluation started"
            );
            self.notifier.broadcast(
                NotificationKind::EvalStarted,
                format!(
                    "Started evaluating {} with model {}",
                    study.archive_id, model.display_name
                ),
            );
        }

        Ok(ids)
    }

    /// Flip FAILED evaluations of the model back to RUNNING, reusing their ids.
    pub async fn retry_failed(&self, model: &Model, limit: Option<usize>) -> DomainResult<Vec<EvaluationId>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        let ids = self.store.evaluations.retry_failed(model.id, limit).await?;
        if !ids.is_empty() {
            tracing::info!(model_id = %model.id, count = ids.len(), "retrying failed evaluations");
        }
        Ok(ids)
    }

    /// Hand a batch to a worker.
    ///
    /// Archive or dispatcher errors fail every evaluation in the batch and
    /// come back inside the outcome rather than as an `Err`.
    pub async fn dispatch(&self, model: &Model, items: Vec<DispatchItem>, cpu: bool) -> DispatchOutcome {
        if items.is_empty() {
            return DispatchOutcome::Empty;
        }

        let evaluation_ids: Vec<EvaluationId> = items.iter().map(|i| i.evaluation_id).collect();
        for item in &items {
            tracing::info!(
                evaluation_id = %item.evaluation_id,
                study = %item.study_ref,
                model_id = %model.id,
                "dispatching evaluation"
            );
        }

        match self.try_dispatch(model, &items, cpu).await {
            Ok((mode, correlation_id)) => DispatchOutcome::Dispatched {
                mode,
                evaluation_ids,
                correlation_id,
            },
            Err(error) => {
                tracing::error!(model_id = %model.id, error = %error, "dispatch failed");
                self.abandon(model, &evaluation_ids, &error).await;
                DispatchOutcome::Failed {
                    evaluation_ids,
                    error,
                }
            }
        }
    }

    async fn try_dispatch(
        &self,
        model: &Model,
        items: &[DispatchItem],
        cpu: bool,
    ) -> DomainResult<(DispatchMode, Option<Uuid>)> {
        let mode = self
            .store
            .models
            .get_job(model.id)
            .await?
            .map_or(DispatchMode::OnDemand, |job| job.dispatch_mode());

        for item in items {
            self.archive.download(&item.study_ref).await?;
        }

        let study_refs: Vec<String> = items.iter().map(|i| i.study_ref.clone()).collect();
        let evaluation_ids: Vec<EvaluationId> = items.iter().map(|i| i.evaluation_id).collect();

        match mode {
            DispatchMode::OnDemand => {
                let correlation_id = Uuid::new_v4();
                self.dispatcher
                    .start_batch(BatchRequest {
                        image: model.image.clone(),
                        study_refs,
                        correlation_id,
                        evaluation_ids,
                        cpu,
                        result_queue: Topic::EvaluationResults.name(),
                    })
                    .await?;
                Ok((mode, Some(correlation_id)))
            }
            DispatchMode::WarmStart { .. } => {
                let request = WarmStartRequest::evaluate(study_refs, evaluation_ids);
                self.dispatcher
                    .publish(&Topic::WorkerQueue(model.id).name(), serde_json::to_value(&request)?)
                    .await?;
                Ok((mode, None))
            }
        }
    }

    /// Resolve ids to dispatch items and dispatch them.
    pub async fn dispatch_evaluations(
        &self,
        model: &Model,
        ids: &[EvaluationId],
        cpu: bool,
    ) -> DomainResult<DispatchOutcome> {
        if ids.is_empty() {
            return Ok(DispatchOutcome::Empty);
        }
        let items = match self.store.evaluations.dispatch_items(ids).await {
            Ok(items) => items,
            Err(e) => {
                self.abandon(model, ids, &e).await;
                return Err(e);
            }
        };
        Ok(self.dispatch(model, items, cpu).await)
    }

    /// Fail RUNNING ids that will not reach a worker. Best effort: the error
    /// that abandoned them is what the caller sees.
    async fn abandon(&self, model: &Model, ids: &[EvaluationId], error: &DomainError) {
        if let Err(e) = self.fail_evaluations(model, ids, &error.to_string()).await {
            tracing::error!(model_id = %model.id, error = %e, "failed to record batch failure");
        }
    }

    /// Batch failure: one aggregate notification, then every id to FAILED.
    pub async fn fail_evaluations(&self, model: &Model, ids: &[EvaluationId], reason: &str) -> DomainResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.notifier.broadcast(
            NotificationKind::EvalFailed,
            format!(
                "Evaluation of {} studies using model {} failed: {reason}",
                ids.len(),
                model.display_name
            ),
        );
        let failed = self.store.evaluations.fail_many(ids).await?;
        tracing::warn!(model_id = %model.id, failed, reason, "evaluations failed");
        Ok(failed)
    }

    /// One polling cycle for a model.
    #[instrument(skip(self), fields(model_id = %model_id))]
    pub async fn run_cycle(&self, model_id: ModelId, batch_size: usize, cpu: bool) -> DomainResult<CycleReport> {
        let model = self
            .store
            .models
            .get_model(model_id)
            .await?
            .ok_or(DomainError::ModelNotFound(model_id))?;

        let retry_limit = self.config.retries_share_batch_cap.then_some(batch_size);
        let retried = self.retry_failed(&model, retry_limit).await?;

        let capacity = if self.config.retries_share_batch_cap {
            batch_size.saturating_sub(retried.len())
        } else {
            batch_size
        };
        let mut report = CycleReport::idle(model_id);
        report.retried = retried;

        // Retried rows are RUNNING from here on: any error before dispatch
        // must fail them again.
        let fresh = match self.select_eligible_studies(&model, capacity).await {
            Ok(studies) => self.create_evaluations(&model, &studies).await,
            Err(e) => Err(e),
        };
        match fresh {
            Ok(created) => report.created = created,
            Err(DomainError::DuplicateEvaluation { study_id, .. }) => {
                tracing::warn!(
                    study_id = %study_id,
                    "fresh studies already claimed by an overlapping cycle, skipping them"
                );
                report.duplicate_skipped = true;
            }
            Err(e) => {
                self.abandon(&model, &report.retried, &e).await;
                return Err(e);
            }
        }

        if report.is_idle() {
            return Ok(report);
        }

        let mut ids = report.retried.clone();
        ids.extend(report.created.iter().copied());
        report.dispatch = self.dispatch_evaluations(&model, &ids, cpu).await?;
        Ok(report)
    }

    /// Delete non-terminal evaluations that never produced output within
    /// `tolerance`; their studies become eligible again.
    pub async fn remove_orphans(&self, tolerance: Duration) -> DomainResult<u64> {
        let tolerance = chrono::Duration::from_std(tolerance)
            .map_err(|e| DomainError::ValidationFailed(format!("orphan tolerance out of range: {e}")))?;
        let removed = self.store.evaluations.delete_orphans(Utc::now() - tolerance).await?;
        if removed > 0 {
            tracing::info!(removed, "removed orphaned evaluations");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::InMemoryBus;
    use crate::adapters::dispatch::ContainerDispatcher;
    use crate::adapters::mock::{MockArchive, MockDispatcher};
    use crate::adapters::sqlite::{create_migrated_test_pool, sqlite_store};
    use crate::domain::models::{DispatcherConfig, EvalJob, EvaluationStatus, NewStudy};
    use crate::domain::ports::NotificationBus;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Fixture {
        pool: sqlx::SqlitePool,
        store: Store,
        archive: MockArchive,
        dispatcher: MockDispatcher,
        notifications: broadcast::Receiver<crate::domain::models::BusMessage>,
        orchestrator: EvaluationOrchestrator,
        model: Model,
    }

    async fn fixture(config: OrchestratorConfig) -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = sqlite_store(&pool);
        let bus = Arc::new(InMemoryBus::default());
        let notifications = bus.subscribe(&Topic::UserNotifications);
        let archive = MockArchive::new();
        let dispatcher = MockDispatcher::new();

        let model = store
            .models
            .create_model(&Model {
                id: ModelId(0),
                image: "registry/cxr:1".to_string(),
                display_name: "cxr".to_string(),
                input_type: "CXR".to_string(),
                modality: "CR".to_string(),
                has_image_output: false,
                concurrency: 1,
            })
            .await
            .unwrap();
        store.models.upsert_job(&EvalJob::new(model.id)).await.unwrap();

        let orchestrator = EvaluationOrchestrator::new(
            store.clone(),
            Arc::new(archive.clone()),
            Arc::new(dispatcher.clone()),
            Notifier::new(bus),
            config,
        );

        Fixture {
            pool,
            store,
            archive,
            dispatcher,
            notifications,
            orchestrator,
            model,
        }
    }

    async fn add_typed_study(store: &Store, archive_id: &str, study_type: &str) -> Study {
        store.studies.insert_new(&NewStudy::new(archive_id)).await.unwrap();
        store.studies.set_type(archive_id, study_type).await.unwrap().unwrap()
    }

    async fn status(store: &Store, id: EvaluationId) -> EvaluationStatus {
        store.evaluations.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_cycle_takes_oldest_studies_up_to_batch_size() {
        let f = fixture(OrchestratorConfig::default()).await;
        let a = add_typed_study(&f.store, "A", "CXR").await;
        let b = add_typed_study(&f.store, "B", "CXR").await;
        let c = add_typed_study(&f.store, "C", "CXR").await;

        let report = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();
        assert_eq!(report.created.len(), 2);

        let batches = f.dispatcher.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].study_refs, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(batches[0].evaluation_ids, report.created);
        assert_eq!(batches[0].result_queue, "eval_results");

        assert!(f.store.evaluations.find(f.model.id, a.id).await.unwrap().is_some());
        assert!(f.store.evaluations.find(f.model.id, b.id).await.unwrap().is_some());
        assert!(f.store.evaluations.find(f.model.id, c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycle_ignores_other_types() {
        let f = fixture(OrchestratorConfig::default()).await;
        add_typed_study(&f.store, "A", "MAMMO").await;

        let report = f.orchestrator.run_cycle(f.model.id, 5, false).await.unwrap();
        assert!(report.is_idle());
        assert!(matches!(report.dispatch, DispatchOutcome::Empty));
        assert!(f.dispatcher.batches().await.is_empty());
        assert!(f.archive.downloads().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_whole_batch() {
        let mut f = fixture(OrchestratorConfig::default()).await;
        for id in ["A", "B", "C"] {
            add_typed_study(&f.store, id, "CXR").await;
        }
        f.dispatcher.set_failing(true).await;

        let report = f.orchestrator.run_cycle(f.model.id, 3, false).await.unwrap();
        assert!(report.dispatch.is_failed());
        for id in &report.created {
            assert_eq!(status(&f.store, *id).await, EvaluationStatus::Failed);
        }

        // Three eval_started, then one aggregate eval_failed.
        let mut kinds = Vec::new();
        while let Ok(msg) = f.notifications.try_recv() {
            kinds.push(msg.payload["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.iter().filter(|k| *k == "eval_failed").count(), 1);
        assert_eq!(kinds.last().map(String::as_str), Some("eval_failed"));

        let retried = f.orchestrator.retry_failed(&f.model, None).await.unwrap();
        assert_eq!(retried, report.created);
    }

    #[tokio::test]
    async fn test_download_failure_fails_batch_before_dispatch() {
        let f = fixture(OrchestratorConfig::default()).await;
        add_typed_study(&f.store, "A", "CXR").await;
        add_typed_study(&f.store, "B", "CXR").await;
        f.archive.fail_download_of("B").await;

        let report = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();
        assert!(report.dispatch.is_failed());
        assert!(f.dispatcher.batches().await.is_empty());
        for id in &report.created {
            assert_eq!(status(&f.store, *id).await, EvaluationStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_retries_share_batch_cap() {
        let f = fixture(OrchestratorConfig::default()).await;
        for id in ["A", "B", "C"] {
            add_typed_study(&f.store, id, "CXR").await;
        }
        f.dispatcher.set_failing(true).await;
        let first = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();
        assert_eq!(first.created.len(), 2);

        f.dispatcher.set_failing(false).await;
        let second = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();
        assert_eq!(second.retried, first.created);
        assert!(second.created.is_empty());
        assert_eq!(f.dispatcher.batches().await[0].evaluation_ids, first.created);
    }

    #[tokio::test]
    async fn test_uncapped_retries_when_configured() {
        let f = fixture(OrchestratorConfig {
            retries_share_batch_cap: false,
            ..OrchestratorConfig::default()
        })
        .await;
        for id in ["A", "B", "C"] {
            add_typed_study(&f.store, id, "CXR").await;
        }
        f.dispatcher.set_failing(true).await;
        let first = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();

        f.dispatcher.set_failing(false).await;
        let second = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();
        assert_eq!(second.retried, first.created);
        assert_eq!(second.created.len(), 1);

        let batches = f.dispatcher.batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].evaluation_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_warm_start_publishes_to_model_queue() {
        let f = fixture(OrchestratorConfig::default()).await;
        f.store
            .models
            .upsert_job(&EvalJob::new(f.model.id).with_replicas(2))
            .await
            .unwrap();
        add_typed_study(&f.store, "A", "CXR").await;

        let report = f.orchestrator.run_cycle(f.model.id, 1, false).await.unwrap();
        assert!(matches!(
            report.dispatch,
            DispatchOutcome::Dispatched {
                mode: DispatchMode::WarmStart { replicas: 2 },
                correlation_id: None,
                ..
            }
        ));

        let published = f.dispatcher.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, f.model.id.to_string());
        assert_eq!(
            published[0].1,
            json!({"files": ["A"], "ids": [report.created[0]], "type": "EVAL"})
        );
        assert!(f.dispatcher.batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_warm_start_without_consumer_fails_batch() {
        let f = fixture(OrchestratorConfig::default()).await;
        f.store
            .models
            .upsert_job(&EvalJob::new(f.model.id).with_replicas(2))
            .await
            .unwrap();
        add_typed_study(&f.store, "A", "CXR").await;

        let bus = Arc::new(InMemoryBus::default());
        let orchestrator = EvaluationOrchestrator::new(
            f.store.clone(),
            Arc::new(f.archive.clone()),
            Arc::new(ContainerDispatcher::new(DispatcherConfig::default(), bus.clone())),
            Notifier::new(bus.clone()),
            OrchestratorConfig::default(),
        );

        let report = orchestrator.run_cycle(f.model.id, 1, false).await.unwrap();
        assert!(report.dispatch.is_failed());
        assert_eq!(status(&f.store, report.created[0]).await, EvaluationStatus::Failed);
        assert_eq!(bus.subscriber_count(&Topic::WorkerQueue(f.model.id)), 0);
    }

    #[tokio::test]
    async fn test_store_error_after_retry_fails_retried_rows() {
        let f = fixture(OrchestratorConfig::default()).await;
        add_typed_study(&f.store, "A", "CXR").await;
        f.dispatcher.set_failing(true).await;
        let first = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap();
        let failed = first.created[0];
        assert_eq!(status(&f.store, failed).await, EvaluationStatus::Failed);

        f.dispatcher.set_failing(false).await;
        add_typed_study(&f.store, "B", "CXR").await;
        sqlx::query(
            "CREATE TRIGGER reject_evaluations BEFORE INSERT ON study_evaluations
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(&f.pool)
        .await
        .unwrap();

        let err = f.orchestrator.run_cycle(f.model.id, 2, false).await.unwrap_err();
        assert!(matches!(err, DomainError::DatabaseError(_)));
        assert_eq!(status(&f.store, failed).await, EvaluationStatus::Failed);
        assert!(f.dispatcher.batches().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_is_error() {
        let f = fixture(OrchestratorConfig::default()).await;
        let err = f.orchestrator.run_cycle(ModelId(999), 1, false).await.unwrap_err();
        assert!(matches!(err, DomainError::ModelNotFound(ModelId(999))));
    }

    #[tokio::test]
    async fn test_remove_orphans_with_zero_tolerance() {
        let f = fixture(OrchestratorConfig::default()).await;
        add_typed_study(&f.store, "A", "CXR").await;
        let report = f.orchestrator.run_cycle(f.model.id, 1, false).await.unwrap();
        let id = report.created[0];

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = f.orchestrator.remove_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(f.store.evaluations.get(id).await.unwrap().is_none());

        // The study is eligible again.
        let again = f.orchestrator.run_cycle(f.model.id, 1, false).await.unwrap();
        assert_eq!(again.created.len(), 1);
    }
}
