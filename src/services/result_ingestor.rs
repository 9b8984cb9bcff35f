//! Consumer side of the notification bus.
//!
//! Workers report on three topics. Delivery is at-least-once and unordered,
//! so every handler is idempotent: a re-delivered result finds the record
//! already in its target state and is dropped, and a result arriving after
//! the evaluation moved the other way is ignored as stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    recover_evaluation_id, BusMessage, ClassificationResultMessage, EvaluationId, EvaluationResultMessage,
    EvaluationStatus, LogLineMessage, NotificationKind, ResultType, StudyEvaluation, Topic,
    TransitionOutcome,
};
use crate::domain::ports::{NotificationBus, Store};
use crate::services::notifier::Notifier;

/// Effect of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The store changed.
    Applied,
    /// Re-delivery of something already applied.
    Duplicate,
    /// The record has since moved to the opposite terminal state.
    Stale,
    /// No record matches the message id.
    Unknown,
}

impl From<TransitionOutcome> for IngestOutcome {
    fn from(outcome: TransitionOutcome) -> Self {
        match outcome {
            TransitionOutcome::Applied => Self::Applied,
            TransitionOutcome::Unchanged => Self::Duplicate,
        }
    }
}

/// Applies worker results from the bus onto the store.
#[derive(Clone)]
pub struct ResultIngestor {
    store: Store,
    bus: Arc<dyn NotificationBus>,
    notifier: Notifier,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl ResultIngestor {
    /// Ingestor reading result topics from `bus`.
    pub fn new(store: Store, bus: Arc<dyn NotificationBus>, notifier: Notifier) -> Self {
        Self {
            store,
            bus,
            notifier,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Classification result keyed by archive id.
    ///
    /// A malformed result removes a still-untyped study so the next sweep
    /// rediscovers and reclassifies it. A study that is already typed or has
    /// evaluations is left alone and the message reported as stale.
    pub async fn handle_classification(&self, payload: &Value) -> DomainResult<IngestOutcome> {
        let message: ClassificationResultMessage = match serde_json::from_value(payload.clone()) {
            Ok(m) => m,
            Err(e) => {
                let Some(archive_id) = payload.get("id").and_then(Value::as_str) else {
                    return Err(DomainError::MalformedResult(format!("classification result: {e}")));
                };
                tracing::warn!(study = archive_id, error = %e, "malformed classification result");
                if self.store.studies.remove(archive_id).await? {
                    tracing::info!(study = archive_id, "removed study for reclassification");
                    return Ok(IngestOutcome::Applied);
                }
                return Ok(match self.store.studies.get_by_archive_id(archive_id).await? {
                    Some(_) => IngestOutcome::Stale,
                    None => IngestOutcome::Unknown,
                });
            }
        };

        if let Some(existing) = self.store.studies.get_by_archive_id(&message.id).await? {
            if existing.study_type.as_deref() == Some(message.output.display.as_str()) {
                return Ok(IngestOutcome::Duplicate);
            }
        }

        match self.store.studies.set_type(&message.id, &message.output.display).await? {
            Some(study) => {
                tracing::info!(study = %study.archive_id, study_type = %message.output.display, "study classified");
                self.notifier
                    .broadcast(NotificationKind::StudyReady, format!("Study {} ready", study.archive_id));
                Ok(IngestOutcome::Applied)
            }
            None => {
                tracing::warn!(study = %message.id, "classification result for unknown study");
                Ok(IngestOutcome::Unknown)
            }
        }
    }

    /// Evaluation result `{id, output, type}`.
    pub async fn handle_evaluation_result(&self, payload: &Value) -> DomainResult<IngestOutcome> {
        let message = match EvaluationResultMessage::parse(payload) {
            Ok(m) => m,
            Err(reason) => {
                let Some(id) = recover_evaluation_id(payload) else {
                    return Err(DomainError::MalformedResult(reason));
                };
                tracing::warn!(evaluation_id = %id, reason, "malformed evaluation result");
                return self
                    .apply_failure(id, &json!({ "error": reason, "payload": payload }))
                    .await;
            }
        };

        match message.result_type {
            ResultType::Ok if message.output.is_object() => self.apply_success(&message).await,
            ResultType::Ok => {
                tracing::warn!(evaluation_id = %message.id, "successful result without an object output");
                self.apply_failure(message.id, &message.output).await
            }
            ResultType::Fail => self.apply_failure(message.id, &message.output).await,
        }
    }

    async fn load(&self, id: EvaluationId) -> DomainResult<Option<StudyEvaluation>> {
        let evaluation = self.store.evaluations.get(id).await?;
        if evaluation.is_none() {
            tracing::warn!(evaluation_id = %id, "result for unknown evaluation");
        }
        Ok(evaluation)
    }

    /// Human-readable "study with model" context for notifications.
    async fn describe(&self, evaluation: &StudyEvaluation) -> String {
        let study = match self.store.studies.get(evaluation.study_id).await {
            Ok(Some(s)) => s.archive_id,
            _ => evaluation.study_id.to_string(),
        };
        let model = match self.store.models.get_model(evaluation.model_id).await {
            Ok(Some(m)) => m.display_name,
            _ => evaluation.model_id.to_string(),
        };
        format!("{study} with model {model}")
    }

    async fn apply_success(&self, message: &EvaluationResultMessage) -> DomainResult<IngestOutcome> {
        let Some(evaluation) = self.load(message.id).await? else {
            return Ok(IngestOutcome::Unknown);
        };
        match evaluation.status {
            EvaluationStatus::Completed => return Ok(IngestOutcome::Duplicate),
            EvaluationStatus::Failed => {
                tracing::info!(evaluation_id = %message.id, "ignoring success for failed evaluation");
                return Ok(IngestOutcome::Stale);
            }
            EvaluationStatus::Queued | EvaluationStatus::Running => {}
        }

        let image = message.image_path();
        match self
            .store
            .evaluations
            .complete(message.id, &message.output, image.as_deref())
            .await
        {
            Ok(TransitionOutcome::Applied) => {
                tracing::info!(evaluation_id = %message.id, "evaluation completed");
                self.notifier.broadcast(
                    NotificationKind::NewResult,
                    format!("Finished evaluating {}", self.describe(&evaluation).await),
                );
                Ok(IngestOutcome::Applied)
            }
            Ok(TransitionOutcome::Unchanged) => Ok(IngestOutcome::Duplicate),
            Err(DomainError::InvalidStateTransition { .. }) => Ok(IngestOutcome::Stale),
            Err(DomainError::EvaluationNotFound(_)) => Ok(IngestOutcome::Unknown),
            Err(e) => Err(e),
        }
    }

    async fn apply_failure(&self, id: EvaluationId, output: &Value) -> DomainResult<IngestOutcome> {
        let Some(evaluation) = self.load(id).await? else {
            return Ok(IngestOutcome::Unknown);
        };
        match evaluation.status {
            EvaluationStatus::Failed => return Ok(IngestOutcome::Duplicate),
            EvaluationStatus::Completed => {
                tracing::info!(evaluation_id = %id, "ignoring failure for completed evaluation");
                return Ok(IngestOutcome::Stale);
            }
            EvaluationStatus::Queued | EvaluationStatus::Running => {}
        }

        self.notifier.broadcast(
            NotificationKind::EvalFailed,
            format!("Evaluation {id} of {} failed", self.describe(&evaluation).await),
        );
        match self.store.evaluations.fail(id, Some(output)).await {
            Ok(outcome) => {
                tracing::warn!(evaluation_id = %id, "evaluation failed");
                Ok(outcome.into())
            }
            Err(DomainError::InvalidStateTransition { .. }) => Ok(IngestOutcome::Stale),
            Err(DomainError::EvaluationNotFound(_)) => Ok(IngestOutcome::Unknown),
            Err(e) => Err(e),
        }
    }

    /// Log line `{id, output}`, appended while the evaluation is not terminal.
    pub async fn handle_log_line(&self, payload: &Value) -> DomainResult<IngestOutcome> {
        let line = LogLineMessage::parse(payload).map_err(DomainError::MalformedResult)?;
        if self.store.evaluations.append_stdout(line.id, &line.output).await? {
            return Ok(IngestOutcome::Applied);
        }
        Ok(match self.store.evaluations.get(line.id).await? {
            Some(_) => IngestOutcome::Stale,
            None => IngestOutcome::Unknown,
        })
    }

    /// Route a bus message to its handler.
    pub async fn handle(&self, message: &BusMessage) -> DomainResult<IngestOutcome> {
        let topic = message.topic.as_str();
        if topic == Topic::ClassificationResults.name() {
            self.handle_classification(&message.payload).await
        } else if topic == Topic::EvaluationResults.name() {
            self.handle_evaluation_result(&message.payload).await
        } else if topic == Topic::EvaluationLogLines.name() {
            self.handle_log_line(&message.payload).await
        } else {
            Err(DomainError::ValidationFailed(format!("unexpected topic {topic}")))
        }
    }

    async fn consume(&self, message: Result<BusMessage, broadcast::error::RecvError>, topic: &Topic) -> bool {
        match message {
            Ok(message) => {
                match self.handle(&message).await {
                    Ok(outcome) => tracing::debug!(topic = %topic, ?outcome, "result ingested"),
                    Err(e) => tracing::error!(topic = %topic, error = %e, "failed to ingest result"),
                }
                true
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(topic = %topic, skipped, "result consumer lagged");
                true
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::warn!(topic = %topic, "result topic closed");
                false
            }
        }
    }

    /// Subscribe to the result topics and consume them until [`stop`](Self::stop).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);

        let mut classifications = self.bus.subscribe(&Topic::ClassificationResults);
        let mut results = self.bus.subscribe(&Topic::EvaluationResults);
        let mut logs = self.bus.subscribe(&Topic::EvaluationLogLines);
        let ingestor = self.clone();

        tokio::spawn(async move {
            tracing::info!("result ingestor started");
            while ingestor.running.load(Ordering::SeqCst) {
                let alive = tokio::select! {
                    () = ingestor.shutdown.notified() => break,
                    m = classifications.recv() => ingestor.consume(m, &Topic::ClassificationResults).await,
                    m = results.recv() => ingestor.consume(m, &Topic::EvaluationResults).await,
                    m = logs.recv() => ingestor.consume(m, &Topic::EvaluationLogLines).await,
                };
                if !alive {
                    break;
                }
            }
            tracing::info!("result ingestor stopped");
        })
    }

    /// Stop consuming; the loop exits at its next wake-up.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Whether the consume loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::InMemoryBus;
    use crate::adapters::sqlite::{create_migrated_test_pool, sqlite_store};
    use crate::domain::models::{Model, ModelId, NewStudy};
    use std::time::Duration;

    struct Fixture {
        store: Store,
        bus: Arc<InMemoryBus>,
        ingestor: ResultIngestor,
        eval_id: EvaluationId,
    }

    async fn fixture() -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = sqlite_store(&pool);
        let bus = Arc::new(InMemoryBus::default());
        let ingestor = ResultIngestor::new(store.clone(), bus.clone(), Notifier::new(bus.clone()));

        let model = store
            .models
            .create_model(&Model {
                id: ModelId(0),
                image: "registry/m:1".to_string(),
                display_name: "m".to_string(),
                input_type: "CXR".to_string(),
                modality: "CR".to_string(),
                has_image_output: true,
                concurrency: 1,
            })
            .await
            .unwrap();
        let study = store.studies.insert_new(&NewStudy::new("S")).await.unwrap().unwrap();
        let eval_id = store.evaluations.create_running(model.id, &[study.id]).await.unwrap()[0];

        Fixture {
            store,
            bus,
            ingestor,
            eval_id,
        }
    }

    #[tokio::test]
    async fn test_duplicate_ok_result_is_noop() {
        let f = fixture().await;
        let payload = json!({"id": f.eval_id, "output": {"display": "normal", "image": "out.png"}, "type": "OK"});

        let first = f.ingestor.handle_evaluation_result(&payload).await.unwrap();
        assert_eq!(first, IngestOutcome::Applied);
        let after_first = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(after_first.status, EvaluationStatus::Completed);
        assert_eq!(after_first.img_output_path.as_deref(), Some("out.png"));

        let second = f.ingestor.handle_evaluation_result(&payload).await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);
        let after_second = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_fail_then_late_success_is_stale() {
        let f = fixture().await;
        let fail = json!({"id": f.eval_id, "output": {"error": "oom"}, "type": "FAIL"});
        assert_eq!(f.ingestor.handle_evaluation_result(&fail).await.unwrap(), IngestOutcome::Applied);
        assert_eq!(f.ingestor.handle_evaluation_result(&fail).await.unwrap(), IngestOutcome::Duplicate);

        let ok = json!({"id": f.eval_id, "output": {"display": "x"}, "type": "OK"});
        assert_eq!(f.ingestor.handle_evaluation_result(&ok).await.unwrap(), IngestOutcome::Stale);
        let eval = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(eval.status, EvaluationStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_object_output_fails_evaluation() {
        let f = fixture().await;
        let mut notifications = f.bus.subscribe(&Topic::UserNotifications);
        let payload = json!({"id": f.eval_id.to_string(), "output": "garbage"});

        assert_eq!(f.ingestor.handle_evaluation_result(&payload).await.unwrap(), IngestOutcome::Applied);
        let eval = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(eval.status, EvaluationStatus::Failed);
        let msg = notifications.recv().await.unwrap();
        assert_eq!(msg.payload["type"], "eval_failed");
        assert!(msg.payload["message"].as_str().unwrap().contains("S with model m"));
    }

    #[tokio::test]
    async fn test_malformed_with_recoverable_id_fails() {
        let f = fixture().await;
        let payload = json!({"id": f.eval_id, "type": "SOMETHING"});
        assert_eq!(f.ingestor.handle_evaluation_result(&payload).await.unwrap(), IngestOutcome::Applied);
        let eval = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(eval.status, EvaluationStatus::Failed);

        let err = f.ingestor.handle_evaluation_result(&json!({"output": {}})).await.unwrap_err();
        assert!(matches!(err, DomainError::MalformedResult(_)));
    }

    #[tokio::test]
    async fn test_unknown_evaluation_is_ignored() {
        let f = fixture().await;
        let payload = json!({"id": 4242, "output": {}, "type": "OK"});
        assert_eq!(f.ingestor.handle_evaluation_result(&payload).await.unwrap(), IngestOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_log_lines_append_until_terminal() {
        let f = fixture().await;
        let line = json!({"id": f.eval_id, "output": "epoch 1"});
        assert_eq!(f.ingestor.handle_log_line(&line).await.unwrap(), IngestOutcome::Applied);

        f.store.evaluations.fail(f.eval_id, None).await.unwrap();
        assert_eq!(f.ingestor.handle_log_line(&line).await.unwrap(), IngestOutcome::Stale);
        assert_eq!(
            f.ingestor.handle_log_line(&json!({"id": 999, "output": "x"})).await.unwrap(),
            IngestOutcome::Unknown
        );

        let eval = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(eval.stdout, vec!["epoch 1".to_string()]);
    }

    #[tokio::test]
    async fn test_classification_sets_type_or_removes_study() {
        let f = fixture().await;
        f.store.studies.insert_new(&NewStudy::new("T")).await.unwrap();

        let ok = json!({"id": "T", "output": {"display": "CXR"}});
        assert_eq!(f.ingestor.handle_classification(&ok).await.unwrap(), IngestOutcome::Applied);
        assert_eq!(f.ingestor.handle_classification(&ok).await.unwrap(), IngestOutcome::Duplicate);
        let study = f.store.studies.get_by_archive_id("T").await.unwrap().unwrap();
        assert_eq!(study.study_type.as_deref(), Some("CXR"));

        f.store.studies.insert_new(&NewStudy::new("U")).await.unwrap();
        let bad = json!({"id": "U", "output": "nope"});
        assert_eq!(f.ingestor.handle_classification(&bad).await.unwrap(), IngestOutcome::Applied);
        assert!(f.store.studies.get_by_archive_id("U").await.unwrap().is_none());
        assert_eq!(f.ingestor.handle_classification(&bad).await.unwrap(), IngestOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_late_malformed_classification_keeps_finished_results() {
        let f = fixture().await;
        let ok = json!({"id": "S", "output": {"display": "CXR"}});
        assert_eq!(f.ingestor.handle_classification(&ok).await.unwrap(), IngestOutcome::Applied);
        let result = json!({"id": f.eval_id, "output": {"display": "normal"}, "type": "OK"});
        assert_eq!(f.ingestor.handle_evaluation_result(&result).await.unwrap(), IngestOutcome::Applied);

        let bad = json!({"id": "S", "output": null});
        assert_eq!(f.ingestor.handle_classification(&bad).await.unwrap(), IngestOutcome::Stale);

        let study = f.store.studies.get_by_archive_id("S").await.unwrap().unwrap();
        assert_eq!(study.study_type.as_deref(), Some("CXR"));
        let eval = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap();
        assert_eq!(eval.status, EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_loop_consumes_bus_and_survives_errors() {
        let f = fixture().await;
        let handle = f.ingestor.start();

        f.bus.publish(&Topic::EvaluationResults, json!({"nonsense": true})).unwrap();
        f.bus
            .publish(&Topic::EvaluationResults, json!({"id": f.eval_id, "output": {}, "type": "OK"}))
            .unwrap();

        let mut status = EvaluationStatus::Running;
        for _ in 0..50 {
            status = f.store.evaluations.get(f.eval_id).await.unwrap().unwrap().status;
            if status == EvaluationStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, EvaluationStatus::Completed);

        f.ingestor.stop();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(!f.ingestor.is_running());
    }
}
