//! Domain models for the evaluation orchestrator.

pub mod config;
pub mod evaluation;
pub mod experiment;
pub mod ids;
pub mod messages;
pub mod model;
pub mod study;

pub use config::{
    ArchiveConfig, Config, DatabaseConfig, DispatcherConfig, LoggingConfig, OrchestratorConfig,
    SchedulerConfig,
};
pub use evaluation::{DispatchItem, EvaluationStatus, StudyEvaluation, TransitionOutcome};
pub use experiment::{Experiment, ExperimentCounts, ExperimentStatus};
pub use ids::{join_ids, EvalJobId, EvaluationId, ExperimentId, ModelId, StudyId};
pub use messages::{
    BusMessage, ClassificationResultMessage, EvaluationResultMessage, LogLineMessage,
    recover_evaluation_id, Notification, NotificationKind, ResultType, Topic, WarmStartRequest,
};
pub use model::{DispatchMode, EvalJob, Model};
pub use study::{NewStudy, Study, StudyMetadata};
