//! Orchestration services.

pub mod archive_gc;
pub mod classification_coordinator;
pub mod evaluation_orchestrator;
pub mod experiment_controller;
pub mod notifier;
pub mod periodic_driver;
pub mod result_ingestor;

pub use archive_gc::{ArchiveGarbageCollector, GcReport};
pub use classification_coordinator::{ClassificationCoordinator, ClassificationReport};
pub use evaluation_orchestrator::{CycleReport, DispatchOutcome, EvaluationOrchestrator};
pub use experiment_controller::{ExperimentController, ExperimentProgress, EXPERIMENT_IN_FLIGHT_CEILING};
pub use notifier::Notifier;
pub use periodic_driver::{DriverJob, DriverServices, JobReport, PeriodicDriver};
pub use result_ingestor::{IngestOutcome, ResultIngestor};
