//! Port trait definitions
//!
//! Interfaces the orchestration services depend on:
//! - Store repositories for studies, models, evaluations and experiments
//! - The imaging archive client
//! - The worker dispatcher
//! - The notification bus

pub mod archive_client;
pub mod evaluation_repository;
pub mod experiment_repository;
pub mod model_repository;
pub mod notification_bus;
pub mod store;
pub mod study_repository;
pub mod worker_dispatcher;

pub use archive_client::ArchiveClient;
pub use evaluation_repository::EvaluationRepository;
pub use experiment_repository::ExperimentRepository;
pub use model_repository::ModelRepository;
pub use notification_bus::NotificationBus;
pub use store::Store;
pub use study_repository::StudyRepository;
pub use worker_dispatcher::{BatchRequest, WorkerDispatcher};
