//! MedAI Runner - imaging evaluation orchestrator
//!
//! Tracks studies arriving from an imaging archive, classifies them, and
//! dispatches them to containerized inference models, reconciling results
//! that arrive asynchronously on a notification bus.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, the evaluation state machine, errors and port traits
//! - **Service Layer** (`services`): orchestration, experiments, result ingestion, the periodic driver
//! - **Adapters** (`adapters`): SQLite store, archive REST client, container dispatcher, in-process bus
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use medai_runner::cli::runtime::Runtime;
//! use medai_runner::ConfigLoader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let runtime = Runtime::build(&config).await?;
//!     runtime.ingestor.start();
//!     runtime.driver.start();
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult, FailureClass};
pub use domain::models::{
    Config, EvalJob, EvaluationStatus, Experiment, ExperimentStatus, Model, Study,
    StudyEvaluation,
};
pub use domain::ports::{
    ArchiveClient, EvaluationRepository, ExperimentRepository, ModelRepository, NotificationBus,
    Store, StudyRepository, WorkerDispatcher,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{EvaluationOrchestrator, ExperimentController, PeriodicDriver, ResultIngestor};
